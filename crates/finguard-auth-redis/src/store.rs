//! [`KeyValueStore`] over a deadpool Redis pool.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, RedisError, Script};
use deadpool_redis::{Connection, Pool};
use finguard_auth::store::{KeyValueStore, StoreError, StoreResult};

/// INCR that applies the TTL only when it created the key.
const INCR_WITH_TTL: &str = r"
local n = redis.call('INCR', KEYS[1])
if n == 1 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return n
";

const SCAN_BATCH: usize = 200;

/// Redis-backed security state, shared by every server instance.
///
/// Each command is bounded by `timeout`; a timeout, a pool error, or an
/// I/O error surfaces as [`StoreError::Unavailable`].
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
    timeout: Duration,
    incr_script: Script,
}

impl RedisStore {
    /// Wraps an existing pool.
    pub fn new(pool: Pool, timeout: Duration) -> Self {
        Self {
            pool,
            timeout,
            incr_script: Script::new(INCR_WITH_TTL),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn conn(&self) -> StoreResult<Connection> {
        match tokio::time::timeout(self.timeout, self.pool.get()).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => Err(StoreError::unavailable(format!("redis pool: {e}"))),
            Err(_) => Err(StoreError::unavailable("redis pool: timed out")),
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, RedisError>>,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(map_redis_error(op, &e)),
            Err(_) => Err(StoreError::unavailable(format!("redis {op}: timed out"))),
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("pool_status", &self.pool.status())
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn().await?;
        self.bounded("GET", conn.get::<_, Option<String>>(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        match ttl {
            Some(ttl) => {
                self.bounded("PSETEX", conn.pset_ex::<_, _, ()>(key, value, millis(ttl)))
                    .await
            }
            None => self.bounded("SET", conn.set::<_, _, ()>(key, value)).await,
        }
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("PX").arg(millis(ttl));
        let reply: Option<String> = self.bounded("SET NX", cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("XX").arg("PX").arg(millis(ttl));
        let reply: Option<String> = self.bounded("SET XX", cmd.query_async(&mut conn)).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = self.bounded("DEL", conn.del(key)).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        self.bounded("EXISTS", conn.exists::<_, bool>(key)).await
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        let mut conn = self.conn().await?;
        let mut invocation = self.incr_script.key(key);
        invocation.arg(millis(ttl));
        self.bounded("INCR", invocation.invoke_async(&mut conn)).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        let mut conn = self.conn().await?;
        let remaining: i64 = self.bounded("PTTL", conn.pttl(key)).await?;
        // -2: missing, -1: no expiry
        Ok(u64::try_from(remaining).ok().map(Duration::from_millis))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let mut conn = self.conn().await?;
        let ms = i64::try_from(millis(ttl)).unwrap_or(i64::MAX);
        self.bounded("PEXPIRE", conn.pexpire::<_, bool>(key, ms)).await
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        self.bounded("SADD", conn.sadd::<_, _, ()>(key, member)).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        self.bounded("SREM", conn.srem::<_, _, ()>(key, member)).await
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        self.bounded("SMEMBERS", conn.smembers::<_, Vec<String>>(key))
            .await
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let pattern = format!("{}*", escape_glob(prefix));

        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH);
            let (next, batch): (u64, Vec<String>) =
                self.bounded("SCAN", cmd.query_async(&mut conn)).await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        let cmd = redis::cmd("PING");
        let _pong: String = self.bounded("PING", cmd.query_async(&mut conn)).await?;
        Ok(())
    }
}

fn millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

fn map_redis_error(op: &str, e: &RedisError) -> StoreError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal()
    {
        StoreError::unavailable(format!("redis {op}: {e}"))
    } else {
        StoreError::command(format!("redis {op}: {e}"))
    }
}

fn escape_glob(prefix: &str) -> String {
    let mut escaped = String::with_capacity(prefix.len());
    for c in prefix.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
