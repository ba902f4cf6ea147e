//! Session lifecycle management.

use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;
use rand::rngs::OsRng;
use time::OffsetDateTime;

use super::record::{NewSession, SessionRecord, SessionRejection, SessionValidation};
use crate::audit::{SecurityEventKind, Severity};
use crate::config::SessionConfig;
use crate::context::CoreContext;
use crate::error::AuthError;
use crate::fingerprint::ClientFingerprint;
use crate::store::StoreError;
use crate::AuthResult;

/// Attempts to take the per-principal creation lock before giving up.
const LOCK_ATTEMPTS: u32 = 5;

/// Pause between creation lock attempts.
const LOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Creates, validates, slides, and revokes server-side sessions.
///
/// Records live at `session:{id}` with a TTL matching `expires_at`; every
/// principal has an index set `user_sessions:{principal}` of its ids. Ids
/// are minted only in [`create`](Self::create), so a pre-chosen id can never
/// be adopted.
#[derive(Debug)]
pub struct SessionRegistry {
    config: SessionConfig,
    ctx: CoreContext,
}

impl SessionRegistry {
    /// Creates a session registry.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Configuration` if the configuration is invalid.
    pub fn new(config: SessionConfig, ctx: CoreContext) -> AuthResult<Self> {
        config
            .validate()
            .map_err(|e| AuthError::configuration(e.to_string()))?;
        Ok(Self { config, ctx })
    }

    /// Returns the session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Creates a session for `principal_id`, evicting the oldest live
    /// session if the principal is at the concurrency cap.
    ///
    /// Creation is serialized per principal by a store lock so concurrent
    /// logins cannot both slip under the cap.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be read or written,
    /// or an unavailable error if the creation lock stays busy.
    pub async fn create(
        &self,
        principal_id: &str,
        client: &ClientFingerprint,
        options: NewSession,
    ) -> AuthResult<SessionRecord> {
        let lock_key = self.ctx.keys.session_lock(principal_id);
        let lock_token = generate_session_id();
        if !self.acquire_lock(&lock_key, &lock_token).await? {
            tracing::warn!(principal_id = %principal_id, "Session creation lock busy");
            return Err(StoreError::unavailable("session creation lock busy").into());
        }

        let result = self.create_locked(principal_id, client, options).await;
        self.release_lock(&lock_key, &lock_token).await;
        result
    }

    /// Validates a session presented by `client`.
    ///
    /// Expired sessions and fingerprint mismatches destroy the record, so a
    /// later presentation from the original client fails too. On success the
    /// activity time is recorded and the expiry slides forward when within
    /// `refresh_threshold` of its end.
    pub async fn validate(&self, session_id: &str, client: &ClientFingerprint) -> SessionValidation {
        let mut record = match self.load(session_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return SessionValidation::Invalid(SessionRejection::NotFound),
            Err(e) => {
                self.record_store_failure(session_id, client, &e);
                return SessionValidation::Invalid(SessionRejection::Unavailable);
            }
        };

        if !record.is_active {
            return SessionValidation::Invalid(SessionRejection::Inactive);
        }

        let now = self.ctx.clock.now();
        if now > record.expires_at {
            self.revoke_quietly(&record).await;
            return SessionValidation::Invalid(SessionRejection::Expired);
        }

        let rejection = if self.config.bind_ip && record.client_ip != client.ip {
            Some(SessionRejection::IpMismatch)
        } else if self.config.bind_user_agent && record.user_agent_hash != client.user_agent_hash
        {
            Some(SessionRejection::UserAgentMismatch)
        } else {
            None
        };
        if let Some(reason) = rejection {
            self.ctx.events.record(
                self.ctx
                    .events
                    .event(
                        SecurityEventKind::SessionHijackSuspected,
                        record.principal_id.as_str(),
                        Severity::High,
                    )
                    .with_ip(client.ip)
                    .with_details(format!("{reason}; session={}", short_id(session_id))),
            );
            self.revoke_quietly(&record).await;
            return SessionValidation::Invalid(reason);
        }

        record.last_activity_at = now;
        let slide = record.expires_at - now <= self.config.refresh_threshold;
        if slide {
            record.expires_at += self.config.session_timeout;
        }
        match self.touch(&record, now, slide).await {
            Ok(true) => {}
            // Revoked between the read and the write.
            Ok(false) => return SessionValidation::Invalid(SessionRejection::NotFound),
            Err(e) => tracing::warn!(error = %e, "Failed to record session activity"),
        }

        SessionValidation::Valid(record)
    }

    /// Reads a session record without validating it.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be read.
    pub async fn get(&self, session_id: &str) -> AuthResult<Option<SessionRecord>> {
        self.load(session_id).await
    }

    /// Deletes a session and removes it from its principal's index.
    ///
    /// Returns `true` if the record existed. When `principal_id` is `None`
    /// the record is read to find it.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be read or written.
    pub async fn revoke(&self, session_id: &str, principal_id: Option<&str>) -> AuthResult<bool> {
        let principal_id = match principal_id {
            Some(id) => Some(id.to_string()),
            None => self.load(session_id).await?.map(|r| r.principal_id),
        };

        let store = &self.ctx.store;
        let existed = store.delete(&self.ctx.keys.session(session_id)).await?;
        if let Some(principal_id) = &principal_id {
            store
                .set_remove(&self.ctx.keys.user_sessions(principal_id), session_id)
                .await?;
        }

        if existed {
            self.ctx.events.record(
                self.ctx
                    .events
                    .event(
                        SecurityEventKind::SessionRevoked,
                        principal_id.unwrap_or_default(),
                        Severity::Low,
                    )
                    .with_details(format!("session={}", short_id(session_id))),
            );
        }
        Ok(existed)
    }

    /// Revokes every session of a principal. Returns how many existed.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be read or written.
    pub async fn revoke_all_for_principal(&self, principal_id: &str) -> AuthResult<usize> {
        let store = &self.ctx.store;
        let index_key = self.ctx.keys.user_sessions(principal_id);

        let mut revoked = 0;
        for session_id in store.set_members(&index_key).await? {
            if store.delete(&self.ctx.keys.session(&session_id)).await? {
                revoked += 1;
            }
        }
        store.delete(&index_key).await?;

        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::SessionRevoked, principal_id, Severity::Medium)
                .with_details(format!("all sessions ({revoked})")),
        );
        Ok(revoked)
    }

    /// Lists a principal's live sessions, oldest first.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be read.
    pub async fn list_sessions(&self, principal_id: &str) -> AuthResult<Vec<SessionRecord>> {
        self.live_sessions(principal_id).await
    }

    /// Removes index entries whose record is gone and records past
    /// `expires_at`. Returns how many index entries were removed.
    ///
    /// # Errors
    ///
    /// Returns `AuthError::Storage` if the store cannot be scanned.
    pub async fn cleanup_expired(&self) -> AuthResult<usize> {
        let store = &self.ctx.store;
        let prefix = self.ctx.keys.user_sessions_prefix();
        let now = self.ctx.clock.now();

        let mut removed = 0;
        for index_key in store.scan_prefix(&prefix).await? {
            for session_id in store.set_members(&index_key).await? {
                let stale = match self.load(&session_id).await {
                    Ok(Some(record)) => !record.is_live(now),
                    Ok(None) => true,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping unreadable session during cleanup");
                        false
                    }
                };
                if stale {
                    store.delete(&self.ctx.keys.session(&session_id)).await?;
                    store.set_remove(&index_key, &session_id).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Cleaned up expired sessions");
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------------

    async fn create_locked(
        &self,
        principal_id: &str,
        client: &ClientFingerprint,
        options: NewSession,
    ) -> AuthResult<SessionRecord> {
        let store = &self.ctx.store;
        let index_key = self.ctx.keys.user_sessions(principal_id);

        let mut live = self.live_sessions(principal_id).await?;
        while live.len() >= self.config.max_concurrent_sessions {
            let oldest = live.remove(0);
            store
                .delete(&self.ctx.keys.session(&oldest.session_id))
                .await?;
            store.set_remove(&index_key, &oldest.session_id).await?;
            self.ctx.events.record(
                self.ctx
                    .events
                    .event(SecurityEventKind::SessionEvicted, principal_id, Severity::Low)
                    .with_ip(oldest.client_ip)
                    .with_details(format!("session={}", short_id(&oldest.session_id))),
            );
        }

        let now = self.ctx.clock.now();
        let lifetime = if options.remember_me {
            self.config.remember_me_duration
        } else {
            self.config.session_timeout
        };
        let record = SessionRecord {
            session_id: generate_session_id(),
            principal_id: principal_id.to_string(),
            created_at: now,
            last_activity_at: now,
            expires_at: now + lifetime,
            client_ip: client.ip,
            user_agent_hash: client.user_agent_hash.clone(),
            is_active: true,
            remember_me: options.remember_me,
            bound_token_id: options.bound_token_id,
            metadata: options.metadata,
        };

        store.set_add(&index_key, &record.session_id).await?;
        self.persist(&record, now).await?;

        self.ctx.events.record(
            self.ctx
                .events
                .event(SecurityEventKind::SessionCreated, principal_id, Severity::Low)
                .with_ip(client.ip)
                .with_details(format!(
                    "session={} remember_me={}",
                    short_id(&record.session_id),
                    record.remember_me
                )),
        );
        Ok(record)
    }

    /// Loads live sessions, pruning index members whose record is gone.
    async fn live_sessions(&self, principal_id: &str) -> AuthResult<Vec<SessionRecord>> {
        let store = &self.ctx.store;
        let index_key = self.ctx.keys.user_sessions(principal_id);
        let now = self.ctx.clock.now();

        let mut live = Vec::new();
        for session_id in store.set_members(&index_key).await? {
            match self.load(&session_id).await? {
                Some(record) if record.is_live(now) => live.push(record),
                Some(_) => {}
                None => store.set_remove(&index_key, &session_id).await?,
            }
        }
        live.sort_by_key(|r| r.created_at);
        Ok(live)
    }

    async fn load(&self, session_id: &str) -> AuthResult<Option<SessionRecord>> {
        let Some(raw) = self.ctx.store.get(&self.ctx.keys.session(session_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                tracing::warn!(error = %e, "Discarding unreadable session record");
                Ok(None)
            }
        }
    }

    /// Writes a new record with a TTL matching its expiry and stretches the
    /// index TTL to cover it.
    async fn persist(&self, record: &SessionRecord, now: OffsetDateTime) -> AuthResult<()> {
        let ttl = remaining(record, now);
        if ttl.is_zero() {
            return Ok(());
        }

        let json = serde_json::to_string(record)?;
        self.ctx
            .store
            .set(&self.ctx.keys.session(&record.session_id), &json, Some(ttl))
            .await?;
        self.extend_index(record, ttl).await
    }

    /// Rewrites an existing record after a successful validation.
    ///
    /// Returns `false` if the record is gone; the write never recreates a
    /// session that was revoked concurrently.
    async fn touch(
        &self,
        record: &SessionRecord,
        now: OffsetDateTime,
        extend_index: bool,
    ) -> AuthResult<bool> {
        let ttl = remaining(record, now);
        if ttl.is_zero() {
            return Ok(true);
        }

        let json = serde_json::to_string(record)?;
        let written = self
            .ctx
            .store
            .set_xx(&self.ctx.keys.session(&record.session_id), &json, ttl)
            .await?;
        if written && extend_index {
            self.extend_index(record, ttl).await?;
        }
        Ok(written)
    }

    async fn extend_index(&self, record: &SessionRecord, ttl: Duration) -> AuthResult<()> {
        let store = &self.ctx.store;
        let index_key = self.ctx.keys.user_sessions(&record.principal_id);
        let current = store.ttl(&index_key).await?.unwrap_or(Duration::ZERO);
        if ttl > current {
            store.expire(&index_key, ttl).await?;
        }
        Ok(())
    }

    async fn revoke_quietly(&self, record: &SessionRecord) {
        if let Err(e) = self
            .revoke(&record.session_id, Some(&record.principal_id))
            .await
        {
            tracing::warn!(error = %e, "Failed to revoke rejected session");
        }
    }

    async fn acquire_lock(&self, key: &str, token: &str) -> AuthResult<bool> {
        for attempt in 0..LOCK_ATTEMPTS {
            if self
                .ctx
                .store
                .set_nx(key, token, self.config.creation_lock_ttl)
                .await?
            {
                return Ok(true);
            }
            if attempt + 1 < LOCK_ATTEMPTS {
                tokio::time::sleep(LOCK_RETRY_DELAY).await;
            }
        }
        Ok(false)
    }

    async fn release_lock(&self, key: &str, token: &str) {
        let store = &self.ctx.store;
        match store.get(key).await {
            Ok(Some(holder)) if holder == token => {
                if let Err(e) = store.delete(key).await {
                    tracing::warn!(error = %e, "Failed to release session creation lock");
                }
            }
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "Failed to read session creation lock"),
        }
    }

    fn record_store_failure(&self, session_id: &str, client: &ClientFingerprint, error: &AuthError) {
        let details = match error {
            AuthError::Storage(StoreError::Unavailable { message }) => message.clone(),
            other => other.to_string(),
        };
        self.ctx.events.record(
            self.ctx
                .events
                .event(
                    SecurityEventKind::StoreFailure,
                    format!("session={}", short_id(session_id)),
                    Severity::High,
                )
                .with_ip(client.ip)
                .with_details(details),
        );
    }
}

/// Mints an opaque session id: 32 random bytes, base64url without padding.
#[must_use]
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn remaining(record: &SessionRecord, now: OffsetDateTime) -> Duration {
    Duration::try_from(record.expires_at - now).unwrap_or(Duration::ZERO)
}

/// Leading characters of an id, safe for logs.
fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{KeyValueStore, MemoryStore, StoreResult};

    struct Fixture {
        registry: SessionRegistry,
        clock: ManualClock,
        store: MemoryStore,
        ctx: CoreContext,
    }

    fn fixture_with(configure: impl FnOnce(&mut SessionConfig)) -> Fixture {
        let clock = ManualClock::new(time::macros::datetime!(2025-03-01 09:00 UTC));
        let store = MemoryStore::with_clock(Arc::new(clock.clone()));
        let ctx = CoreContext::new(Arc::new(store.clone()), Arc::new(clock.clone()));
        let mut config = SessionConfig::default();
        configure(&mut config);
        Fixture {
            registry: SessionRegistry::new(config, ctx.clone()).unwrap(),
            clock,
            store,
            ctx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    fn client() -> ClientFingerprint {
        ClientFingerprint::new("1.2.3.4".parse().ok(), Some("Mozilla/5.0"))
    }

    #[test]
    fn test_session_ids_are_unique_and_url_safe() {
        let ids: HashSet<_> = (0..100).map(|_| generate_session_id()).collect();
        assert_eq!(ids.len(), 100);
        for id in &ids {
            assert_eq!(id.len(), 43);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[tokio::test]
    async fn test_create_and_validate() {
        let f = fixture();
        let record = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        assert_eq!(
            record.expires_at - record.created_at,
            time::Duration::hours(1)
        );

        f.clock.advance(Duration::from_secs(60));
        let result = f.registry.validate(&record.session_id, &client()).await;
        let validated = result.record().unwrap();
        assert_eq!(validated.principal_id, "u1");
        assert_eq!(validated.last_activity_at, f.clock_now());
        // Far from expiry, no slide.
        assert_eq!(validated.expires_at, record.expires_at);
        // Creation lock was released.
        assert!(
            !f.store
                .exists(&f.ctx.keys.session_lock("u1"))
                .await
                .unwrap()
        );
    }

    impl Fixture {
        fn clock_now(&self) -> OffsetDateTime {
            use crate::clock::Clock;
            self.clock.now()
        }
    }

    #[tokio::test]
    async fn test_remember_me_lifetime() {
        let f = fixture();
        let record = f
            .registry
            .create(
                "u1",
                &client(),
                NewSession {
                    remember_me: true,
                    ..NewSession::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(
            record.expires_at - record.created_at,
            time::Duration::days(30)
        );
        let index_ttl = f
            .store
            .ttl(&f.ctx.keys.user_sessions("u1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(index_ttl, Duration::from_secs(30 * 24 * 3600));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let f = fixture();
        let result = f.registry.validate("nope", &client()).await;
        assert_eq!(result.rejection(), Some(SessionRejection::NotFound));
    }

    #[tokio::test]
    async fn test_inactive_session() {
        let f = fixture();
        let mut record = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        record.is_active = false;
        f.store
            .set(
                &f.ctx.keys.session(&record.session_id),
                &serde_json::to_string(&record).unwrap(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        let result = f.registry.validate(&record.session_id, &client()).await;
        assert_eq!(result.rejection(), Some(SessionRejection::Inactive));
    }

    #[tokio::test]
    async fn test_expired_session_is_revoked() {
        let f = fixture();
        let mut record = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        // Record outlives its expires_at (e.g. written by an older instance).
        record.expires_at = f.clock_now() + Duration::from_secs(10);
        f.store
            .set(
                &f.ctx.keys.session(&record.session_id),
                &serde_json::to_string(&record).unwrap(),
                Some(Duration::from_secs(3600)),
            )
            .await
            .unwrap();

        f.clock.advance(Duration::from_secs(11));
        let result = f.registry.validate(&record.session_id, &client()).await;
        assert_eq!(result.rejection(), Some(SessionRejection::Expired));
        assert!(f.registry.get(&record.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sliding_expiry() {
        let f = fixture();
        let record = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();

        // 50 minutes in: within the 15 minute refresh threshold.
        f.clock.advance(Duration::from_secs(50 * 60));
        let result = f.registry.validate(&record.session_id, &client()).await;
        let slid = result.record().unwrap();
        assert_eq!(
            slid.expires_at,
            record.expires_at + time::Duration::hours(1)
        );

        // Past the original expiry, still valid.
        f.clock.advance(Duration::from_secs(20 * 60));
        assert!(
            f.registry
                .validate(&record.session_id, &client())
                .await
                .is_valid()
        );
    }

    #[tokio::test]
    async fn test_concurrency_cap_evicts_oldest() {
        let f = fixture_with(|c| c.max_concurrent_sessions = 3);
        let mut ids = Vec::new();
        for _ in 0..4 {
            let record = f
                .registry
                .create("u1", &client(), NewSession::default())
                .await
                .unwrap();
            ids.push(record.session_id);
            f.clock.advance(Duration::from_secs(1));
        }

        let live = f.registry.list_sessions("u1").await.unwrap();
        let live_ids: Vec<_> = live.iter().map(|r| r.session_id.clone()).collect();
        assert_eq!(live_ids, ids[1..].to_vec());
        assert_eq!(
            f.registry.validate(&ids[0], &client()).await.rejection(),
            Some(SessionRejection::NotFound)
        );
    }

    #[tokio::test]
    async fn test_user_agent_mismatch_destroys_session() {
        let f = fixture();
        let record = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();

        let thief = ClientFingerprint::new("1.2.3.4".parse().ok(), Some("curl/8.0"));
        assert_eq!(
            f.registry.validate(&record.session_id, &thief).await.rejection(),
            Some(SessionRejection::UserAgentMismatch)
        );
        assert_eq!(
            f.registry
                .validate(&record.session_id, &client())
                .await
                .rejection(),
            Some(SessionRejection::NotFound)
        );
        assert!(f.registry.list_sessions("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ip_mismatch_respects_binding_flag() {
        let f = fixture();
        let record = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        let moved = ClientFingerprint::new("9.9.9.9".parse().ok(), Some("Mozilla/5.0"));
        assert_eq!(
            f.registry.validate(&record.session_id, &moved).await.rejection(),
            Some(SessionRejection::IpMismatch)
        );

        let unbound = fixture_with(|c| c.bind_ip = false);
        let record = unbound
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        assert!(
            unbound
                .registry
                .validate(&record.session_id, &moved)
                .await
                .is_valid()
        );
    }

    #[tokio::test]
    async fn test_revoke_and_revoke_all() {
        let f = fixture();
        let a = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        let b = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        let c = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();

        assert!(f.registry.revoke(&a.session_id, None).await.unwrap());
        assert!(!f.registry.revoke(&a.session_id, None).await.unwrap());
        assert_eq!(f.registry.list_sessions("u1").await.unwrap().len(), 2);

        assert_eq!(f.registry.revoke_all_for_principal("u1").await.unwrap(), 2);
        for id in [&b.session_id, &c.session_id] {
            assert!(!f.registry.validate(id, &client()).await.is_valid());
        }
        assert!(
            !f.store
                .exists(&f.ctx.keys.user_sessions("u1"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_store_failure_is_unavailable() {
        let f = fixture();
        let record = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        f.store.set_unavailable(true);

        assert_eq!(
            f.registry
                .validate(&record.session_id, &client())
                .await
                .rejection(),
            Some(SessionRejection::Unavailable)
        );
        assert!(
            f.registry
                .create("u1", &client(), NewSession::default())
                .await
                .unwrap_err()
                .is_unavailable()
        );
    }

    #[tokio::test]
    async fn test_cleanup_prunes_dangling_members() {
        let f = fixture();
        let record = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();
        let keep = f
            .registry
            .create("u2", &client(), NewSession::default())
            .await
            .unwrap();
        // Simulate a record that expired out of the store while its index
        // entry survived.
        f.store
            .delete(&f.ctx.keys.session(&record.session_id))
            .await
            .unwrap();

        assert_eq!(f.registry.cleanup_expired().await.unwrap(), 1);
        assert!(
            f.store
                .set_members(&f.ctx.keys.user_sessions("u1"))
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(f.registry.list_sessions("u2").await.unwrap()[0], keep);
    }

    #[tokio::test]
    async fn test_busy_creation_lock_is_retryable_error() {
        let f = fixture();
        assert!(
            f.store
                .set_nx(&f.ctx.keys.session_lock("u1"), "other", Duration::from_secs(5))
                .await
                .unwrap()
        );

        let err = f
            .registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert!(f.registry.list_sessions("u1").await.unwrap().is_empty());
        // Someone else's lock is left alone.
        assert_eq!(
            f.store
                .get(&f.ctx.keys.session_lock("u1"))
                .await
                .unwrap()
                .as_deref(),
            Some("other")
        );
    }

    /// Delays the first armed read of a session record, widening the gap
    /// between validation's read and its write.
    struct SlowSessionRead {
        inner: MemoryStore,
        armed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl KeyValueStore for SlowSessionRead {
        async fn get(&self, key: &str) -> StoreResult<Option<String>> {
            let value = self.inner.get(key).await?;
            if key.starts_with("session:") && self.armed.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            Ok(value)
        }
        async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
            self.inner.set(key, value, ttl).await
        }
        async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.set_nx(key, value, ttl).await
        }
        async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.set_xx(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> StoreResult<bool> {
            self.inner.delete(key).await
        }
        async fn exists(&self, key: &str) -> StoreResult<bool> {
            self.inner.exists(key).await
        }
        async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
            self.inner.incr_with_ttl(key, ttl).await
        }
        async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
            self.inner.ttl(key).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
            self.inner.expire(key, ttl).await
        }
        async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
            self.inner.set_add(key, member).await
        }
        async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
            self.inner.set_remove(key, member).await
        }
        async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
            self.inner.set_members(key).await
        }
        async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.scan_prefix(prefix).await
        }
        async fn ping(&self) -> StoreResult<()> {
            self.inner.ping().await
        }
    }

    #[tokio::test]
    async fn test_revoke_during_validation_stays_revoked() {
        let clock = ManualClock::new(time::macros::datetime!(2025-03-01 09:00 UTC));
        let store = Arc::new(SlowSessionRead {
            inner: MemoryStore::with_clock(Arc::new(clock.clone())),
            armed: AtomicBool::new(false),
        });
        let ctx = CoreContext::new(store.clone(), Arc::new(clock.clone()));
        let registry = SessionRegistry::new(SessionConfig::default(), ctx.clone()).unwrap();

        let record = registry
            .create("u1", &client(), NewSession::default())
            .await
            .unwrap();

        store.armed.store(true, Ordering::SeqCst);
        let validating_client = client();
        let (validation, revoked) = tokio::join!(
            registry.validate(&record.session_id, &validating_client),
            async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                registry.revoke(&record.session_id, Some("u1")).await
            }
        );
        assert!(revoked.unwrap());
        assert_eq!(validation.rejection(), Some(SessionRejection::NotFound));

        assert!(
            !store
                .exists(&ctx.keys.session(&record.session_id))
                .await
                .unwrap()
        );
        assert_eq!(
            registry
                .validate(&record.session_id, &client())
                .await
                .rejection(),
            Some(SessionRejection::NotFound)
        );
        assert_eq!(registry.revoke_all_for_principal("u1").await.unwrap(), 0);
    }
}
