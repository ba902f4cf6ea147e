//! In-process key-value store.
//!
//! Single-instance backend built on `DashMap`. Expiry is lazy: an entry is
//! treated as absent once its deadline (read from the injected [`Clock`]) has
//! passed, and is dropped on the next access. Per-key atomicity comes from
//! DashMap's shard locks via the `entry` API.
//!
//! Not suitable for multi-instance deployments: state is not shared across
//! processes.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use time::OffsetDateTime;

use super::{KeyValueStore, StoreError, StoreResult};
use crate::clock::{SharedClock, system_clock};

#[derive(Debug, Clone)]
enum Value {
    Text(String),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct StoredEntry {
    value: Value,
    expires_at: Option<OffsetDateTime>,
}

impl StoredEntry {
    fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory [`KeyValueStore`].
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredEntry>>,
    clock: SharedClock,
    unavailable: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store driven by the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    /// Creates an empty store whose TTLs are measured against `clock`.
    #[must_use]
    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Simulates an outage: while set, every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    /// Returns `true` if no live entries remain.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store marked unavailable"));
        }
        Ok(())
    }

    fn deadline(&self, ttl: Duration) -> OffsetDateTime {
        self.clock.now() + time::Duration::try_from(ttl).unwrap_or(time::Duration::MAX)
    }

    /// Returns a live entry, evicting it first if it has expired.
    fn live(&self, key: &str) -> Option<StoredEntry> {
        let now = self.clock.now();
        let entry = self.entries.get(key)?;
        if entry.is_expired(now) {
            drop(entry);
            self.entries.remove_if(key, |_, e| e.is_expired(now));
            return None;
        }
        Some(entry.clone())
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.check_available()?;
        match self.live(key) {
            Some(StoredEntry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text)),
            Some(_) => Err(StoreError::command(format!("{key} holds a set"))),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        self.check_available()?;
        let expires_at = ttl.map(|ttl| self.deadline(ttl));
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                value: Value::Text(value.to_string()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let fresh = StoredEntry {
            value: Value::Text(value.to_string()),
            expires_at: Some(self.deadline(ttl)),
        };
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let deadline = self.deadline(ttl);
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.value = Value::Text(value.to_string());
                entry.expires_at = Some(deadline);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now)))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check_available()?;
        Ok(self.live(key).is_some())
    }

    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64> {
        self.check_available()?;
        let now = self.clock.now();
        let deadline = self.deadline(ttl);
        let fresh = || StoredEntry {
            value: Value::Text("1".to_string()),
            expires_at: Some(deadline),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(fresh());
                    return Ok(1);
                }
                let entry = occupied.get_mut();
                let Value::Text(text) = &mut entry.value else {
                    return Err(StoreError::command(format!("{key} holds a set")));
                };
                let current: i64 = text
                    .parse()
                    .map_err(|_| StoreError::command(format!("{key} is not an integer")))?;
                let next = current + 1;
                *text = next.to_string();
                Ok(next)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh());
                Ok(1)
            }
        }
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self.live(key).and_then(|entry| {
            entry
                .expires_at
                .map(|at| Duration::try_from(at - now).unwrap_or(Duration::ZERO))
        }))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check_available()?;
        let now = self.clock.now();
        let deadline = self.deadline(ttl);
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(deadline);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check_available()?;
        let now = self.clock.now();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredEntry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            });
        if entry.is_expired(now) {
            *entry = StoredEntry {
                value: Value::Set(HashSet::new()),
                expires_at: None,
            };
        }
        match &mut entry.value {
            Value::Set(members) => {
                members.insert(member.to_string());
                Ok(())
            }
            Value::Text(_) => Err(StoreError::command(format!("{key} holds a string"))),
        }
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        self.check_available()?;
        let now = self.clock.now();
        let now_empty = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => match &mut entry.value {
                Value::Set(members) => {
                    members.remove(member);
                    members.is_empty()
                }
                Value::Text(_) => {
                    return Err(StoreError::command(format!("{key} holds a string")));
                }
            },
            _ => false,
        };
        // Redis drops empty sets; mirror that so `exists` agrees.
        if now_empty {
            self.entries
                .remove_if(key, |_, e| matches!(&e.value, Value::Set(m) if m.is_empty()));
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        match self.live(key) {
            Some(StoredEntry {
                value: Value::Set(members),
                ..
            }) => Ok(members.into_iter().collect()),
            Some(_) => Err(StoreError::command(format!("{key} holds a string"))),
            None => Ok(Vec::new()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        self.check_available()?;
        let now = self.clock.now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.value().is_expired(now))
            .map(|e| e.key().clone())
            .collect())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}
