//! Key-value store contract for cross-request security state.
//!
//! All state owned by the security core lives in an external store with
//! per-key TTL, atomic increment, atomic set-if-absent and replace-if-present,
//! and set membership
//! operations. The store is shared by every request handler and every server
//! instance, so per-key atomicity must come from the store itself rather
//! than from in-process locks.
//!
//! # Implementations
//!
//! - [`MemoryStore`] - in-process, single-instance (tests, local development)
//! - `finguard-auth-redis` - Redis backend for multi-instance deployments

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

pub use memory::MemoryStore;

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a key-value store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The store could not be reached (connect, pool, or timeout failure).
    #[error("Store unavailable: {message}")]
    Unavailable {
        /// Description of the failure.
        message: String,
    },

    /// The store rejected a command.
    #[error("Store command failed: {message}")]
    Command {
        /// Description of the failure.
        message: String,
    },

    /// A value could not be encoded or decoded.
    #[error("Store serialization failed: {message}")]
    Serialization {
        /// Description of the failure.
        message: String,
    },
}

impl StoreError {
    /// Creates a new `Unavailable` error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Creates a new `Command` error.
    #[must_use]
    pub fn command(message: impl Into<String>) -> Self {
        Self::Command {
            message: message.into(),
        }
    }

    /// Creates a new `Serialization` error.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Returns `true` if the store could not be reached at all.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Storage trait for security state.
///
/// Values are strings (JSON for structured records, decimal for counters).
/// A `ttl` of `None` stores the key without expiry.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Reads a key. Returns `None` if it is missing or expired.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Writes a key, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Atomically writes a key only if it does not exist.
    ///
    /// Returns `true` if the key was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Atomically replaces a key only if it already exists.
    ///
    /// Returns `false` (and writes nothing) if the key is missing, so a
    /// concurrent delete is never undone.
    async fn set_xx(&self, key: &str, value: &str, ttl: Duration) -> StoreResult<bool>;

    /// Deletes a key. Returns `true` if it existed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Returns `true` if the key exists and has not expired.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Atomically increments a counter and returns the new value.
    ///
    /// The TTL is applied only when this increment created the key, so a
    /// counting window starts at the first increment and is never extended
    /// by later ones.
    async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> StoreResult<i64>;

    /// Remaining time to live. `None` if the key is missing or persistent.
    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>>;

    /// Sets a new TTL on an existing key. Returns `false` if it is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    /// Adds a member to the set stored at `key`.
    async fn set_add(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Removes a member from the set stored at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<()>;

    /// Returns all members of the set stored at `key`.
    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>>;

    /// Enumerates live keys starting with `prefix`.
    ///
    /// Intended for dashboards and sweeps, not for request paths.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;

    /// Health probe.
    async fn ping(&self) -> StoreResult<()>;
}

/// Builds the namespaced keys used by the security core.
///
/// With an empty namespace the keys are exactly `token:blacklist:{id}`,
/// `attempts:{action}:{identifier}`, and so on; a non-empty namespace is
/// prepended with a `:` separator.
#[derive(Debug, Clone, Default)]
pub struct Keyspace {
    namespace: String,
}

impl Keyspace {
    /// Creates a keyspace under `namespace` (may be empty).
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    fn key(&self, rest: std::fmt::Arguments<'_>) -> String {
        if self.namespace.is_empty() {
            rest.to_string()
        } else {
            format!("{}:{}", self.namespace, rest)
        }
    }

    /// `token:blacklist:{token_id}`
    #[must_use]
    pub fn token_blacklist(&self, token_id: &str) -> String {
        self.key(format_args!("token:blacklist:{token_id}"))
    }

    /// `token:usage:{token_id}`
    #[must_use]
    pub fn token_usage(&self, token_id: &str) -> String {
        self.key(format_args!("token:usage:{token_id}"))
    }

    /// `token:revoked_before:{subject}`
    #[must_use]
    pub fn token_revoked_before(&self, subject: &str) -> String {
        self.key(format_args!("token:revoked_before:{subject}"))
    }

    /// `attempts:{action}:{identifier}`
    #[must_use]
    pub fn attempts(&self, action: &str, identifier: &str) -> String {
        self.key(format_args!("attempts:{action}:{identifier}"))
    }

    /// Prefix shared by every attempt counter.
    #[must_use]
    pub fn attempts_prefix(&self) -> String {
        self.key(format_args!("attempts:"))
    }

    /// `lockout:{action}:{identifier}`
    #[must_use]
    pub fn lockout(&self, action: &str, identifier: &str) -> String {
        self.key(format_args!("lockout:{action}:{identifier}"))
    }

    /// `session:{session_id}`
    #[must_use]
    pub fn session(&self, session_id: &str) -> String {
        self.key(format_args!("session:{session_id}"))
    }

    /// `user_sessions:{principal_id}`
    #[must_use]
    pub fn user_sessions(&self, principal_id: &str) -> String {
        self.key(format_args!("user_sessions:{principal_id}"))
    }

    /// Prefix shared by every per-principal session index.
    #[must_use]
    pub fn user_sessions_prefix(&self) -> String {
        self.key(format_args!("user_sessions:"))
    }

    /// `session_lock:{principal_id}`
    #[must_use]
    pub fn session_lock(&self, principal_id: &str) -> String {
        self.key(format_args!("session_lock:{principal_id}"))
    }

    /// Strips the namespace and a key family prefix, returning the remainder.
    #[must_use]
    pub fn strip<'k>(&self, family_prefix: &str, key: &'k str) -> Option<&'k str> {
        key.strip_prefix(family_prefix)
    }
}
