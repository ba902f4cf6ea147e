//! Shared dependencies injected into every component.

use std::sync::Arc;

use crate::audit::{DEFAULT_CAPACITY, SecurityEventLog};
use crate::clock::{SharedClock, system_clock};
use crate::config::SecurityConfig;
use crate::store::{KeyValueStore, Keyspace};

/// Store, keyspace, clock, and event log shared by the security components.
///
/// Built once at startup and cloned into each component; cloning is cheap.
#[derive(Clone)]
pub struct CoreContext {
    /// Backing key-value store.
    pub store: Arc<dyn KeyValueStore>,
    /// Key layout.
    pub keys: Keyspace,
    /// Time source.
    pub clock: SharedClock,
    /// Security event sink.
    pub events: Arc<SecurityEventLog>,
}

impl CoreContext {
    /// Creates a context with an empty namespace and a default-sized event log.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, clock: SharedClock) -> Self {
        let events = Arc::new(SecurityEventLog::new(DEFAULT_CAPACITY, clock.clone()));
        Self {
            store,
            keys: Keyspace::default(),
            clock,
            events,
        }
    }

    /// Creates a context using the system clock.
    #[must_use]
    pub fn with_system_clock(store: Arc<dyn KeyValueStore>) -> Self {
        Self::new(store, system_clock())
    }

    /// Creates a context with the namespace and event capacity from `config`.
    #[must_use]
    pub fn from_config(
        store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
        config: &SecurityConfig,
    ) -> Self {
        let events = Arc::new(SecurityEventLog::new(
            config.event_log_capacity,
            clock.clone(),
        ));
        Self {
            store,
            keys: Keyspace::new(config.namespace.clone()),
            clock,
            events,
        }
    }

    /// Replaces the keyspace.
    #[must_use]
    pub fn with_keyspace(mut self, keys: Keyspace) -> Self {
        self.keys = keys;
        self
    }
}

impl std::fmt::Debug for CoreContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoreContext")
            .field("keys", &self.keys)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
