//! Periodic session sweeping.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, warn};

use crate::session::SessionRegistry;

/// Spawns a task that calls [`SessionRegistry::cleanup_expired`] every
/// `period`. The first sweep runs after one full period.
///
/// Abort the returned handle to stop it.
pub fn spawn_cleanup_task(registry: Arc<SessionRegistry>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval fires immediately; skip that tick
        ticker.tick().await;

        info!(period = ?period, "Session cleanup task started");

        loop {
            ticker.tick().await;

            match registry.cleanup_expired().await {
                Ok(0) => debug!("Session sweep found nothing to remove"),
                Ok(removed) => info!(removed, "Removed expired sessions"),
                Err(e) => warn!(error = %e, "Session sweep failed"),
            }
        }
    })
}
