//! Background job: revoke subscriptions past their expiry.
//!
//! Safe to run next to `fleetctl sweep` or another instance of itself; a
//! subscription is only counted by whichever sweep flips it.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time;

use crate::lifecycle::SubscriptionManager;

/// Spawn the periodic sweep. Call this once at startup.
pub fn spawn(manager: Arc<SubscriptionManager>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = time::interval(every);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match manager.sweep_expired().await {
                Ok(0) => tracing::debug!("expiry sweep: nothing to revoke"),
                Ok(n) => tracing::info!(revoked = n, "expiry sweep finished"),
                Err(e) => tracing::error!("expiry sweep failed: {}", e),
            }
        }
    })
}
