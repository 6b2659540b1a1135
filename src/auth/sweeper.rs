use std::{sync::Arc, time::Duration};

use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::auth::services::AuthService;

/// Periodically deletes expired reset tokens and revocations whose token
/// has passed its own expiry. Postgres has no TTL index, so this stands in
/// for one.
pub fn spawn(auth: Arc<AuthService>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match auth.purge_expired().await {
                Ok((0, 0)) => debug!("purge: nothing expired"),
                Ok((resets, revocations)) => {
                    info!(resets, revocations, "purged expired auth records")
                }
                Err(e) => error!(error = %e, "purge failed"),
            }
        }
    })
}
