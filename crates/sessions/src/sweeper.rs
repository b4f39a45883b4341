//! Background reclamation of idle sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::UploadSessionService;

/// Sweeps sessions idle for `idle_timeout` every `interval` until `cancel`
/// fires.
pub async fn run_sweeper(
    service: Arc<UploadSessionService>,
    interval: Duration,
    idle_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    debug!(?interval, ?idle_timeout, "idle sweeper started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let swept = service.sweep_idle(idle_timeout).await;
                if swept > 0 {
                    info!(swept, remaining = service.registry().len(), "idle sweep finished");
                }
            }
        }
    }

    debug!("idle sweeper stopped");
}
