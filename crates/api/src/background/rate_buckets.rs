//! Periodic pruning of refilled rate-limit buckets.
//!
//! Every caller that ever sent a request owns a bucket. Buckets that have
//! refilled completely carry no state, so they are dropped on a fixed
//! interval to keep the map proportional to recently active callers.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::engine::AdmissionController;

/// How often the prune runs.
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(300);

/// Run the bucket prune loop until `cancel` is triggered.
pub async fn run(admission: Arc<AdmissionController>, interval: Duration, cancel: CancellationToken) {
    tracing::info!(interval_secs = interval.as_secs(), "Rate bucket prune job started");

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Rate bucket prune job stopping");
                break;
            }
            _ = ticker.tick() => {
                let removed = admission.prune();
                if removed > 0 {
                    tracing::debug!(removed, remaining = admission.bucket_count(), "Pruned full rate buckets");
                }
            }
        }
    }
}
