//! The compute resource: a long-lived process that accepts job handler connections over a feed
//! and runs every handler's jobs on one shared worker pool, deduplicating concurrent and
//! previously-seen work by fingerprint. See [`resource`] for the connection/tick-loop
//! architecture and [`result_policy`] for the inline-vs-stored result size policy.

pub mod resource;
pub mod result_policy;

pub use resource::{JobOutcome, ResourceJobManager, HANDLER_KEEPALIVE_TIMEOUT};

use hither_container::ContainerRunner;
use hither_feed::Feed;
use hither_store::ContentStore;
use slog::{info, Logger};
use std::future::Future;
use std::sync::Arc;

/// Starts the compute resource and runs it until `shutdown` resolves. `shutdown` is typically a
/// unix signal future built by the `hither-broker` binary; tests can pass anything that
/// completes when they're done observing the resource.
pub async fn run(
    feed: Arc<dyn Feed>,
    store: Arc<dyn ContentStore>,
    runner: Arc<dyn ContainerRunner>,
    num_workers: usize,
    log: Logger,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let manager = ResourceJobManager::spawn(feed, store, runner, num_workers, log.clone())?;
    let registry = tokio::spawn(resource::registry_task(manager));
    tokio::select! {
        result = registry => {
            if let Ok(Err(e)) = result {
                return Err(e);
            }
        }
        _ = shutdown => {
            info!(log, "shutdown signal received");
        }
    }
    Ok(())
}
