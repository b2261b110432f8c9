//! Garbage collection of detached volumes.
//!
//! Runs entering `Aborting` (and invalidated data) leave tombstoned
//! volume refs behind. This loop pops one tombstone per tick inside a
//! callback transaction and deletes the PVC; a PVC that is already gone
//! counts as collected, while any other cluster error keeps the
//! tombstone for the next tick.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    cluster::Cluster,
    errors::KnitError,
    store::GarbageStore,
};

/// One collection tick. Returns whether a tombstone was popped.
pub async fn collect_once(
    garbage: &Arc<dyn GarbageStore>,
    cluster: &Arc<dyn Cluster>,
) -> Result<bool, KnitError> {
    let cluster = cluster.clone();
    garbage
        .pop(Box::new(move |g| {
            Box::pin(async move {
                match cluster.delete_pvc(&g.volume_ref).await {
                    Ok(()) => Ok(()),
                    // already collected
                    Err(KnitError::Missing(_)) => Ok(()),
                    Err(e) => Err(e),
                }
            })
        }))
        .await
}

/// Collect on an interval until cancelled. An empty queue or a failed
/// deletion both wait out the interval.
pub async fn run(
    garbage: Arc<dyn GarbageStore>,
    cluster: Arc<dyn Cluster>,
    interval: Duration,
    cancel: CancellationToken,
) {
    loop {
        match collect_once(&garbage, &cluster).await {
            Ok(true) => {
                tracing::debug!("collected one volume");
                continue;
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(error = %e, "garbage collection tick failed"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
