//! Background task keeping the document cache within the memory target.

use std::{sync::Arc, time::Duration};

use tokio_util::{sync::CancellationToken, task::AbortOnDropHandle};
use tracing::{Instrument, debug, trace, warn};

use crate::cache::DocumentCache;

/// Default pause between two memory checks.
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(15);

/// Longest wait for the task to finish on shutdown.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// Periodically runs the cache eviction check until cancelled.
#[derive(Debug)]
pub struct MemoryMonitor {
    done: CancellationToken,
    handle: AbortOnDropHandle<()>,
}

impl MemoryMonitor {
    /// Spawns the monitor. It stops when `done` is cancelled.
    pub fn spawn(cache: Arc<DocumentCache>, interval: Duration, done: CancellationToken) -> Self {
        let task_done = done.clone();
        let handle = tokio::task::spawn(
            async move {
                loop {
                    let evicted = cache.check();
                    if evicted > 0 {
                        debug!("evicted {evicted} cached documents");
                    }
                    tokio::select! {
                        biased;
                        _ = task_done.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }
                }
                trace!("memory monitor stopped");
            }
            .instrument(tracing::debug_span!("memory_monitor")),
        );
        Self {
            done,
            handle: AbortOnDropHandle::new(handle),
        }
    }

    /// Stops the monitor, waiting a bounded time for the running check to finish.
    pub async fn shutdown(self) {
        self.done.cancel();
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => warn!("memory monitor failed: {err}"),
            Err(_) => warn!("memory monitor did not stop in time, aborting it"),
        }
    }
}
