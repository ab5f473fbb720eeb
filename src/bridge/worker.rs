//! Worker tasks that pull jobs off the shared queue.
//!
//! Each worker runs one authoring process at a time. Workers share the
//! queue receiver behind a mutex; whichever is idle takes the next job.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use super::{invocation, BridgeConfig, Outcome, QueuedJob};

/// Worker loop - runs until the bridge shuts down.
pub(super) async fn run(
    index: usize,
    config: Arc<BridgeConfig>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<QueuedJob>>>,
    shutdown: CancellationToken,
) {
    log::debug!("[Worker {index}] started");

    loop {
        let next = {
            let mut rx = queue.lock().await;
            tokio::select! {
                biased;
                () = shutdown.cancelled() => None,
                job = rx.recv() => job,
            }
        };

        let Some(queued) = next else {
            break;
        };

        let Some(job) = queued.claim() else {
            log::debug!("[Worker {index}] {} was cancelled while queued", queued.id());
            continue;
        };

        if job.cancel.is_cancelled() {
            log::info!("[Worker {index}] Skipping {}: session closed while queued", job.id);
            job.complete(Outcome::Cancelled);
            continue;
        }

        log::debug!("[Worker {index}] Running {}", job.id);
        let outcome = invocation::run(&config, &job, &shutdown).await;
        job.complete(outcome);
    }

    drain(index, &queue).await;
    log::debug!("[Worker {index}] stopped");
}

/// Complete every job still queued as cancelled.
async fn drain(index: usize, queue: &Mutex<mpsc::UnboundedReceiver<QueuedJob>>) {
    let mut rx = queue.lock().await;
    while let Ok(queued) = rx.try_recv() {
        if let Some(job) = queued.claim() {
            log::info!("[Worker {index}] Cancelling queued {} on shutdown", job.id);
            job.complete(Outcome::Cancelled);
        }
    }
}
