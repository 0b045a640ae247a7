// Worker pool: the loop that drains the task queue and hands each
// lease to the dispatch runner, bounded to `worker_concurrency` tasks
// in flight at once via a semaphore rather than spawning one task per
// worker thread.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::dispatch::DispatchRunner;
use crate::queue::SharedTaskQueue;

pub struct WorkerPool {
    queue: SharedTaskQueue,
    dispatch: Arc<DispatchRunner>,
    concurrency: usize,
    poll_interval: Duration,
}

impl WorkerPool {
    pub fn new(
        queue: SharedTaskQueue,
        dispatch: Arc<DispatchRunner>,
        concurrency: usize,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            dispatch,
            concurrency,
            poll_interval,
        }
    }

    /// Runs until `shutdown` fires. A dequeued task that has nothing to
    /// do (empty queue) backs off for `poll_interval` instead of busy-spinning.
    pub async fn run(self: Arc<Self>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.concurrency));
        loop {
            if *shutdown.borrow() {
                break;
            }

            let leased = tokio::select! {
                leased = self.queue.dequeue() => leased,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };

            match leased {
                Ok(Some(leased)) => {
                    let permit = permits.clone().acquire_owned().await.expect("semaphore never closed");
                    let queue = self.queue.clone();
                    let dispatch = self.dispatch.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        match dispatch.run(leased.task.clone()).await {
                            Ok(()) => {
                                if let Err(e) = queue.ack(&leased).await {
                                    tracing::error!(error = %e, "failed to ack dispatched task");
                                }
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "dispatch task failed, nacking");
                                if let Err(e) = queue.nack(&leased).await {
                                    tracing::error!(error = %e, "failed to nack dispatched task");
                                }
                            }
                        }
                    });
                }
                Ok(None) => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Err(e) => {
                    tracing::error!(error = %e, "dequeue failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
        tracing::info!("worker pool shutting down");
    }
}

/// Runs `queue.reap_expired` on `interval` until `shutdown` fires.
pub async fn run_reaper(
    queue: SharedTaskQueue,
    interval: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match queue.reap_expired().await {
                    Ok(n) if n > 0 => tracing::warn!(reaped = n, "reaped expired in-flight tasks"),
                    Ok(_) => {}
                    Err(e) => tracing::error!(error = %e, "reaper tick failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    tracing::info!("reaper shutting down");
                    return;
                }
            }
        }
    }
}
