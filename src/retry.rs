// Retry scheduler.
//
// Delay is exponential with jitter, capped at `d_max`. The scheduled
// entry lives in a time-indexed sorted set (`queue:retry`); nothing
// ever sleeps inside a worker to wait out a retry. A promoter loop
// periodically moves due entries onto the live queue, using the KV
// store's atomic `zrem` so only one promoter instance wins each entry
// even when several run cooperatively among workers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::error::GatewayResult;
use crate::kv::SharedKv;
use crate::model::DispatchTask;
use crate::queue::SharedTaskQueue;

const RETRY_SET_KEY: &str = "queue:retry";

pub struct RetryScheduler {
    kv: SharedKv,
    queue: SharedTaskQueue,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryScheduler {
    pub fn new(kv: SharedKv, queue: SharedTaskQueue, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            kv,
            queue,
            base_delay,
            max_delay,
        }
    }

    /// Exponential backoff: `base * 2^(attempt_number - 1)`, capped at
    /// `max_delay`, jittered by +-20% to avoid lockstep retries across
    /// requests that failed at the same instant.
    pub fn compute_delay(&self, attempt_number: u32) -> Duration {
        let exponent = attempt_number.saturating_sub(1);
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let raw_ms = (base_ms * 2f64.powi(exponent as i32)).min(max_ms);

        let jitter_fraction = rand::thread_rng().gen_range(-0.2..=0.2);
        let jittered_ms = (raw_ms * (1.0 + jitter_fraction)).max(0.0);
        Duration::from_millis(jittered_ms as u64)
    }

    pub async fn schedule_retry(&self, task: DispatchTask, attempt_number: u32) -> GatewayResult<()> {
        let delay = self.compute_delay(attempt_number);
        let due_at = Utc::now().timestamp_millis() as f64 + delay.as_millis() as f64;
        let payload = serde_json::to_string(&task).expect("DispatchTask always serializes");
        self.kv.zadd(RETRY_SET_KEY, due_at, &payload).await
    }

    /// Moves every entry whose `due_at` has passed onto the live queue,
    /// removing it from the retry set first so a second promoter running
    /// concurrently can't also pick it up.
    pub async fn promote_due(&self) -> GatewayResult<usize> {
        let now = Utc::now().timestamp_millis() as f64;
        let due = self.kv.zrange_by_score(RETRY_SET_KEY, f64::MIN, now, 1000).await?;
        let mut promoted = 0;
        for payload in due {
            if !self.kv.zrem(RETRY_SET_KEY, &payload).await? {
                continue; // another promoter already won this entry
            }
            if let Ok(task) = serde_json::from_str::<DispatchTask>(&payload) {
                self.queue.enqueue(task).await?;
                promoted += 1;
            }
        }
        Ok(promoted)
    }

    /// Runs `promote_due` on `interval` until `shutdown` fires.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.promote_due().await {
                        tracing::error!(error = %e, "retry promoter tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("retry promoter shutting down");
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::queue::InMemoryTaskQueue;
    use uuid::Uuid;

    fn scheduler() -> RetryScheduler {
        RetryScheduler::new(
            Arc::new(InMemoryKv::new()),
            Arc::new(InMemoryTaskQueue::new(Duration::from_secs(30))),
            Duration::from_millis(10),
            Duration::from_millis(1000),
        )
    }

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let s = scheduler();
        // disable jitter by checking the midpoint band instead of exact values
        for attempt in 1..=8 {
            let delay = s.compute_delay(attempt);
            assert!(delay <= s.max_delay);
        }
        // attempt 1 should be roughly base_delay, attempt 8 should be near the cap
        let small = s.compute_delay(1).as_millis();
        let large = s.compute_delay(8).as_millis();
        assert!(large >= small);
    }

    #[tokio::test]
    async fn retry_set_is_monotone_nothing_promotes_before_due() {
        let s = scheduler();
        s.schedule_retry(DispatchTask::first(Uuid::new_v4()), 1).await.unwrap();
        // due_at is in the future (base delay 10ms, possibly jittered down to 8ms)
        let promoted = s.promote_due().await.unwrap();
        assert_eq!(promoted, 0);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let promoted = s.promote_due().await.unwrap();
        assert_eq!(promoted, 1);
    }
}
