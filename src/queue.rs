// Task queue & worker pool plumbing.
//
// `enqueue` pushes a `DispatchTask` onto the live list. `dequeue` pops
// one and, for the durable binding, moves it into a visibility-timeout
// set rather than handing it out unconditionally -- a worker that
// crashes mid-dispatch leaves the task there, and `reap_expired` puts
// it back on the live queue so the `Request` doesn't stay `IN_FLIGHT`
// forever.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::GatewayResult;
use crate::kv::SharedKv;
use crate::model::DispatchTask;

const LIVE_QUEUE_KEY: &str = "queue:dispatch";
const IN_FLIGHT_KEY: &str = "queue:in_flight";

/// A task handed out by `dequeue`, carrying the token the caller must
/// present to `ack`/`nack` it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeasedTask {
    pub token: String,
    pub task: DispatchTask,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, task: DispatchTask) -> GatewayResult<()>;
    async fn dequeue(&self) -> GatewayResult<Option<LeasedTask>>;
    async fn ack(&self, leased: &LeasedTask) -> GatewayResult<()>;
    async fn nack(&self, leased: &LeasedTask) -> GatewayResult<()>;
    /// Returns tasks whose visibility timeout has elapsed back onto the
    /// live queue. Returns how many were reaped.
    async fn reap_expired(&self) -> GatewayResult<usize>;
}

pub type SharedTaskQueue = Arc<dyn TaskQueue>;

/// Durable binding: the live list and the in-flight set both live in
/// the shared KV store, keyed by its sorted-set primitives.
pub struct KvTaskQueue {
    kv: SharedKv,
    visibility_timeout: Duration,
}

impl KvTaskQueue {
    pub fn new(kv: SharedKv, visibility_timeout: Duration) -> Self {
        Self {
            kv,
            visibility_timeout,
        }
    }
}

#[async_trait]
impl TaskQueue for KvTaskQueue {
    async fn enqueue(&self, task: DispatchTask) -> GatewayResult<()> {
        let payload = serde_json::to_string(&task).expect("DispatchTask always serializes");
        // the live list is modeled as a sorted set ordered by enqueue time;
        // it only needs FIFO-ish ordering, not a strict guarantee
        let score = Utc::now().timestamp_millis() as f64;
        self.kv.zadd(LIVE_QUEUE_KEY, score, &payload).await
    }

    async fn dequeue(&self) -> GatewayResult<Option<LeasedTask>> {
        let due = self.kv.zrange_by_score(LIVE_QUEUE_KEY, f64::MIN, f64::MAX, 1).await?;
        let Some(payload) = due.into_iter().next() else {
            return Ok(None);
        };
        if !self.kv.zrem(LIVE_QUEUE_KEY, &payload).await? {
            // someone else already took it
            return Ok(None);
        }

        let token = Uuid::new_v4().to_string();
        let deadline = Utc::now().timestamp_millis() as f64
            + self.visibility_timeout.as_millis() as f64;
        let in_flight_member = format!("{token}\u{1}{payload}");
        self.kv.zadd(IN_FLIGHT_KEY, deadline, &in_flight_member).await?;

        let task: DispatchTask =
            serde_json::from_str(&payload).expect("only KvTaskQueue writes this payload shape");
        Ok(Some(LeasedTask { token, task }))
    }

    async fn ack(&self, leased: &LeasedTask) -> GatewayResult<()> {
        let payload = serde_json::to_string(&leased.task).expect("DispatchTask always serializes");
        let member = format!("{}\u{1}{}", leased.token, payload);
        self.kv.zrem(IN_FLIGHT_KEY, &member).await?;
        Ok(())
    }

    async fn nack(&self, leased: &LeasedTask) -> GatewayResult<()> {
        // put it back immediately rather than waiting for the visibility
        // timeout to expire
        self.ack(leased).await?;
        self.enqueue(leased.task.clone()).await
    }

    async fn reap_expired(&self) -> GatewayResult<usize> {
        let now = Utc::now().timestamp_millis() as f64;
        let expired = self.kv.zrange_by_score(IN_FLIGHT_KEY, f64::MIN, now, 1000).await?;
        let mut reaped = 0;
        for member in expired {
            if !self.kv.zrem(IN_FLIGHT_KEY, &member).await? {
                continue; // someone else reaped it first
            }
            if let Some((_, payload)) = member.split_once('\u{1}') {
                if let Ok(task) = serde_json::from_str::<DispatchTask>(payload) {
                    self.enqueue(task).await?;
                    reaped += 1;
                }
            }
        }
        Ok(reaped)
    }
}

/// Test binding: a plain FIFO deque with an in-process visibility set.
pub struct InMemoryTaskQueue {
    live: Mutex<VecDeque<DispatchTask>>,
    in_flight: Mutex<Vec<(String, DispatchTask, std::time::Instant)>>,
    visibility_timeout: Duration,
}

impl InMemoryTaskQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            live: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(Vec::new()),
            visibility_timeout,
        }
    }
}

#[async_trait]
impl TaskQueue for InMemoryTaskQueue {
    async fn enqueue(&self, task: DispatchTask) -> GatewayResult<()> {
        self.live.lock().await.push_back(task);
        Ok(())
    }

    async fn dequeue(&self) -> GatewayResult<Option<LeasedTask>> {
        let Some(task) = self.live.lock().await.pop_front() else {
            return Ok(None);
        };
        let token = Uuid::new_v4().to_string();
        self.in_flight
            .lock()
            .await
            .push((token.clone(), task.clone(), std::time::Instant::now()));
        Ok(Some(LeasedTask { token, task }))
    }

    async fn ack(&self, leased: &LeasedTask) -> GatewayResult<()> {
        self.in_flight.lock().await.retain(|(t, _, _)| t != &leased.token);
        Ok(())
    }

    async fn nack(&self, leased: &LeasedTask) -> GatewayResult<()> {
        self.ack(leased).await?;
        self.enqueue(leased.task.clone()).await
    }

    async fn reap_expired(&self) -> GatewayResult<usize> {
        let mut in_flight = self.in_flight.lock().await;
        let now = std::time::Instant::now();
        let mut reaped = Vec::new();
        in_flight.retain(|(_, task, started)| {
            if now.duration_since(*started) >= self.visibility_timeout {
                reaped.push(task.clone());
                false
            } else {
                true
            }
        });
        drop(in_flight);
        let count = reaped.len();
        for task in reaped {
            self.enqueue(task).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dequeue_without_ack_is_reaped_after_timeout() {
        let q = InMemoryTaskQueue::new(Duration::from_millis(10));
        q.enqueue(DispatchTask::first(Uuid::new_v4())).await.unwrap();
        let leased = q.dequeue().await.unwrap().unwrap();
        assert!(q.dequeue().await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let reaped = q.reap_expired().await.unwrap();
        assert_eq!(reaped, 1);

        let redelivered = q.dequeue().await.unwrap();
        assert!(redelivered.is_some());
        assert_eq!(redelivered.unwrap().task.request_id, leased.task.request_id);
    }

    #[tokio::test]
    async fn ack_removes_from_in_flight_so_it_is_not_reaped() {
        let q = InMemoryTaskQueue::new(Duration::from_millis(1));
        q.enqueue(DispatchTask::first(Uuid::new_v4())).await.unwrap();
        let leased = q.dequeue().await.unwrap().unwrap();
        q.ack(&leased).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(q.reap_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nack_makes_task_immediately_available_again() {
        let q = InMemoryTaskQueue::new(Duration::from_secs(30));
        q.enqueue(DispatchTask::first(Uuid::new_v4())).await.unwrap();
        let leased = q.dequeue().await.unwrap().unwrap();
        q.nack(&leased).await.unwrap();
        assert!(q.dequeue().await.unwrap().is_some());
    }
}
