// Intake adapter: the one write path into the pipeline. Everything
// downstream (worker pool, retry promoter) only ever reacts to work
// this module creates.

use crate::error::{GatewayError, GatewayResult};
use crate::model::{DispatchTask, Request};
use crate::persistence::SharedPersistence;
use crate::queue::SharedTaskQueue;
use crate::rate_limiter::{Admission, SharedRateLimiter};

pub struct IntakeService {
    rate_limiter: SharedRateLimiter,
    persistence: SharedPersistence,
    queue: SharedTaskQueue,
}

impl IntakeService {
    pub fn new(rate_limiter: SharedRateLimiter, persistence: SharedPersistence, queue: SharedTaskQueue) -> Self {
        Self {
            rate_limiter,
            persistence,
            queue,
        }
    }

    /// Admits the global rate limit, persists a new `Request`, and
    /// enqueues its first `DispatchTask`. Returns the new request id, or
    /// `GlobalRateLimited` if the gateway is already at capacity this
    /// window.
    pub async fn queue_sms(&self, phone: String, text: String) -> GatewayResult<uuid::Uuid> {
        match self.rate_limiter.admit_global().await? {
            Admission::Admitted => {}
            Admission::RateLimited { count, limit } => {
                return Err(GatewayError::GlobalRateLimited { current: count, limit });
            }
        }

        let request = Request::new(phone, text);
        let id = request.id;
        self.persistence.create_request(request).await?;
        self.queue.enqueue(DispatchTask::first(id)).await?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::persistence::{InMemoryPersistence, Persistence};
    use crate::queue::{InMemoryTaskQueue, TaskQueue};
    use crate::rate_limiter::RateLimiter;
    use std::sync::Arc;
    use std::time::Duration;

    fn service(global_limit: u64) -> (IntakeService, Arc<InMemoryPersistence>, Arc<InMemoryTaskQueue>) {
        let kv: crate::kv::SharedKv = Arc::new(InMemoryKv::new());
        let rate_limiter = Arc::new(RateLimiter::new(kv, Duration::from_secs(1), global_limit, 1000));
        let persistence = Arc::new(InMemoryPersistence::new());
        let queue = Arc::new(InMemoryTaskQueue::new(Duration::from_secs(30)));
        let service = IntakeService::new(
            rate_limiter,
            persistence.clone() as SharedPersistence,
            queue.clone() as SharedTaskQueue,
        );
        (service, persistence, queue)
    }

    #[tokio::test]
    async fn accepted_request_is_persisted_and_enqueued() {
        let (service, persistence, queue) = service(10);
        let id = service.queue_sms("+15551234567".to_string(), "hi".to_string()).await.unwrap();
        assert!(persistence.get_request(id).await.unwrap().is_some());
        assert!(queue.dequeue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn over_global_cap_is_rejected_without_persisting() {
        let (service, persistence, _queue) = service(1);
        service.queue_sms("+1".to_string(), "hi".to_string()).await.unwrap();
        let err = service.queue_sms("+2".to_string(), "hi".to_string()).await.unwrap_err();
        assert!(matches!(err, GatewayError::GlobalRateLimited { limit: 1, .. }));
        assert_eq!(persistence.list_requests(Default::default()).await.unwrap().len(), 1);
    }
}
