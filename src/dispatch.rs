// Dispatch task: the unit of work that turns an accepted request into
// at most one provider delivery per attempt.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::distribution::DistributionEngine;
use crate::error::GatewayResult;
use crate::health::HealthTracker;
use crate::model::{
    Attempt, AttemptStatus, CallOutcome, DeadLetter, DeadLetterReason, DispatchTask, Provider,
};
use crate::persistence::SharedPersistence;
use crate::provider::ProviderClient;
use crate::retry::RetryScheduler;

pub struct DispatchRunner {
    persistence: SharedPersistence,
    distribution: Arc<DistributionEngine>,
    health: Arc<HealthTracker>,
    provider_client: Arc<dyn ProviderClient>,
    retry: Arc<RetryScheduler>,
    dispatch_timeout: Duration,
    max_attempts: u32,
}

impl DispatchRunner {
    pub fn new(
        persistence: SharedPersistence,
        distribution: Arc<DistributionEngine>,
        health: Arc<HealthTracker>,
        provider_client: Arc<dyn ProviderClient>,
        retry: Arc<RetryScheduler>,
        dispatch_timeout: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            persistence,
            distribution,
            health,
            provider_client,
            retry,
            dispatch_timeout,
            max_attempts,
        }
    }

    fn provider_by_id(&self, provider_id: &str) -> Option<&Provider> {
        self.distribution.providers().iter().find(|p| p.id == provider_id)
    }

    /// Runs one dispatch task to completion. The caller is responsible
    /// for acking/nacking the queue entry around this call; `run` never
    /// touches the queue directly.
    pub async fn run(&self, task: DispatchTask) -> GatewayResult<()> {
        let Some(request) = self.persistence.get_request(task.request_id).await? else {
            tracing::warn!(request_id = %task.request_id, "dispatch task for unknown request, dropping");
            return Ok(());
        };

        if request.status.is_terminal() {
            tracing::debug!(request_id = %task.request_id, "request already terminal, dropping task");
            return Ok(());
        }

        let selected = self.distribution.select(&task.excluded_providers).await?;

        let Some(provider_id) = selected else {
            // step 3: no provider available right now -- retry with the
            // same exclusion set, it may just be a transient capacity gap
            return self.hand_to_retry(task.clone(), task.attempt_number).await;
        };

        let Some(provider) = self.provider_by_id(&provider_id).cloned() else {
            tracing::error!(provider_id, "selected provider has no static config, dropping");
            return Ok(());
        };

        self.persistence.mark_in_flight(task.request_id, &provider.id).await?;
        let attempts_count = request.attempts_count + 1;

        let started_at = Utc::now();
        let result = self
            .provider_client
            .send(&provider.url, &request.phone, &request.text, self.dispatch_timeout)
            .await;
        let ended_at = Utc::now();

        let attempt_status = match result.outcome {
            CallOutcome::Ok => AttemptStatus::Ok,
            CallOutcome::Transient => AttemptStatus::ErrorTransient,
            CallOutcome::Permanent => AttemptStatus::ErrorPermanent,
            CallOutcome::Timeout => AttemptStatus::Timeout,
        };

        self.persistence
            .append_attempt(Attempt {
                id: attempts_count,
                request_id: task.request_id,
                provider_id: provider.id.clone(),
                started_at,
                ended_at,
                status: attempt_status,
                http_status: result.http_status,
                response_body_truncated: result.response_body_truncated.clone(),
                error_message: result.error_message.clone(),
            })
            .await?;

        match result.outcome {
            CallOutcome::Ok => {
                self.health.record_success(&provider.id).await?;
                self.persistence.mark_succeeded(task.request_id).await?;
                Ok(())
            }
            CallOutcome::Permanent => {
                self.health.record_success(&provider.id).await?;
                self.persistence.mark_failed_permanent(task.request_id).await?;
                self.persistence
                    .record_dead_letter(DeadLetter::new(
                        task.request_id,
                        DeadLetterReason::ProviderRejectedPermanently,
                        attempts_count,
                    ))
                    .await?;
                Ok(())
            }
            CallOutcome::Transient | CallOutcome::Timeout => {
                self.health.record_failure(&provider.id).await?;
                if attempts_count >= self.max_attempts {
                    self.persistence.mark_failed_permanent(task.request_id).await?;
                    self.persistence
                        .record_dead_letter(DeadLetter::new(
                            task.request_id,
                            DeadLetterReason::MaxAttemptsExceeded,
                            attempts_count,
                        ))
                        .await?;
                    return Ok(());
                }

                let mut excluded = task.excluded_providers.clone();
                excluded.insert(provider.id.clone());
                // A failed provider stays excluded for subsequent attempts
                // until the exclusion set would empty the candidate pool --
                // with few providers configured, naive accumulation would
                // strand the request in an endless no-provider-available
                // retry loop before it ever reaches the attempt cap.
                if self.distribution.providers().iter().all(|p| excluded.contains(&p.id)) {
                    excluded.clear();
                }
                let next_task = task.next_attempt(excluded);
                self.hand_to_retry(next_task, task.attempt_number + 1).await
            }
        }
    }

    async fn hand_to_retry(&self, task: DispatchTask, attempt_number: u32) -> GatewayResult<()> {
        self.retry.schedule_retry(task, attempt_number).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distribution::DistributionEngine;
    use crate::kv::InMemoryKv;
    use crate::model::{DeadLetterReason, Request, RequestStatus};
    use crate::persistence::{InMemoryPersistence, Persistence};
    use crate::provider::{MockProviderClient, ProviderCallResult};
    use crate::queue::InMemoryTaskQueue;
    use std::collections::HashSet;
    use std::sync::Arc;

    struct Fixture {
        runner: DispatchRunner,
        persistence: Arc<InMemoryPersistence>,
        mock_client: Arc<MockProviderClient>,
        max_attempts: u32,
    }

    fn fixture(max_attempts: u32) -> Fixture {
        let kv: crate::kv::SharedKv = Arc::new(InMemoryKv::new());
        let persistence = Arc::new(InMemoryPersistence::new());
        let health = Arc::new(HealthTracker::new(kv.clone(), Duration::from_secs(300), 0.7, 10));
        let rate_limiter = Arc::new(crate::rate_limiter::RateLimiter::new(
            kv.clone(),
            Duration::from_secs(1),
            1000,
            1000,
        ));
        let providers = vec![
            Provider::new("provider1", "p1"),
            Provider::new("provider2", "p2"),
            Provider::new("provider3", "p3"),
        ];
        let distribution = Arc::new(DistributionEngine::new(providers, health.clone(), rate_limiter, kv.clone()));
        let mock_client = Arc::new(MockProviderClient::new());
        let queue: crate::queue::SharedTaskQueue = Arc::new(InMemoryTaskQueue::new(Duration::from_secs(30)));
        let retry = Arc::new(RetryScheduler::new(
            kv.clone(),
            queue,
            Duration::from_millis(1),
            Duration::from_millis(5),
        ));
        let runner = DispatchRunner::new(
            persistence.clone() as SharedPersistence,
            distribution,
            health,
            mock_client.clone() as Arc<dyn ProviderClient>,
            retry,
            Duration::from_secs(5),
            max_attempts,
        );
        Fixture {
            runner,
            persistence,
            mock_client,
            max_attempts,
        }
    }

    #[tokio::test]
    async fn happy_path_marks_succeeded_with_one_attempt() {
        let f = fixture(5);
        f.mock_client.always_ok("p1").await;
        f.mock_client.always_ok("p2").await;
        f.mock_client.always_ok("p3").await;

        let request = Request::new("+15551234567".to_string(), "hi".to_string());
        let id = request.id;
        f.persistence.create_request(request).await.unwrap();

        f.runner.run(DispatchTask::first(id)).await.unwrap();

        let stored = f.persistence.get_request(id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::Succeeded);
        assert_eq!(f.persistence.list_attempts(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn terminal_request_is_a_noop() {
        let f = fixture(5);
        let request = Request::new("+15551234567".to_string(), "hi".to_string());
        let id = request.id;
        f.persistence.create_request(request).await.unwrap();
        f.persistence.mark_succeeded(id).await.unwrap();

        f.runner.run(DispatchTask::first(id)).await.unwrap();
        assert_eq!(f.persistence.list_attempts(id).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn exhaustion_dead_letters_at_max_attempts() {
        let f = fixture(2);
        for url in ["p1", "p2", "p3"] {
            for _ in 0..5 {
                f.mock_client
                    .push(
                        url,
                        ProviderCallResult {
                            outcome: CallOutcome::Transient,
                            http_status: Some(500),
                            response_body_truncated: None,
                            error_message: None,
                        },
                    )
                    .await;
            }
        }

        let request = Request::new("+15551234567".to_string(), "hi".to_string());
        let id = request.id;
        f.persistence.create_request(request).await.unwrap();

        let mut task = DispatchTask::first(id);
        for _ in 0..f.max_attempts {
            f.runner.run(task.clone()).await.unwrap();
            let mut excluded: HashSet<String> = task.excluded_providers.clone();
            if let Some(stored) = f.persistence.get_request(id).await.unwrap() {
                if let Some(last) = &stored.last_provider_id {
                    excluded.insert(last.clone());
                }
            }
            task = task.next_attempt(excluded);
        }

        let stored = f.persistence.get_request(id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::FailedPermanent);
        assert_eq!(f.persistence.list_attempts(id).await.unwrap().len(), f.max_attempts as usize);
    }

    #[tokio::test]
    async fn permanent_failure_stops_immediately_without_retry() {
        let f = fixture(5);
        f.mock_client
            .push(
                "p1",
                ProviderCallResult {
                    outcome: CallOutcome::Permanent,
                    http_status: Some(404),
                    response_body_truncated: None,
                    error_message: None,
                },
            )
            .await;
        f.mock_client.always_ok("p2").await;
        f.mock_client.always_ok("p3").await;

        let request = Request::new("+15551234567".to_string(), "hi".to_string());
        let id = request.id;
        f.persistence.create_request(request).await.unwrap();

        // force selection onto p1 by excluding the others
        let excluded: HashSet<String> = ["provider2".to_string(), "provider3".to_string()].into_iter().collect();
        f.runner
            .run(DispatchTask {
                request_id: id,
                excluded_providers: excluded,
                attempt_number: 1,
            })
            .await
            .unwrap();

        let stored = f.persistence.get_request(id).await.unwrap().unwrap();
        assert_eq!(stored.status, RequestStatus::FailedPermanent);
        assert_eq!(f.persistence.list_attempts(id).await.unwrap().len(), 1);
    }
}
