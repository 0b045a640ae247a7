// Admin / observability adapter: read-only views into rate limiting,
// health, and distribution state, plus reset operations for operators.
// No branch here decides dispatch outcomes -- it only reads or clears
// state the rate limiter, health tracker, distribution engine, and
// persistence layer already own.

use std::collections::HashMap;
use std::sync::Arc;

use crate::distribution::DistributionEngine;
use crate::error::GatewayResult;
use crate::health::{HealthStatus, HealthTracker};
use crate::model::{Attempt, Provider, Request};
use crate::persistence::{Persistence, RequestFilter};
use crate::rate_limiter::{RateLimiter, ScopeStats};

/// Request detail view: the stored `Request` plus every `Attempt`
/// recorded against it, oldest first.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RequestDetail {
    #[serde(flatten)]
    pub request: Request,
    pub attempts: Vec<Attempt>,
}

pub struct AdminService {
    rate_limiter: Arc<RateLimiter>,
    health: Arc<HealthTracker>,
    distribution: Arc<DistributionEngine>,
    persistence: Arc<dyn Persistence>,
    providers: Vec<Provider>,
}

impl AdminService {
    pub fn new(
        rate_limiter: Arc<RateLimiter>,
        health: Arc<HealthTracker>,
        distribution: Arc<DistributionEngine>,
        persistence: Arc<dyn Persistence>,
        providers: Vec<Provider>,
    ) -> Self {
        Self {
            rate_limiter,
            health,
            distribution,
            persistence,
            providers,
        }
    }

    pub async fn rate_limit_stats(&self) -> GatewayResult<HashMap<String, ScopeStats>> {
        let ids: Vec<String> = self.providers.iter().map(|p| p.id.clone()).collect();
        self.rate_limiter.stats(&ids).await
    }

    pub async fn health_status_all(&self) -> GatewayResult<HashMap<String, HealthStatus>> {
        let mut out = HashMap::new();
        for provider in &self.providers {
            out.insert(provider.id.clone(), self.health.status(&provider.id).await?);
        }
        Ok(out)
    }

    pub async fn health_status(&self, provider_id: &str) -> GatewayResult<HealthStatus> {
        self.health.status(provider_id).await
    }

    pub async fn reset_health(&self, provider_id: &str) -> GatewayResult<()> {
        self.health.reset(provider_id).await
    }

    pub async fn reset_distribution(&self) -> GatewayResult<()> {
        self.distribution.reset().await
    }

    pub async fn distribution_stats(&self) -> GatewayResult<HashMap<String, i64>> {
        self.distribution.deficit_stats().await
    }

    pub async fn list_requests(&self, filter: RequestFilter) -> GatewayResult<Vec<Request>> {
        self.persistence.list_requests(filter).await
    }

    /// Request detail including every recorded attempt, or `None` if the
    /// request doesn't exist.
    pub async fn get_request(&self, request_id: uuid::Uuid) -> GatewayResult<Option<RequestDetail>> {
        let Some(request) = self.persistence.get_request(request_id).await? else {
            return Ok(None);
        };
        let attempts = self.persistence.list_attempts(request_id).await?;
        Ok(Some(RequestDetail { request, attempts }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use crate::persistence::InMemoryPersistence;
    use crate::rate_limiter::RateLimiter;
    use std::time::Duration;

    fn service() -> AdminService {
        let kv: crate::kv::SharedKv = Arc::new(InMemoryKv::new());
        let rate_limiter = Arc::new(RateLimiter::new(kv.clone(), Duration::from_secs(1), 200, 50));
        let health = Arc::new(HealthTracker::new(kv.clone(), Duration::from_secs(300), 0.7, 10));
        let providers = vec![Provider::new("provider1", "p1"), Provider::new("provider2", "p2")];
        let distribution = Arc::new(DistributionEngine::new(providers.clone(), health.clone(), rate_limiter.clone(), kv));
        let persistence: Arc<dyn Persistence> = Arc::new(InMemoryPersistence::new());
        AdminService::new(rate_limiter, health, distribution, persistence, providers)
    }

    #[tokio::test]
    async fn health_status_all_covers_every_configured_provider() {
        let svc = service();
        let statuses = svc.health_status_all().await.unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses.values().all(|s| !s.unhealthy));
    }

    #[tokio::test]
    async fn reset_health_clears_tripped_status() {
        let svc = service();
        for _ in 0..10 {
            svc.health.record_failure("provider1").await.unwrap();
        }
        assert!(svc.health_status("provider1").await.unwrap().unhealthy);
        svc.reset_health("provider1").await.unwrap();
        assert!(!svc.health_status("provider1").await.unwrap().unhealthy);
    }

    #[tokio::test]
    async fn get_request_folds_in_every_recorded_attempt() {
        let svc = service();
        let request = Request::new("+15551234567".to_string(), "hi".to_string());
        let id = request.id;
        svc.persistence.create_request(request).await.unwrap();
        svc.persistence
            .append_attempt(crate::model::Attempt {
                id: 1,
                request_id: id,
                provider_id: "provider1".to_string(),
                started_at: chrono::Utc::now(),
                ended_at: chrono::Utc::now(),
                status: crate::model::AttemptStatus::ErrorTransient,
                http_status: Some(500),
                response_body_truncated: None,
                error_message: None,
            })
            .await
            .unwrap();

        let detail = svc.get_request(id).await.unwrap().unwrap();
        assert_eq!(detail.request.id, id);
        assert_eq!(detail.attempts.len(), 1);
    }

    #[tokio::test]
    async fn distribution_stats_reports_one_entry_per_provider() {
        let svc = service();
        let stats = svc.distribution_stats().await.unwrap();
        assert_eq!(stats.len(), 2);
    }
}
