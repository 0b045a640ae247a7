// Distribution engine: picks a provider for a dispatch, honoring
// health, exclusions, and weight, with the rate-limiter admission
// applied last so that a provider which turns out to be over its cap
// never actually gets served.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::GatewayResult;
use crate::health::HealthTracker;
use crate::model::Provider;
use crate::rate_limiter::{Admission, RateLimiter};

pub struct DistributionEngine {
    providers: Vec<Provider>,
    health: Arc<HealthTracker>,
    rate_limiter: Arc<RateLimiter>,
    kv: crate::kv::SharedKv,
}

impl DistributionEngine {
    pub fn new(
        providers: Vec<Provider>,
        health: Arc<HealthTracker>,
        rate_limiter: Arc<RateLimiter>,
        kv: crate::kv::SharedKv,
    ) -> Self {
        Self {
            providers,
            health,
            rate_limiter,
            kv,
        }
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    /// Selects a provider for the next attempt. Returns `None` when no
    /// candidate is both eligible and currently admitted.
    pub async fn select(&self, excluded: &HashSet<String>) -> GatewayResult<Option<String>> {
        let mut candidates = Vec::new();
        for provider in &self.providers {
            if excluded.contains(&provider.id) {
                continue;
            }
            if !self.health.is_healthy(&provider.id).await? {
                continue;
            }
            candidates.push(provider.clone());
        }

        if candidates.is_empty() {
            return Ok(None);
        }

        let total_weight: i64 = candidates.iter().map(|p| p.weight as i64).sum();

        // Smooth weighted round robin: bump every eligible candidate's
        // deficit by its weight, then try the highest-deficit candidate
        // first. Ties break on provider id, lexically.
        let mut deficits = Vec::with_capacity(candidates.len());
        for provider in &candidates {
            let deficit = self.bump_deficit(&provider.id, provider.weight as i64).await?;
            deficits.push((provider.id.clone(), deficit));
        }
        deficits.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        for (provider_id, _) in deficits {
            match self.rate_limiter.admit_provider(&provider_id).await? {
                Admission::Admitted => {
                    self.subtract_deficit(&provider_id, total_weight).await?;
                    return Ok(Some(provider_id));
                }
                Admission::RateLimited { .. } => continue,
            }
        }

        Ok(None)
    }

    async fn bump_deficit(&self, provider_id: &str, weight: i64) -> GatewayResult<i64> {
        let key = deficit_key(provider_id);
        let current: i64 = self.kv.get(&key).await?.and_then(|v| v.parse().ok()).unwrap_or(0);
        let next = current + weight;
        self.kv
            .set(&key, &next.to_string(), std::time::Duration::from_secs(3600))
            .await?;
        Ok(next)
    }

    async fn subtract_deficit(&self, provider_id: &str, amount: i64) -> GatewayResult<()> {
        let key = deficit_key(provider_id);
        let current: i64 = self.kv.get(&key).await?.and_then(|v| v.parse().ok()).unwrap_or(0);
        self.kv
            .set(&key, &(current - amount).to_string(), std::time::Duration::from_secs(3600))
            .await?;
        Ok(())
    }

    /// Resets every provider's deficit counter back to zero (admin/test use).
    pub async fn reset(&self) -> GatewayResult<()> {
        for provider in &self.providers {
            self.kv.del(&deficit_key(&provider.id)).await?;
        }
        Ok(())
    }

    /// Current WRR deficit counter per provider, for the admin read view.
    pub async fn deficit_stats(&self) -> GatewayResult<std::collections::HashMap<String, i64>> {
        let mut out = std::collections::HashMap::new();
        for provider in &self.providers {
            let current: i64 = self
                .kv
                .get(&deficit_key(&provider.id))
                .await?
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            out.insert(provider.id.clone(), current);
        }
        Ok(out)
    }
}

fn deficit_key(provider_id: &str) -> String {
    format!("distribution:deficit:{provider_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use std::time::Duration;

    fn engine(providers: Vec<Provider>) -> DistributionEngine {
        let kv: crate::kv::SharedKv = Arc::new(InMemoryKv::new());
        let health = Arc::new(HealthTracker::new(kv.clone(), Duration::from_secs(300), 0.7, 10));
        let rate_limiter = Arc::new(RateLimiter::new(kv.clone(), Duration::from_secs(1), 1000, 50));
        DistributionEngine::new(providers, health, rate_limiter, kv)
    }

    fn three_equal_providers() -> Vec<Provider> {
        vec![
            Provider::new("provider1", "http://p1"),
            Provider::new("provider2", "http://p2"),
            Provider::new("provider3", "http://p3"),
        ]
    }

    #[tokio::test]
    async fn no_provider_available_when_all_excluded() {
        let engine = engine(three_equal_providers());
        let excluded: HashSet<String> =
            ["provider1", "provider2", "provider3"].iter().map(|s| s.to_string()).collect();
        assert_eq!(engine.select(&excluded).await.unwrap(), None);
    }

    #[tokio::test]
    async fn excludes_unhealthy_and_explicitly_excluded() {
        let engine = engine(three_equal_providers());
        for _ in 0..10 {
            engine.health.record_failure("provider2").await.unwrap();
        }
        assert!(!engine.health.is_healthy("provider2").await.unwrap());

        let excluded: HashSet<String> = ["provider3".to_string()].into_iter().collect();
        let chosen = engine.select(&excluded).await.unwrap();
        assert_eq!(chosen, Some("provider1".to_string()));
    }

    #[tokio::test]
    async fn smooth_wrr_distributes_roughly_evenly_with_equal_weights() {
        let engine = engine(three_equal_providers());
        let mut counts = std::collections::HashMap::new();
        for _ in 0..300 {
            let chosen = engine.select(&HashSet::new()).await.unwrap().unwrap();
            *counts.entry(chosen).or_insert(0) += 1;
        }
        for count in counts.values() {
            assert!(*count >= 90 && *count <= 110, "count {count} not balanced");
        }
    }

    #[tokio::test]
    async fn deficit_stats_reflects_bumps_since_last_reset() {
        let engine = engine(three_equal_providers());
        engine.select(&HashSet::new()).await.unwrap();
        let stats = engine.deficit_stats().await.unwrap();
        assert_eq!(stats.len(), 3);
        engine.reset().await.unwrap();
        let stats = engine.deficit_stats().await.unwrap();
        assert!(stats.values().all(|&d| d == 0));
    }
}
