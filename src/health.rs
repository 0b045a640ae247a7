// Provider health tracker.
//
// Two rolling counters per provider over a window W, using the same
// fixed-key-with-TTL pattern as the rate limiter. Once the failure
// ratio crosses the threshold on enough samples, a sticky
// `health:unhealthy:<id>` flag is set with its own TTL -- the provider
// stays parked even if traffic to it stops entirely, since nothing
// would otherwise clear a bad ratio out of the window.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::GatewayResult;
use crate::kv::SharedKv;

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct HealthStatus {
    pub success: u64,
    pub failure: u64,
    pub failure_ratio: f64,
    pub unhealthy: bool,
    pub unhealthy_until: Option<DateTime<Utc>>,
}

pub struct HealthTracker {
    kv: SharedKv,
    window: Duration,
    failure_threshold: f64,
    min_samples: u64,
}

impl HealthTracker {
    pub fn new(kv: SharedKv, window: Duration, failure_threshold: f64, min_samples: u64) -> Self {
        Self {
            kv,
            window,
            failure_threshold,
            min_samples,
        }
    }

    pub async fn record_success(&self, provider_id: &str) -> GatewayResult<()> {
        self.bump(&success_key(provider_id)).await?;
        self.maybe_mark_unhealthy(provider_id).await
    }

    pub async fn record_failure(&self, provider_id: &str) -> GatewayResult<()> {
        self.bump(&failure_key(provider_id)).await?;
        self.maybe_mark_unhealthy(provider_id).await
    }

    async fn bump(&self, key: &str) -> GatewayResult<()> {
        let count = self.kv.incr(key).await?;
        if count == 1 {
            self.kv.expire(key, self.window).await?;
        }
        Ok(())
    }

    async fn maybe_mark_unhealthy(&self, provider_id: &str) -> GatewayResult<()> {
        let success = self.read_counter(&success_key(provider_id)).await?;
        let failure = self.read_counter(&failure_key(provider_id)).await?;
        let total = success + failure;
        let failure_ratio = if total == 0 { 0.0 } else { failure as f64 / total as f64 };
        if total >= self.min_samples && failure_ratio >= self.failure_threshold {
            let until = Utc::now() + chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::zero());
            self.kv
                .set(&unhealthy_key(provider_id), &until.to_rfc3339(), self.window)
                .await?;
        }
        Ok(())
    }

    pub async fn is_healthy(&self, provider_id: &str) -> GatewayResult<bool> {
        Ok(self.kv.get(&unhealthy_key(provider_id)).await?.is_none())
    }

    pub async fn status(&self, provider_id: &str) -> GatewayResult<HealthStatus> {
        let success = self.read_counter(&success_key(provider_id)).await?;
        let failure = self.read_counter(&failure_key(provider_id)).await?;
        let total = success + failure;
        let failure_ratio = if total == 0 {
            0.0
        } else {
            failure as f64 / total as f64
        };
        let unhealthy_until = self
            .kv
            .get(&unhealthy_key(provider_id))
            .await?
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|dt| dt.with_timezone(&Utc));
        Ok(HealthStatus {
            success,
            failure,
            failure_ratio,
            unhealthy: unhealthy_until.is_some(),
            unhealthy_until,
        })
    }

    async fn read_counter(&self, key: &str) -> GatewayResult<u64> {
        Ok(self
            .kv
            .get(key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    pub async fn reset(&self, provider_id: &str) -> GatewayResult<()> {
        self.kv.del(&success_key(provider_id)).await?;
        self.kv.del(&failure_key(provider_id)).await?;
        self.kv.del(&unhealthy_key(provider_id)).await?;
        Ok(())
    }
}

fn success_key(provider_id: &str) -> String {
    format!("health:success:{provider_id}")
}

fn failure_key(provider_id: &str) -> String {
    format!("health:failure:{provider_id}")
}

fn unhealthy_key(provider_id: &str) -> String {
    format!("health:unhealthy:{provider_id}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use std::sync::Arc;

    fn tracker(threshold: f64, min_samples: u64) -> HealthTracker {
        HealthTracker::new(
            Arc::new(InMemoryKv::new()),
            Duration::from_secs(300),
            threshold,
            min_samples,
        )
    }

    #[tokio::test]
    async fn healthy_by_default() {
        let h = tracker(0.7, 10);
        assert!(h.is_healthy("provider1").await.unwrap());
    }

    #[tokio::test]
    async fn stays_healthy_below_sample_floor() {
        let h = tracker(0.7, 10);
        for _ in 0..9 {
            h.record_failure("provider1").await.unwrap();
        }
        assert!(h.is_healthy("provider1").await.unwrap());
    }

    #[tokio::test]
    async fn trips_unhealthy_past_threshold_and_floor() {
        let h = tracker(0.7, 10);
        for _ in 0..2 {
            h.record_success("provider1").await.unwrap();
        }
        for _ in 0..8 {
            h.record_failure("provider1").await.unwrap();
        }
        assert!(!h.is_healthy("provider1").await.unwrap());
        let status = h.status("provider1").await.unwrap();
        assert!((status.failure_ratio - 0.8).abs() < 1e-9);
        assert!(status.unhealthy_until.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn reset_clears_all_counters_and_flag() {
        let h = tracker(0.7, 10);
        for _ in 0..10 {
            h.record_failure("provider1").await.unwrap();
        }
        assert!(!h.is_healthy("provider1").await.unwrap());
        h.reset("provider1").await.unwrap();
        assert!(h.is_healthy("provider1").await.unwrap());
        let status = h.status("provider1").await.unwrap();
        assert_eq!(status.success, 0);
        assert_eq!(status.failure, 0);
        assert!(status.unhealthy_until.is_none());
    }
}
