// Rate limiter.
//
// Fixed-window, second-aligned admission. The key has no timestamp in
// it -- `rate_limit:<scope>` -- so concurrent admissions within the
// same window accumulate on one counter that expires on its own via
// TTL. A timestamped key per call would reset the count to 1 on every
// call and defeat the limiter entirely.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::GatewayResult;
use crate::kv::SharedKv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    RateLimited { count: u64, limit: u64 },
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ScopeStats {
    pub count: u64,
    pub limit: u64,
    pub remaining: i64,
}

pub struct RateLimiter {
    kv: SharedKv,
    window: Duration,
    global_limit: u64,
    provider_limit: u64,
}

impl RateLimiter {
    pub fn new(kv: SharedKv, window: Duration, global_limit: u64, provider_limit: u64) -> Self {
        Self {
            kv,
            window,
            global_limit,
            provider_limit,
        }
    }

    pub async fn admit_global(&self) -> GatewayResult<Admission> {
        self.admit("global", self.global_limit).await
    }

    pub async fn admit_provider(&self, provider_id: &str) -> GatewayResult<Admission> {
        self.admit(&provider_scope(provider_id), self.provider_limit).await
    }

    async fn admit(&self, scope: &str, limit: u64) -> GatewayResult<Admission> {
        let key = format!("rate_limit:{scope}");
        let count = self.kv.incr(&key).await?;
        if count == 1 {
            self.kv.expire(&key, self.window).await?;
        }

        if count as u64 > limit {
            // Roll back: this call never actually consumed a slot, it
            // just lost the race to find out the window was already full.
            let rolled_back = self.kv.decr(&key).await?.max(0) as u64;
            return Ok(Admission::RateLimited {
                count: rolled_back + 1,
                limit,
            });
        }
        Ok(Admission::Admitted)
    }

    pub async fn get_current_count(&self, scope: &str) -> GatewayResult<ScopeStats> {
        let limit = if scope == "global" {
            self.global_limit
        } else {
            self.provider_limit
        };
        let key = format!("rate_limit:{scope}");
        let count: u64 = self
            .kv
            .get(&key)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(ScopeStats {
            count,
            limit,
            remaining: limit as i64 - count as i64,
        })
    }

    pub async fn stats(&self, provider_ids: &[String]) -> GatewayResult<HashMap<String, ScopeStats>> {
        let mut out = HashMap::new();
        out.insert("global".to_string(), self.get_current_count("global").await?);
        for id in provider_ids {
            out.insert(id.clone(), self.get_current_count(&provider_scope(id)).await?);
        }
        Ok(out)
    }
}

fn provider_scope(provider_id: &str) -> String {
    format!("provider:{provider_id}")
}

pub type SharedRateLimiter = Arc<RateLimiter>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use test_case::test_case;

    fn limiter(limit: u64) -> RateLimiter {
        RateLimiter::new(Arc::new(InMemoryKv::new()), Duration::from_secs(1), limit, limit)
    }

    #[test_case(3, 3, true; "exactly at limit admits")]
    #[test_case(3, 4, false; "one past limit rejects")]
    #[tokio::test]
    async fn boundary_admission(limit: u64, attempts: u64, last_should_admit: bool) {
        let rl = limiter(limit);
        let mut last = Admission::Admitted;
        for _ in 0..attempts {
            last = rl.admit_global().await.unwrap();
        }
        assert_eq!(matches!(last, Admission::Admitted), last_should_admit);
    }

    #[tokio::test]
    async fn rejection_rolls_back_the_phantom_increment() {
        let rl = limiter(1);
        assert_eq!(rl.admit_global().await.unwrap(), Admission::Admitted);
        assert!(matches!(
            rl.admit_global().await.unwrap(),
            Admission::RateLimited { limit: 1, .. }
        ));
        // the rejected call must not have permanently consumed a slot
        let stats = rl.get_current_count("global").await.unwrap();
        assert_eq!(stats.count, 1);
    }

    #[tokio::test]
    async fn provider_and_global_scopes_are_independent() {
        let rl = limiter(1);
        assert_eq!(rl.admit_global().await.unwrap(), Admission::Admitted);
        assert_eq!(rl.admit_provider("provider1").await.unwrap(), Admission::Admitted);
    }
}
