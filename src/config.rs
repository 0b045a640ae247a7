// Configuration. Loaded from an optional `config/default.toml`, then
// overridden by `GATEWAY_*` environment variables -- the layering any
// deployed binary needs.

use serde::Deserialize;

use crate::error::GatewayResult;
use crate::model::Provider;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub provider1_url: String,
    pub provider2_url: String,
    pub provider3_url: String,
    pub provider_rate_limit: u32,
    pub total_rate_limit: u32,
    pub rate_limit_window_secs: u64,
    pub health_window_duration_secs: u64,
    pub health_failure_threshold: f64,
    pub health_min_samples: u32,
    pub max_attempts: u32,
    pub retry_base_delay_secs: u64,
    pub retry_max_delay_secs: u64,
    pub dispatch_timeout_secs: u64,
    pub worker_concurrency: usize,
    pub promoter_interval_ms: u64,
    pub visibility_timeout_secs: u64,
    pub redis_url: String,
    pub database_url: String,
    pub http_bind_addr: String,
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            provider1_url: "http://localhost:9001/sms".to_string(),
            provider2_url: "http://localhost:9002/sms".to_string(),
            provider3_url: "http://localhost:9003/sms".to_string(),
            provider_rate_limit: 50,
            total_rate_limit: 200,
            rate_limit_window_secs: 1,
            health_window_duration_secs: 300,
            health_failure_threshold: 0.70,
            health_min_samples: 10,
            max_attempts: 5,
            retry_base_delay_secs: 1,
            retry_max_delay_secs: 60,
            dispatch_timeout_secs: 5,
            worker_concurrency: 16,
            promoter_interval_ms: 200,
            visibility_timeout_secs: 30,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            database_url: "postgres://localhost/sms_gateway".to_string(),
            http_bind_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl GatewayConfig {
    pub fn load() -> GatewayResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("GATEWAY"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn providers(&self) -> Vec<Provider> {
        vec![
            Provider {
                id: "provider1".to_string(),
                url: self.provider1_url.clone(),
                weight: 1,
                per_second_limit: self.provider_rate_limit,
            },
            Provider {
                id: "provider2".to_string(),
                url: self.provider2_url.clone(),
                weight: 1,
                per_second_limit: self.provider_rate_limit,
            },
            Provider {
                id: "provider3".to_string(),
                url: self.provider3_url.clone(),
                weight: 1,
                per_second_limit: self.provider_rate_limit,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.provider_rate_limit, 50);
        assert_eq!(cfg.total_rate_limit, 200);
        assert_eq!(cfg.max_attempts, 5);
        assert_eq!(cfg.providers().len(), 3);
    }
}
