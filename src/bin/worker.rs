// Dispatch-only entrypoint: runs the worker pool, retry promoter, and
// reaper with no HTTP surface, for a deployment that scales dispatch
// capacity independently of intake.

use std::sync::Arc;
use std::time::Duration;

use sms_gateway::{
    DispatchRunner, DistributionEngine, GatewayConfig, HealthTracker, HttpProviderClient,
    InMemoryPersistence, KvTaskQueue, PostgresPersistence, RateLimiter, RedisKv, RetryScheduler,
    SharedKv, SharedPersistence, WorkerPool,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::load()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .json()
        .init();

    tracing::info!("starting dispatch worker");

    let kv: SharedKv = Arc::new(RedisKv::connect(&config.redis_url).await?);

    let persistence: SharedPersistence = match PostgresPersistence::connect(&config.database_url).await {
        Ok(pg) => Arc::new(pg),
        Err(e) => {
            tracing::warn!(error = %e, "could not reach postgres, falling back to in-memory persistence");
            Arc::new(InMemoryPersistence::new())
        }
    };

    let providers = config.providers();
    let rate_limiter = Arc::new(RateLimiter::new(
        kv.clone(),
        Duration::from_secs(config.rate_limit_window_secs),
        config.total_rate_limit as u64,
        config.provider_rate_limit as u64,
    ));
    let health = Arc::new(HealthTracker::new(
        kv.clone(),
        Duration::from_secs(config.health_window_duration_secs),
        config.health_failure_threshold,
        config.health_min_samples as u64,
    ));
    let distribution = Arc::new(DistributionEngine::new(providers, health.clone(), rate_limiter, kv.clone()));
    let queue = Arc::new(KvTaskQueue::new(
        kv.clone(),
        Duration::from_secs(config.visibility_timeout_secs),
    ));
    let retry = Arc::new(RetryScheduler::new(
        kv,
        queue.clone(),
        Duration::from_secs(config.retry_base_delay_secs),
        Duration::from_secs(config.retry_max_delay_secs),
    ));
    let provider_client = Arc::new(HttpProviderClient::new());
    let dispatch = Arc::new(DispatchRunner::new(
        persistence,
        distribution,
        health,
        provider_client,
        retry.clone(),
        Duration::from_secs(config.dispatch_timeout_secs),
        config.max_attempts,
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let pool = Arc::new(WorkerPool::new(
        queue.clone(),
        dispatch,
        config.worker_concurrency,
        Duration::from_millis(200),
    ));

    let worker_handle = tokio::spawn(pool.run(shutdown_rx.clone()));
    let promoter_handle = tokio::spawn(
        retry.run(Duration::from_millis(config.promoter_interval_ms), shutdown_rx.clone()),
    );
    let reaper_handle = tokio::spawn(sms_gateway::worker_pool::run_reaper(
        queue,
        Duration::from_secs(config.visibility_timeout_secs),
        shutdown_rx,
    ));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    let _ = tokio::join!(worker_handle, promoter_handle, reaper_handle);

    Ok(())
}
