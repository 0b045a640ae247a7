// SMS gateway dispatch pipeline.

pub mod admin;
pub mod config;
pub mod dispatch;
pub mod distribution;
pub mod error;
pub mod health;
pub mod http;
pub mod intake;
pub mod kv;
pub mod model;
pub mod persistence;
pub mod provider;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod worker_pool;

pub use admin::AdminService;
pub use config::GatewayConfig;
pub use dispatch::DispatchRunner;
pub use distribution::DistributionEngine;
pub use error::{GatewayError, GatewayResult};
pub use health::HealthTracker;
pub use http::{router, AppState};
pub use intake::IntakeService;
pub use kv::{InMemoryKv, KvStore, RedisKv, SharedKv};
pub use model::{
    Attempt, AttemptStatus, CallOutcome, DeadLetter, DeadLetterReason, DispatchTask, Message,
    Provider, Request, RequestStatus,
};
pub use persistence::{InMemoryPersistence, Persistence, PostgresPersistence, RequestFilter, SharedPersistence};
pub use provider::{HttpProviderClient, MockProviderClient, ProviderCallResult, ProviderClient};
pub use queue::{InMemoryTaskQueue, KvTaskQueue, LeasedTask, SharedTaskQueue, TaskQueue};
pub use rate_limiter::{Admission, RateLimiter, SharedRateLimiter};
pub use retry::RetryScheduler;
pub use worker_pool::WorkerPool;
