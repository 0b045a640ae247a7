// Core data model: Request, Attempt, DeadLetter, Provider, DispatchTask,
// and the retry entry they travel in.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Inclusive cap on attempts per request unless overridden by config.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    Pending,
    InFlight,
    Succeeded,
    FailedPermanent,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RequestStatus::Succeeded | RequestStatus::FailedPermanent)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    Ok,
    ErrorTransient,
    ErrorPermanent,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeadLetterReason {
    MaxAttemptsExceeded,
    ProviderRejectedPermanently,
    NoProviderAvailablePersistent,
}

/// Inbound message as accepted from the HTTP collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub phone: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub phone: String,
    pub text: String,
    pub status: RequestStatus,
    pub attempts_count: u32,
    pub last_provider_id: Option<String>,
    pub excluded_providers: HashSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Request {
    pub fn new(phone: String, text: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            phone,
            text,
            status: RequestStatus::Pending,
            attempts_count: 0,
            last_provider_id: None,
            excluded_providers: HashSet::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attempt {
    pub id: u32,
    pub request_id: Uuid,
    pub provider_id: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub http_status: Option<u16>,
    pub response_body_truncated: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub request_id: Uuid,
    pub reason: DeadLetterReason,
    pub attempts_snapshot: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub url: String,
    pub weight: u32,
    pub per_second_limit: u32,
}

impl Provider {
    pub fn new(id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            weight: 1,
            per_second_limit: 50,
        }
    }
}

/// Unit of work consumed by a worker. Deliberately carries no
/// pre-selected provider id: selection happens at dispatch time, not
/// at enqueue time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchTask {
    pub request_id: Uuid,
    pub excluded_providers: HashSet<String>,
    pub attempt_number: u32,
}

impl DispatchTask {
    pub fn first(request_id: Uuid) -> Self {
        Self {
            request_id,
            excluded_providers: HashSet::new(),
            attempt_number: 1,
        }
    }

    pub fn next_attempt(&self, excluded_providers: HashSet<String>) -> Self {
        Self {
            request_id: self.request_id,
            excluded_providers,
            attempt_number: self.attempt_number + 1,
        }
    }
}

/// Classification of an outbound provider call outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    Transient,
    Permanent,
    Timeout,
}

/// HTTP status classification rule: 2xx is OK; 408/425/429 and 5xx and
/// network/timeout/parse errors are transient; other 4xx are permanent;
/// anything unrecognized is transient.
pub fn classify_http_status(status: u16) -> CallOutcome {
    match status {
        200..=299 => CallOutcome::Ok,
        408 | 425 | 429 => CallOutcome::Transient,
        400..=499 => CallOutcome::Permanent,
        500..=599 => CallOutcome::Transient,
        _ => CallOutcome::Transient,
    }
}
