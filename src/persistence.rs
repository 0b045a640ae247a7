// Persistence layer: durable `Request`, `Attempt`, and `DeadLetter`
// storage. Migrations and schema evolution are a collaborator's
// concern; this module only issues row-level atomic reads/writes
// against whatever `Persistence` implementation is wired in.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};
use crate::model::{Attempt, DeadLetter, DeadLetterReason, Request, RequestStatus};

#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub provider: Option<String>,
    pub limit: Option<usize>,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn create_request(&self, request: Request) -> GatewayResult<()>;
    async fn mark_in_flight(&self, request_id: Uuid, provider_id: &str) -> GatewayResult<()>;
    async fn append_attempt(&self, attempt: Attempt) -> GatewayResult<()>;
    async fn mark_succeeded(&self, request_id: Uuid) -> GatewayResult<()>;
    async fn mark_failed_permanent(&self, request_id: Uuid) -> GatewayResult<()>;
    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> GatewayResult<()>;
    async fn get_request(&self, request_id: Uuid) -> GatewayResult<Option<Request>>;
    async fn list_requests(&self, filter: RequestFilter) -> GatewayResult<Vec<Request>>;
    async fn list_attempts(&self, request_id: Uuid) -> GatewayResult<Vec<Attempt>>;
}

pub type SharedPersistence = Arc<dyn Persistence>;

/// Production binding over Postgres. Writes that must not clobber a
/// terminal `Request` guard on `status NOT IN (...)` in the `UPDATE`
/// itself rather than a read-then-write round trip, so two workers
/// racing on the same row (which should never happen, since only one
/// live task exists per request) fail safe even if the invariant is
/// ever violated.
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    pub async fn connect(database_url: &str) -> GatewayResult<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn create_request(&self, request: Request) -> GatewayResult<()> {
        let excluded: Vec<String> = request.excluded_providers.into_iter().collect();
        sqlx::query(
            "INSERT INTO requests (id, phone, text, status, attempts_count, last_provider_id, excluded_providers, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(request.id)
        .bind(request.phone)
        .bind(request.text)
        .bind(request.status)
        .bind(request.attempts_count as i32)
        .bind(request.last_provider_id)
        .bind(excluded)
        .bind(request.created_at)
        .bind(request.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_in_flight(&self, request_id: Uuid, provider_id: &str) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE requests
             SET status = 'IN_FLIGHT',
                 attempts_count = attempts_count + 1,
                 last_provider_id = $2,
                 updated_at = $3
             WHERE id = $1 AND status NOT IN ('SUCCEEDED', 'FAILED_PERMANENT')",
        )
        .bind(request_id)
        .bind(provider_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_attempt(&self, attempt: Attempt) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO attempts (id, request_id, provider_id, started_at, ended_at, status, http_status, response_body_truncated, error_message)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(attempt.id as i32)
        .bind(attempt.request_id)
        .bind(attempt.provider_id)
        .bind(attempt.started_at)
        .bind(attempt.ended_at)
        .bind(attempt.status)
        .bind(attempt.http_status.map(|s| s as i32))
        .bind(attempt.response_body_truncated)
        .bind(attempt.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_succeeded(&self, request_id: Uuid) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE requests SET status = 'SUCCEEDED', updated_at = $2
             WHERE id = $1 AND status NOT IN ('SUCCEEDED', 'FAILED_PERMANENT')",
        )
        .bind(request_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed_permanent(&self, request_id: Uuid) -> GatewayResult<()> {
        sqlx::query(
            "UPDATE requests SET status = 'FAILED_PERMANENT', updated_at = $2
             WHERE id = $1 AND status NOT IN ('SUCCEEDED', 'FAILED_PERMANENT')",
        )
        .bind(request_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> GatewayResult<()> {
        sqlx::query(
            "INSERT INTO dead_letters (request_id, reason, attempts_snapshot, created_at)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(dead_letter.request_id)
        .bind(dead_letter.reason)
        .bind(dead_letter.attempts_snapshot as i32)
        .bind(dead_letter.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> GatewayResult<Option<Request>> {
        let row: Option<RequestRow> =
            sqlx::query_as("SELECT * FROM requests WHERE id = $1")
                .bind(request_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Into::into))
    }

    async fn list_requests(&self, filter: RequestFilter) -> GatewayResult<Vec<Request>> {
        // Dynamic filter composition kept deliberately simple: this path
        // backs an admin read view, not the hot dispatch path.
        let mut query = String::from("SELECT * FROM requests WHERE 1=1");
        if filter.status.is_some() {
            query.push_str(" AND status = $1");
        }
        query.push_str(" ORDER BY created_at DESC LIMIT ");
        query.push_str(&filter.limit.unwrap_or(100).to_string());

        let rows: Vec<RequestRow> = if let Some(status) = filter.status {
            sqlx::query_as(&query).bind(status).fetch_all(&self.pool).await?
        } else {
            sqlx::query_as(&query).fetch_all(&self.pool).await?
        };
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn list_attempts(&self, request_id: Uuid) -> GatewayResult<Vec<Attempt>> {
        let rows: Vec<AttemptRow> =
            sqlx::query_as("SELECT * FROM attempts WHERE request_id = $1 ORDER BY id ASC")
                .bind(request_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct RequestRow {
    id: Uuid,
    phone: String,
    text: String,
    status: RequestStatus,
    attempts_count: i32,
    last_provider_id: Option<String>,
    excluded_providers: Vec<String>,
    created_at: chrono::DateTime<Utc>,
    updated_at: chrono::DateTime<Utc>,
}

impl From<RequestRow> for Request {
    fn from(row: RequestRow) -> Self {
        Request {
            id: row.id,
            phone: row.phone,
            text: row.text,
            status: row.status,
            attempts_count: row.attempts_count as u32,
            last_provider_id: row.last_provider_id,
            excluded_providers: row.excluded_providers.into_iter().collect(),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct AttemptRow {
    id: i32,
    request_id: Uuid,
    provider_id: String,
    started_at: chrono::DateTime<Utc>,
    ended_at: chrono::DateTime<Utc>,
    status: crate::model::AttemptStatus,
    http_status: Option<i32>,
    response_body_truncated: Option<String>,
    error_message: Option<String>,
}

impl From<AttemptRow> for Attempt {
    fn from(row: AttemptRow) -> Self {
        Attempt {
            id: row.id as u32,
            request_id: row.request_id,
            provider_id: row.provider_id,
            started_at: row.started_at,
            ended_at: row.ended_at,
            status: row.status,
            http_status: row.http_status.map(|s| s as u16),
            response_body_truncated: row.response_body_truncated,
            error_message: row.error_message,
        }
    }
}

/// Test/dev binding: everything lives in process memory, guarded by a
/// single `RwLock` per table -- the durable store only ever needs
/// row-level atomicity, and contention across unrelated requests is not
/// a requirement this fake has to honor.
#[derive(Default)]
pub struct InMemoryPersistence {
    requests: RwLock<HashMap<Uuid, Request>>,
    attempts: RwLock<HashMap<Uuid, Vec<Attempt>>>,
    dead_letters: RwLock<Vec<DeadLetter>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Persistence for InMemoryPersistence {
    async fn create_request(&self, request: Request) -> GatewayResult<()> {
        self.requests.write().insert(request.id, request);
        Ok(())
    }

    async fn mark_in_flight(&self, request_id: Uuid, provider_id: &str) -> GatewayResult<()> {
        let mut requests = self.requests.write();
        let request = requests
            .get_mut(&request_id)
            .ok_or(GatewayError::RequestNotFound(request_id))?;
        if request.status.is_terminal() {
            return Ok(());
        }
        request.status = RequestStatus::InFlight;
        request.attempts_count += 1;
        request.last_provider_id = Some(provider_id.to_string());
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn append_attempt(&self, attempt: Attempt) -> GatewayResult<()> {
        self.attempts.write().entry(attempt.request_id).or_default().push(attempt);
        Ok(())
    }

    async fn mark_succeeded(&self, request_id: Uuid) -> GatewayResult<()> {
        let mut requests = self.requests.write();
        let request = requests
            .get_mut(&request_id)
            .ok_or(GatewayError::RequestNotFound(request_id))?;
        if request.status.is_terminal() {
            return Ok(());
        }
        request.status = RequestStatus::Succeeded;
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed_permanent(&self, request_id: Uuid) -> GatewayResult<()> {
        let mut requests = self.requests.write();
        let request = requests
            .get_mut(&request_id)
            .ok_or(GatewayError::RequestNotFound(request_id))?;
        if request.status.is_terminal() {
            return Ok(());
        }
        request.status = RequestStatus::FailedPermanent;
        request.updated_at = Utc::now();
        Ok(())
    }

    async fn record_dead_letter(&self, dead_letter: DeadLetter) -> GatewayResult<()> {
        self.dead_letters.write().push(dead_letter);
        Ok(())
    }

    async fn get_request(&self, request_id: Uuid) -> GatewayResult<Option<Request>> {
        Ok(self.requests.read().get(&request_id).cloned())
    }

    async fn list_requests(&self, filter: RequestFilter) -> GatewayResult<Vec<Request>> {
        let mut out: Vec<Request> = self
            .requests
            .read()
            .values()
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .filter(|r| {
                filter
                    .provider
                    .as_ref()
                    .map_or(true, |p| r.last_provider_id.as_deref() == Some(p.as_str()))
            })
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(filter.limit.unwrap_or(100));
        Ok(out)
    }

    async fn list_attempts(&self, request_id: Uuid) -> GatewayResult<Vec<Attempt>> {
        Ok(self.attempts.read().get(&request_id).cloned().unwrap_or_default())
    }
}

impl DeadLetter {
    pub fn new(request_id: Uuid, reason: DeadLetterReason, attempts_snapshot: u32) -> Self {
        Self {
            request_id,
            reason,
            attempts_snapshot,
            created_at: Utc::now(),
        }
    }
}
