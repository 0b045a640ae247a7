// HTTP surface: a thin `axum::Router` wiring intake and admin to the
// outside world. Validation here is intentionally minimal -- deep
// request validation is a collaborator's concern.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::admin::{AdminService, RequestDetail};
use crate::error::GatewayError;
use crate::intake::IntakeService;
use crate::model::{Request, RequestStatus};
use crate::persistence::RequestFilter;

const MAX_TEXT_LEN: usize = 1600;

#[derive(Clone)]
pub struct AppState {
    pub intake: Arc<IntakeService>,
    pub admin: Arc<AdminService>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/sms", post(queue_sms))
        .route("/rate-limits", get(rate_limits))
        .route("/health", get(health_all))
        .route("/health/:provider", get(health_one))
        .route("/health/:provider/reset", post(health_reset))
        .route("/distribution-stats", get(distribution_stats))
        .route("/distribution/reset", post(distribution_reset))
        .route("/requests", get(list_requests))
        .route("/requests/:id", get(get_request))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct QueueSmsBody {
    phone: String,
    text: String,
}

#[derive(Debug, Serialize)]
struct QueueSmsResponse {
    request_id: Uuid,
}

async fn queue_sms(
    State(state): State<AppState>,
    Json(body): Json<QueueSmsBody>,
) -> Result<Json<QueueSmsResponse>, ApiError> {
    if body.phone.trim().is_empty() || body.text.trim().is_empty() {
        return Err(ApiError::BadRequest("phone and text must be non-empty".to_string()));
    }
    if body.text.len() > MAX_TEXT_LEN {
        return Err(ApiError::BadRequest(format!("text exceeds {MAX_TEXT_LEN} bytes")));
    }

    let request_id = state.intake.queue_sms(body.phone, body.text).await?;
    Ok(Json(QueueSmsResponse { request_id }))
}

async fn rate_limits(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.admin.rate_limit_stats().await?;
    Ok(Json(serde_json::to_value(stats).expect("ScopeStats serializes")))
}

async fn health_all(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let statuses = state.admin.health_status_all().await?;
    Ok(Json(serde_json::to_value(statuses).expect("HealthStatus serializes")))
}

async fn health_one(
    State(state): State<AppState>,
    Path(provider): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = state.admin.health_status(&provider).await?;
    Ok(Json(serde_json::to_value(status).expect("HealthStatus serializes")))
}

async fn health_reset(State(state): State<AppState>, Path(provider): Path<String>) -> Result<StatusCode, ApiError> {
    state.admin.reset_health(&provider).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn distribution_stats(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.admin.distribution_stats().await?;
    Ok(Json(serde_json::to_value(stats).expect("deficit map serializes")))
}

async fn distribution_reset(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    state.admin.reset_distribution().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ListRequestsQuery {
    status: Option<RequestStatus>,
    provider: Option<String>,
    limit: Option<usize>,
}

async fn list_requests(
    State(state): State<AppState>,
    Query(query): Query<ListRequestsQuery>,
) -> Result<Json<Vec<Request>>, ApiError> {
    let requests = state
        .admin
        .list_requests(RequestFilter {
            status: query.status,
            provider: query.provider,
            limit: query.limit,
        })
        .await?;
    Ok(Json(requests))
}

async fn get_request(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<RequestDetail>, ApiError> {
    state
        .admin
        .get_request(id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

enum ApiError {
    BadRequest(String),
    NotFound,
    Internal(GatewayError),
}

impl From<GatewayError> for ApiError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::GlobalRateLimited { .. } => ApiError::Internal(e),
            GatewayError::RequestNotFound(_) => ApiError::NotFound,
            other => ApiError::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
            ApiError::Internal(GatewayError::GlobalRateLimited { current, limit }) => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("global rate limit exceeded: {current}/{limit}"),
            ),
            ApiError::Internal(e) => {
                tracing::error!(error = %e, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}
