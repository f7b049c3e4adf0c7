//! HTTP route handlers
//!
//! Every handler decodes the request, delegates to a core service, and
//! encodes the response. No business logic lives here.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::data::JobStatus;
use crate::error::AppError;

/// All routes, composed onto the app state.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/outbox", post(dispatch_activity))
        .route("/federation/pull", get(federation_pull))
        .route("/federation/jobs", get(federation_jobs))
        .route("/timelines/home", get(home_timeline))
        .route("/.well-known/lagoon", get(well_known))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
}

/// POST /outbox: dispatch one activity.
///
/// Always returns the tagged dispatch report; validation and
/// authorization failures surface as a structured `{error}` body with a
/// 4xx status, not an exception.
async fn dispatch_activity(
    State(state): State<AppState>,
    Json(raw): Json<serde_json::Value>,
) -> Response {
    let report = state.dispatcher.dispatch(&raw).await;
    let status = if report.error.is_some() {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    (status, Json(report)).into_response()
}

#[derive(Debug, Deserialize)]
struct PullQuery {
    #[serde(default)]
    since: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

/// GET /federation/pull: token-verified incremental pull.
async fn federation_pull(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PullQuery>,
) -> Result<Json<Vec<serde_json::Value>>, AppError> {
    let token = bearer_token(&headers)?;
    let verified = state
        .pull
        .verify_pull_token(&token, &state.config.server.base_url())
        .await?;

    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    let records = state
        .db
        .list_activities_for_domain(&verified.domain, query.since.as_deref(), limit)
        .await?;

    tracing::info!(
        peer = %verified.domain,
        returned = records.len(),
        "Served federation pull"
    );

    let activities = records
        .into_iter()
        .map(|record| {
            serde_json::json!({
                "id": record.id,
                "type": record.activity_type,
                "actorId": record.actor_id,
                "object": record.object_ref,
                "target": record.target,
                "to": record.to_token,
                "summary": record.summary,
                "createdAt": record.created_at.to_rfc3339(),
            })
        })
        .collect();

    Ok(Json(activities))
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
}

/// Operator view of a delivery job; internal hashes stay internal.
#[derive(Debug, Serialize)]
struct DeliveryJobView {
    id: String,
    object_id: String,
    status: String,
    attempts: i64,
    max_attempts: i64,
    next_attempt_at: DateTime<Utc>,
    last_error: Option<String>,
    counts: serde_json::Value,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

/// GET /federation/jobs: delivery queue status for operators.
async fn federation_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<Vec<DeliveryJobView>>, AppError> {
    let status = match query.status.as_deref() {
        None => None,
        Some(raw) => Some(JobStatus::from_str(raw).ok_or_else(|| {
            AppError::Validation(format!("Unknown job status: {}", raw))
        })?),
    };

    let limit = query.limit.unwrap_or(50).clamp(1, 200);
    let jobs = state.db.list_delivery_jobs(status, limit).await?;

    let views = jobs
        .into_iter()
        .map(|job| DeliveryJobView {
            counts: serde_json::from_str(&job.counts)
                .unwrap_or(serde_json::Value::Null),
            id: job.id,
            object_id: job.object_id,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            next_attempt_at: job.next_attempt_at,
            last_error: job.last_error,
            created_at: job.created_at,
            completed_at: job.completed_at,
        })
        .collect();

    Ok(Json(views))
}

#[derive(Debug, Deserialize)]
struct TimelineQuery {
    viewer: String,
    #[serde(default)]
    limit: Option<i64>,
}

/// Timeline entry as exposed to clients.
///
/// `local_circle_id` is bookkeeping and deliberately absent.
#[derive(Debug, Serialize)]
struct TimelineEntryView {
    object_id: String,
    object_type: String,
    reason: String,
    scope: String,
    created_at: DateTime<Utc>,
    snapshot: serde_json::Value,
}

/// GET /timelines/home: a local viewer's materialized timeline.
async fn home_timeline(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<Vec<TimelineEntryView>>, AppError> {
    let viewer = state
        .db
        .get_actor(&query.viewer)
        .await?
        .filter(|actor| actor.is_local)
        .ok_or_else(|| AppError::NotFound(format!("local actor {}", query.viewer)))?;

    let limit = query.limit.unwrap_or(40).clamp(1, 100);
    let entries = state.db.home_timeline(&viewer.id, limit).await?;

    let views = entries
        .into_iter()
        .map(|entry| TimelineEntryView {
            snapshot: serde_json::from_str(&entry.snapshot)
                .unwrap_or(serde_json::Value::Null),
            object_id: entry.object_id,
            object_type: entry.object_type,
            reason: entry.reason,
            scope: entry.scope,
            created_at: entry.created_at,
        })
        .collect();

    Ok(Json(views))
}

/// GET /.well-known/lagoon: instance descriptor with the public key
/// peers use to verify our pull tokens.
async fn well_known(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "domain": state.config.server.domain,
        "baseUrl": state.config.server.base_url(),
        "subject": state.subject,
        "publicKeyPem": state.public_key_pem,
    }))
}

async fn health_check() -> &'static str {
    "OK"
}

async fn metrics() -> String {
    crate::metrics::render()
}

fn bearer_token(headers: &HeaderMap) -> Result<String, AppError> {
    let header = headers
        .get("authorization")
        .ok_or(AppError::Unauthorized)?
        .to_str()
        .map_err(|_| AppError::Unauthorized)?;

    header
        .strip_prefix("Bearer ")
        .map(str::to_string)
        .ok_or(AppError::Unauthorized)
}
