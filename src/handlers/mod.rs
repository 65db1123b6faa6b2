//! HTTP surface. Handlers stay thin: extract, delegate to the service
//! layer, map the result. Errors become responses through `AppError`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use crate::db::queries;
use crate::domain::EventEnvelope;
use crate::error::AppError;
use crate::gateway::SubmitRequest;
use crate::simulator::AcceptRequest;
use crate::webhook::{self, WebhookPayload, SIGNATURE_HEADER};
use crate::AppState;

// --- Gateway side ---

pub async fn submit_transaction(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.gateway.submit(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn cancel_transaction(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.gateway.submit_cancel(&reference).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let (record, settled) = state.gateway.get_status(&reference).await?;
    Ok(Json(json!({
        "transaction": record,
        "settled": settled,
    })))
}

/// Inbound settlement webhook. Signature is verified over the raw bytes
/// before any parsing; an unverifiable payload is rejected without looking
/// inside it.
pub async fn settlement_callback(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing webhook signature".to_string()))?;

    if !webhook::verify(&state.config.webhook_secret, &body, signature) {
        warn!("webhook rejected: signature verification failed");
        return Err(AppError::Unauthorized("invalid webhook signature".to_string()));
    }

    let payload: WebhookPayload = serde_json::from_slice(&body)
        .map_err(|e| AppError::BadRequest(format!("malformed webhook payload: {}", e)))?;

    state.gateway.handle_webhook(&payload).await?;
    Ok(Json(json!({"received": true})))
}

pub async fn get_settled_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let settled = queries::get_settled(&state.pool, id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("settled transaction {}", id)))?;
    Ok(Json(settled))
}

// --- Simulator side ---

pub async fn accept_settlement(
    State(state): State<AppState>,
    Json(request): Json<AcceptRequest>,
) -> Result<impl IntoResponse, AppError> {
    let response = state.simulator.accept(request).await?;
    Ok((StatusCode::ACCEPTED, Json(response)))
}

pub async fn get_settlement_job(
    State(state): State<AppState>,
    Path(tid): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let job = queries::get_job_by_tid(&state.pool, &tid)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("settlement job {}", tid)))?;
    Ok(Json(job))
}

pub async fn resend_webhook(
    State(state): State<AppState>,
    Path(tid): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    state.simulator.resend_webhook(&tid).await?;
    Ok(Json(json!({"resent": true, "tid": tid})))
}

// --- Ledger ---

#[derive(serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAccountRequest {
    pub kind: String,
    pub owner_ref: String,
}

pub async fn create_ledger_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Result<impl IntoResponse, AppError> {
    if request.kind.is_empty() || request.owner_ref.is_empty() {
        return Err(AppError::Validation(
            "kind and ownerRef are required".to_string(),
        ));
    }
    let account = queries::insert_account(&state.pool, &request.kind, &request.owner_ref).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

/// Cached quantity next to a full replay of the delta history, with a
/// consistency verdict. Read-only.
pub async fn audit_ledger_account(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let view = state.reconciler.recompute(id).await?;
    Ok(Json(view))
}

// --- Event ingress ---

/// Bus delivery endpoint: downstream consumers run behind this, each event
/// applied at most once regardless of redelivery.
pub async fn ingest_event(
    State(state): State<AppState>,
    Json(envelope): Json<EventEnvelope>,
) -> Result<impl IntoResponse, AppError> {
    if envelope.event_id.is_empty() {
        return Err(AppError::Validation("eventId is required".to_string()));
    }
    let outcome = state.consumer.consume(&envelope).await?;
    Ok(Json(json!({
        "eventId": envelope.event_id,
        "outcome": format!("{:?}", outcome),
    })))
}

// --- Operational ---

pub async fn outbox_overview(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, AppError> {
    let outbox = queries::outbox_status_counts(&state.pool).await?;
    let jobs = queries::job_status_counts(&state.pool).await?;
    Ok(Json(json!({
        "outbox": outbox,
        "settlementJobs": jobs,
    })))
}

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = match sqlx::query("SELECT 1").execute(&state.pool).await {
        Ok(_) => "connected",
        Err(_) => "disconnected",
    };

    let status = if database == "connected" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if database == "connected" { "healthy" } else { "unhealthy" },
            "database": database,
            "pool": {
                "size": state.pool.size(),
                "idle": state.pool.num_idle(),
            },
        })),
    )
}
