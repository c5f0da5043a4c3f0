use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;

use crate::coordinator::{CallOutcome, CounterView, CreateTokenRequest, SkipOutcome};
use crate::errors::AppError;
use crate::models::service::Service;
use crate::models::token::{CalledToken, TokenFilter, TokenRecord, TokenStatus, TokenSummary};
use crate::recovery::ResyncReport;
use crate::AppState;

// ── Request DTOs ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct RecallRequest {
    pub counter_id: i32,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub status: Option<String>,
    pub counter_id: Option<i32>,
    /// `YYYY-MM-DD` or `YYYYMMDD`, local issue date.
    pub date: Option<String>,
    pub limit: Option<i64>,
}

impl HistoryParams {
    pub fn into_filter(self) -> Result<TokenFilter, AppError> {
        let status = match self.status.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(s) => Some(s.parse::<TokenStatus>().map_err(AppError::Validation)?),
        };

        let date = match self.date.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(d) => Some(
                NaiveDate::parse_from_str(d, "%Y-%m-%d")
                    .or_else(|_| NaiveDate::parse_from_str(d, "%Y%m%d"))
                    .map_err(|_| AppError::Validation(format!("invalid date '{}'", d)))?,
            ),
        };

        let limit = match self.limit {
            None => TokenFilter::DEFAULT_LIMIT,
            Some(n) if (1..=TokenFilter::MAX_LIMIT).contains(&n) => n,
            Some(n) => {
                return Err(AppError::Validation(format!(
                    "limit must be between 1 and {}, got {}",
                    TokenFilter::MAX_LIMIT,
                    n
                )))
            }
        };

        Ok(TokenFilter {
            status,
            counter_id: self.counter_id,
            date,
            limit,
        })
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, AppError> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::Validation(rejection.body_text()))
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /api/v1/tokens — issue a token and queue it
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateTokenRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<TokenSummary>), AppError> {
    let req = json_body(payload)?;
    let summary = state.coordinator.create_token(req).await?;
    Ok((StatusCode::CREATED, Json(summary)))
}

/// POST /api/v1/counters/:id/next — call the next waiting token
pub async fn call_next(
    State(state): State<Arc<AppState>>,
    Path(counter_id): Path<i32>,
) -> Result<Response, AppError> {
    match state.coordinator.call_next(counter_id).await? {
        CallOutcome::Called(token) => Ok(Json(token).into_response()),
        CallOutcome::Empty => Ok(Json(json!({ "message": "No tokens in queue" })).into_response()),
    }
}

/// POST /api/v1/tokens/:id/serve
pub async fn serve_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<TokenRecord>, AppError> {
    Ok(Json(state.coordinator.serve(&token_id).await?))
}

/// POST /api/v1/tokens/:id/skip
pub async fn skip_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<SkipOutcome>, AppError> {
    Ok(Json(state.coordinator.skip(&token_id).await?))
}

/// POST /api/v1/tokens/:id/recall — body `{ "counter_id": N }`
pub async fn recall_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
    payload: Result<Json<RecallRequest>, JsonRejection>,
) -> Result<Json<CalledToken>, AppError> {
    let req = json_body(payload)?;
    Ok(Json(state.coordinator.recall(&token_id, req.counter_id).await?))
}

/// GET /api/v1/tokens/:id — ledger record
pub async fn get_token(
    State(state): State<Arc<AppState>>,
    Path(token_id): Path<String>,
) -> Result<Json<TokenRecord>, AppError> {
    Ok(Json(state.coordinator.get_token(&token_id).await?))
}

/// GET /api/v1/tokens — ledger history, newest first
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<TokenRecord>>, AppError> {
    let filter = params.into_filter()?;
    Ok(Json(state.coordinator.list_tokens(filter).await?))
}

/// GET /api/v1/counters — counters with their queues and current token
pub async fn list_counters(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<CounterView>>, AppError> {
    Ok(Json(state.coordinator.counters_overview().await?))
}

/// GET /api/v1/services — services offered at the kiosk
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Service>>, AppError> {
    Ok(Json(state.coordinator.active_services().await?))
}

/// POST /api/v1/queue/resync — rebuild every queue from the ledger
pub async fn resync_queues(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ResyncReport>, AppError> {
    Ok(Json(state.resync.resync().await?))
}
