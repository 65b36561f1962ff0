use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::Json;
use serde::Serialize;
use tracing::{info, warn};

use super::{ApiError, ApiResult, AppState};
use crate::model::{BatchReport, BatchRequest, ImageStats, SweepSummary};
use crate::sweep::{run_sweep, SweepOptions};

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `POST /api/images/process`. An empty body means all defaults.
pub async fn process_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<BatchReport>> {
    let req = parse_batch_request(&body)?;
    let report = state.pipeline.process_batch(req).await?;
    Ok(Json(report))
}

/// `GET /api/images/process`.
pub async fn image_stats(State(state): State<AppState>) -> ApiResult<Json<ImageStats>> {
    Ok(Json(state.pipeline.stats().await?))
}

/// `GET /api/cron/process-images`: one budget-limited sweep, in process.
pub async fn cron_process_images(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<SweepSummary>> {
    authorize_cron(&state.config.server.cron_secret, &headers)?;
    let opts = SweepOptions::from_config(&state.config);
    info!(budget_secs = opts.budget.as_secs(), "cron sweep triggered");
    let summary = run_sweep(state.pipeline.as_ref(), &opts, Some(state.pipeline.pool())).await;
    Ok(Json(summary))
}

fn parse_batch_request(body: &[u8]) -> ApiResult<BatchRequest> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(BatchRequest::default());
    }
    serde_json::from_slice(body).map_err(|err| ApiError::BadRequest(format!("invalid body: {err}")))
}

/// An empty secret disables the check.
fn authorize_cron(secret: &str, headers: &HeaderMap) -> ApiResult<()> {
    if secret.is_empty() {
        return Ok(());
    }
    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if presented == Some(secret) {
        Ok(())
    } else {
        warn!("cron request rejected");
        Err(ApiError::Unauthorized)
    }
}
