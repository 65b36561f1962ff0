//! HTTP surface of the image pipeline.

use axum::routing::get;
use axum::Router;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::pipeline::Pipeline;

pub mod error;
pub mod handlers;

pub use error::{ApiError, ApiResult};

/// Shared state for every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(pipeline: Arc<Pipeline>, config: Arc<Config>) -> Self {
        Self { pipeline, config }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/api/images/process",
            get(handlers::image_stats).post(handlers::process_batch),
        )
        .route(
            "/api/cron/process-images",
            get(handlers::cron_process_images),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
