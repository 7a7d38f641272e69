pub mod error;

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use tally_ocr::{
    DocumentType, ExtractionPipeline, ExtractionRequest, ExtractionResult, HealthSnapshot,
    PipelineContext, Strategy,
};

use crate::error::{ApiError, Result};

/// Uploads above this are rejected before they reach the pipeline.
pub const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: ExtractionPipeline,
}

impl AppState {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { pipeline: ExtractionPipeline::new(Arc::new(ctx)) }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/extract", post(extract))
        .route("/api/v1/ocr/health", get(health))
        .route("/api/v1/ocr/health/reset", post(reset_health))
        .route("/api/v1/ocr/cache/sweep", post(sweep_cache))
        .route("/api/v1/ocr/cache", delete(clear_cache))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Default, Deserialize)]
pub struct ExtractParams {
    pub document_type: Option<String>,
    pub strategy: Option<String>,
}

async fn extract(
    State(state): State<AppState>,
    Query(params): Query<ExtractParams>,
    body: Bytes,
) -> Result<Json<ExtractionResult>> {
    let document_type = match params.document_type.as_deref() {
        Some(s) => s.parse::<DocumentType>().map_err(ApiError::BadRequest)?,
        None => DocumentType::General,
    };
    let strategy = params
        .strategy
        .as_deref()
        .map(str::parse::<Strategy>)
        .transpose()
        .map_err(ApiError::BadRequest)?;

    // Dropping the handler (client went away) cancels recognition.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let mut request =
        ExtractionRequest::new(body.to_vec(), document_type).with_cancellation(cancel);
    if let Some(strategy) = strategy {
        request = request.with_strategy(strategy);
    }
    let result = state.pipeline.extract(request).await?;
    Ok(Json(result))
}

async fn health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    Json(state.pipeline.context().adapter.health().snapshot())
}

async fn reset_health(State(state): State<AppState>) -> Json<HealthSnapshot> {
    let adapter = &state.pipeline.context().adapter;
    adapter.reset_health();
    info!("Recognition health reset");
    Json(adapter.health().snapshot())
}

#[derive(Debug, Deserialize)]
pub struct SweepParams {
    pub max_age_days: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Removed {
    pub removed: usize,
}

async fn sweep_cache(
    State(state): State<AppState>,
    Query(params): Query<SweepParams>,
) -> Result<Json<Removed>> {
    let ctx = state.pipeline.context();
    let max_age = match params.max_age_days {
        Some(days) => chrono::Duration::days(days.into()),
        None => ctx.config.cache_retention(),
    };
    let removed = ctx.cache.sweep(max_age).await?;
    info!(removed, "Cache swept");
    Ok(Json(Removed { removed }))
}

async fn clear_cache(State(state): State<AppState>) -> Result<Json<Removed>> {
    let removed = state.pipeline.context().cache.clear().await?;
    info!(removed, "Cache cleared");
    Ok(Json(Removed { removed }))
}
