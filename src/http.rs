//! Thin HTTP adapter over the query service.
//!
//! Transport only: parameter validation and error translation live here,
//! everything else is the service contract. Per-request errors map to
//! client responses without affecting other in-flight requests.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;

use crate::error::ServiceError;
use crate::service::QueryService;

pub fn router(service: Arc<QueryService>) -> Router {
    Router::new()
        .route("/puzzles", get(diverse_puzzles))
        .route("/similar", get(find_similar))
        .route("/puzzle/{puzzle_id}", get(get_puzzle))
        .route("/prefetch/{puzzle_id}", post(prefetch))
        // The catalog fronts a browser client; keep CORS permissive.
        .layer(CorsLayer::permissive())
        .with_state(service)
}

pub async fn serve(service: Arc<QueryService>, addr: SocketAddr) -> Result<()> {
    let app = router(service);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    tracing::info!(%addr, "http_listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server error")?;
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::warn!("ctrl-c handler unavailable; running until killed");
        std::future::pending::<()>().await;
    }
}

struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn unprocessable(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        let status = match err {
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::ReconstructionFailure(_) => StatusCode::BAD_REQUEST,
            ServiceError::StructuralMismatch(_) | ServiceError::BuildFailure(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            detail: err.to_string(),
        }
    }
}

fn check_range(name: &str, value: i64, min: i64, max: i64) -> Result<(), ApiError> {
    if value < min || value > max {
        return Err(ApiError::unprocessable(format!(
            "{name} must be between {min} and {max}, got {value}"
        )));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct DiverseParams {
    #[serde(default = "default_limit")]
    limit: usize,
    #[serde(default = "default_max_rating")]
    max_rating: i32,
}

#[derive(Debug, Deserialize)]
struct SimilarParams {
    puzzle_id: String,
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_exclude_self")]
    exclude_self: bool,
    #[serde(default = "default_max_rating")]
    max_rating: i32,
}

#[derive(Debug, Deserialize)]
struct PrefetchParams {
    #[serde(default = "default_top_k")]
    top_k: usize,
    #[serde(default = "default_exclude_self")]
    exclude_self: bool,
    #[serde(default = "default_max_rating")]
    max_rating: i32,
}

fn default_limit() -> usize {
    15
}

fn default_top_k() -> usize {
    15
}

fn default_exclude_self() -> bool {
    true
}

fn default_max_rating() -> i32 {
    2100
}

async fn diverse_puzzles(
    State(service): State<Arc<QueryService>>,
    Query(params): Query<DiverseParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_range("limit", params.limit as i64, 1, 50)?;
    check_range("max_rating", i64::from(params.max_rating), 300, 4000)?;
    let puzzles = service.sample_diverse(params.limit, params.max_rating);
    Ok(Json(json!({ "puzzles": puzzles })))
}

async fn find_similar(
    State(service): State<Arc<QueryService>>,
    Query(params): Query<SimilarParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_range("top_k", params.top_k as i64, 1, 100)?;
    check_range("max_rating", i64::from(params.max_rating), 300, 4000)?;
    let payload = service.find_similar(
        &params.puzzle_id,
        params.top_k,
        params.exclude_self,
        params.max_rating,
    )?;
    Ok(Json(serde_json::to_value(payload).map_err(|e| ApiError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        detail: e.to_string(),
    })?))
}

async fn get_puzzle(
    State(service): State<Arc<QueryService>>,
    Path(puzzle_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let puzzle = service.get_puzzle(&puzzle_id)?;
    Ok(Json(json!({ "puzzle": puzzle })))
}

/// Best-effort cache warmer: acknowledges immediately and never surfaces
/// the background computation's outcome.
async fn prefetch(
    State(service): State<Arc<QueryService>>,
    Path(puzzle_id): Path<String>,
    Query(params): Query<PrefetchParams>,
) -> Json<serde_json::Value> {
    service.prefetch(
        puzzle_id,
        params.top_k,
        params.exclude_self,
        params.max_rating,
    );
    Json(json!({ "status": "ok" }))
}
