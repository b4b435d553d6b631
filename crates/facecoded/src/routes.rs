//! HTTP API.
//!
//! - `GET  /health`           - liveness and version
//! - `POST /api/face/extract` - one image as JSON base64, multipart upload or raw body
//! - `POST /api/face/compare` - distance between two feature codes
//! - `POST /api/face/batch`   - several base64 images, results index-correlated

use crate::worker::{WorkerError, WorkerPool};
use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Query, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use facecode_core::{compare_codes, Comparison, ExtractionResult, MATCH_THRESHOLD};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Instant;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tracing::Instrument;
use uuid::Uuid;

const ENDPOINTS: [&str; 4] = [
    "GET /health",
    "POST /api/face/extract",
    "POST /api/face/compare",
    "POST /api/face/batch",
];

#[derive(Clone)]
pub struct AppState {
    pub pool: WorkerPool,
}

pub fn router(state: AppState, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/face/extract", post(extract))
        .route("/api/face/compare", post(compare))
        .route("/api/face/batch", post(batch))
        .fallback(not_found)
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(middleware::from_fn(request_span))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),
    #[error("request body too large")]
    PayloadTooLarge,
    #[error("request timed out")]
    Timeout,
    #[error("internal server error")]
    Internal(String),
}

impl From<WorkerError> for ApiError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Timeout(_) => ApiError::Timeout,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl ApiError {
    /// Map an extractor rejection, keeping the body-limit status.
    fn rejected(status: StatusCode, text: String) -> Self {
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadRequest(text)
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::rejected(rejection.status(), rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Internal(detail) => {
                tracing::error!(error = %detail, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = json!({
            "success": false,
            "message": self.to_string(),
            "timestamp": timestamp(),
        });
        (status, Json(body)).into_response()
    }
}

fn timestamp() -> String {
    chrono::Local::now().to_rfc3339()
}

fn millis_since(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Tag every request with a fresh id, on its tracing span and the response.
async fn request_span(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let span = tracing::info_span!(
        "request",
        %request_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    let mut response = next.run(request).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "healthy",
        "service": "facecoded",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": timestamp(),
    }))
}

async fn not_found() -> Response {
    let body = json!({
        "success": false,
        "message": "endpoint not found",
        "available_endpoints": ENDPOINTS,
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

// --- extract ---

#[derive(Debug, Default, Deserialize)]
pub struct UserQuery {
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExtractRequest {
    image: Option<String>,
    user_id: Option<String>,
}

enum Payload {
    Base64(String),
    Bytes(Bytes),
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    #[serde(flatten)]
    pub result: ExtractionResult,
    pub user_id: String,
    /// Milliseconds from request arrival to response, queueing included.
    pub service_time: f64,
    pub timestamp: String,
}

async fn extract(
    State(state): State<AppState>,
    Query(query): Query<UserQuery>,
    request: Request,
) -> Result<Json<ExtractResponse>, ApiError> {
    let started = Instant::now();
    let (payload, user_id) = read_upload(request, query.user_id).await?;
    let user_id = user_id.unwrap_or_else(|| "unknown".to_string());

    let result = state
        .pool
        .run(move |extractor| match payload {
            Payload::Base64(data) => extractor.extract_base64(&data),
            Payload::Bytes(bytes) => extractor.extract(&bytes),
        })
        .await?;

    let service_time = millis_since(started);
    if result.success {
        tracing::info!(%user_id, quality = result.quality, service_time, "feature extraction succeeded");
    } else {
        tracing::warn!(%user_id, message = %result.message, "feature extraction failed");
    }

    Ok(Json(ExtractResponse {
        result,
        user_id,
        service_time,
        timestamp: timestamp(),
    }))
}

/// Pull the image and optional user id out of a JSON, multipart or raw body.
async fn read_upload(
    request: Request,
    query_user: Option<String>,
) -> Result<(Payload, Option<String>), ApiError> {
    let content_type = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_ascii_lowercase();

    if content_type.starts_with("application/json") {
        let Json(body) = Json::<ExtractRequest>::from_request(request, &()).await?;
        let image = body
            .image
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ApiError::BadRequest("missing image field".into()))?;
        tracing::debug!(len = image.len(), "json upload");
        Ok((Payload::Base64(image), body.user_id))
    } else if content_type.starts_with("multipart/form-data") {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?;
        let (mut image, mut user_id) = (None, None);
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?
        {
            let name = field.name().map(str::to_owned);
            match name.as_deref() {
                Some("image") => {
                    image = Some(
                        field
                            .bytes()
                            .await
                            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?,
                    )
                }
                Some("user_id") => {
                    user_id = Some(
                        field
                            .text()
                            .await
                            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?,
                    )
                }
                _ => {}
            }
        }
        let image = image
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ApiError::BadRequest("missing image file".into()))?;
        tracing::debug!(len = image.len(), "multipart upload");
        Ok((Payload::Bytes(image), user_id))
    } else {
        let body = Bytes::from_request(request, &())
            .await
            .map_err(|e| ApiError::rejected(e.status(), e.body_text()))?;
        if body.is_empty() {
            return Err(ApiError::BadRequest("request body is empty".into()));
        }
        tracing::debug!(len = body.len(), "binary upload");
        Ok((Payload::Bytes(body), query_user))
    }
}

// --- compare ---

#[derive(Debug, Deserialize)]
pub struct CompareRequest {
    pub feature1: Option<String>,
    pub feature2: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CompareResponse {
    pub success: bool,
    #[serde(flatten)]
    pub comparison: Comparison,
    pub threshold: f32,
    pub process_time: f64,
    pub timestamp: String,
}

async fn compare(
    payload: Result<Json<CompareRequest>, JsonRejection>,
) -> Result<Json<CompareResponse>, ApiError> {
    let started = Instant::now();
    let Json(body) = payload?;
    let (Some(a), Some(b)) = (body.feature1, body.feature2) else {
        return Err(ApiError::BadRequest("missing feature1 or feature2".into()));
    };

    let comparison = compare_codes(&a, &b).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    tracing::info!(distance = comparison.distance, matched = comparison.matched, "features compared");

    Ok(Json(CompareResponse {
        success: true,
        comparison,
        threshold: MATCH_THRESHOLD,
        process_time: millis_since(started),
        timestamp: timestamp(),
    }))
}

// --- batch ---

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub images: Option<Vec<BatchImage>>,
}

#[derive(Debug, Deserialize)]
pub struct BatchImage {
    #[serde(default)]
    pub image: String,
    pub user_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchEntry {
    #[serde(flatten)]
    pub result: ExtractionResult,
    pub user_id: String,
    pub batch_index: usize,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub success: bool,
    pub total_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub results: Vec<BatchEntry>,
    pub batch_time: f64,
    pub timestamp: String,
}

async fn batch(
    State(state): State<AppState>,
    payload: Result<Json<BatchRequest>, JsonRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let started = Instant::now();
    let Json(body) = payload?;
    let images = body
        .images
        .ok_or_else(|| ApiError::BadRequest("expected an images array".into()))?;

    let (codes, user_ids): (Vec<String>, Vec<Option<String>>) =
        images.into_iter().map(|item| (item.image, item.user_id)).unzip();
    let results = state
        .pool
        .run(move |extractor| extractor.extract_batch_base64(&codes))
        .await?;

    let results: Vec<BatchEntry> = results
        .into_iter()
        .zip(user_ids)
        .enumerate()
        .map(|(batch_index, (result, user_id))| BatchEntry {
            result,
            user_id: user_id.unwrap_or_else(|| format!("batch_{batch_index}")),
            batch_index,
        })
        .collect();

    let total_count = results.len();
    let success_count = results.iter().filter(|e| e.result.success).count();
    tracing::info!(total_count, success_count, "batch processed");

    Ok(Json(BatchResponse {
        success: true,
        total_count,
        success_count,
        failed_count: total_count - success_count,
        results,
        batch_time: millis_since(started),
        timestamp: timestamp(),
    }))
}
