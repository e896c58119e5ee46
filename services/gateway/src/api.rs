use crate::config::ServerConfig;
use crate::detector::{DetectError, Detector};
use crate::file_store::{FileStore, StoreError, StoredFile};
use crate::inference_client::{DetectionResult, InferenceError};
use crate::upload_intake::{IntakeError, UploadIntake};
use anyhow::{Context, Result};
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, instrument};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub store: Arc<FileStore>,
    pub intake: UploadIntake,
    pub detector: Detector,
}

/// Successful detection response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectResponse {
    pub success: bool,
    pub detection_result: DetectionResult,
}

/// Plain upload response
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub message: String,
    pub filename: String,
}

/// Stored file listing
#[derive(Debug, Serialize)]
pub struct FileListResponse {
    pub files: Vec<StoredFile>,
}

/// Errors mapped onto HTTP responses
#[derive(Debug)]
pub enum ApiError {
    /// Failure in the detection flow
    Detect(DetectError),
    /// Failure in the plain upload route
    Upload(IntakeError),
    /// Failure in a direct store operation
    Store(StoreError),
}

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        Self::Detect(e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::Detect(DetectError::Intake(IntakeError::NoFileProvided)) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "No file uploaded for detection" }),
            ),
            ApiError::Upload(IntakeError::NoFileProvided) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": "No file uploaded" }),
            ),
            ApiError::Detect(DetectError::Intake(e)) | ApiError::Upload(e) => intake_error(e),
            ApiError::Detect(DetectError::Inference(e)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "success": false,
                    "error": "Error communicating with ML service",
                    "details": inference_details(&e),
                }),
            ),
            ApiError::Detect(DetectError::Aborted(details)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "success": false,
                    "error": "Detection aborted",
                    "details": details,
                }),
            ),
            ApiError::Store(e) => store_error(e),
        };

        (status, Json(body)).into_response()
    }
}

fn intake_error(e: IntakeError) -> (StatusCode, serde_json::Value) {
    match e {
        IntakeError::NoFileProvided => (
            StatusCode::BAD_REQUEST,
            json!({ "error": "No file uploaded" }),
        ),
        IntakeError::Multipart(e) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": format!("Invalid upload: {e}") }),
        ),
        IntakeError::Store(e) => store_error(e),
    }
}

fn store_error(e: StoreError) -> (StatusCode, serde_json::Value) {
    match e {
        StoreError::NotFound(_) => (
            StatusCode::NOT_FOUND,
            json!({ "error": "File not found" }),
        ),
        StoreError::InvalidName(_) => (
            StatusCode::BAD_REQUEST,
            json!({ "error": e.to_string() }),
        ),
        StoreError::Write { .. } | StoreError::Io(_) => {
            error!(error = %e, "Storage failure");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "error": "Failed to store file" }),
            )
        }
    }
}

fn inference_details(e: &InferenceError) -> String {
    match e {
        InferenceError::InvalidDownstreamResponse { message, raw } => {
            error!(raw = %raw, "Invalid response from ML service");
            format!("Invalid response format from ML service: {message}")
        }
        other => other.to_string(),
    }
}

/// Create the API router
pub fn create_router(
    state: AppState,
    config: &ServerConfig,
    body_limit: Option<usize>,
) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    let body_limit = match body_limit {
        Some(bytes) => DefaultBodyLimit::max(bytes),
        None => DefaultBodyLimit::disable(),
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/detect", post(detect))
        .route("/upload", post(upload))
        .route("/upload/:name", delete(delete_upload))
        .route("/uploads", get(list_uploads))
        .route("/uploads/:name", get(get_upload))
        .layer(body_limit)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

/// Persist an upload, run inference on it, and remove it again
#[instrument(skip_all)]
async fn detect(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<DetectResponse>, ApiError> {
    let detection_result = state.detector.detect(multipart).await?;

    Ok(Json(DetectResponse {
        success: true,
        detection_result,
    }))
}

/// Persist an upload without further processing
#[instrument(skip_all)]
async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResponse>, ApiError> {
    let stored = state.intake.accept(multipart).await.map_err(ApiError::Upload)?;

    Ok(Json(UploadResponse {
        message: "File uploaded successfully".to_string(),
        filename: stored.name,
    }))
}

/// List stored uploads
async fn list_uploads(State(state): State<AppState>) -> Result<Json<FileListResponse>, ApiError> {
    let files = state.store.list().await?;
    Ok(Json(FileListResponse { files }))
}

/// Stream a stored upload back to the caller
#[instrument(skip(state))]
async fn get_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, ApiError> {
    // Directories and other non-files are reported as missing
    state.store.stat(&name).await?;
    let stream = state.store.read(&name).await?;

    Ok((
        [(header::CONTENT_TYPE, content_type_for(&name))],
        Body::from_stream(stream),
    )
        .into_response())
}

/// Remove a stored upload
#[instrument(skip(state))]
async fn delete_upload(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    state.store.delete(&name).await?;
    info!(file = %name, "Upload deleted");

    Ok(Json(json!({ "message": "File deleted successfully" })))
}

fn content_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "bmp" => "image/bmp",
        _ => "application/octet-stream",
    }
}

/// Start the gateway API server
pub async fn start_api_server(
    router: Router,
    addr: &str,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    info!(address = %addr, "Starting detection gateway API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn into_parts(error: ApiError) -> (StatusCode, serde_json::Value) {
        let response = error.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_no_file_for_detection_is_bad_request() {
        let (status, body) =
            into_parts(ApiError::Detect(DetectError::Intake(IntakeError::NoFileProvided))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, json!({ "error": "No file uploaded for detection" }));
    }

    #[tokio::test]
    async fn test_downstream_failure_body() {
        let error = DetectError::Inference(InferenceError::DownstreamUnavailable(
            "connection refused".to_string(),
        ));
        let (status, body) = into_parts(ApiError::Detect(error)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body,
            json!({
                "success": false,
                "error": "Error communicating with ML service",
                "details": "connection refused",
            })
        );
    }

    #[tokio::test]
    async fn test_invalid_response_details() {
        let error = DetectError::Inference(InferenceError::InvalidDownstreamResponse {
            message: "missing `predictions`".to_string(),
            raw: "{}".to_string(),
        });
        let (status, body) = into_parts(ApiError::Detect(error)).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body["details"],
            "Invalid response format from ML service: missing `predictions`"
        );
    }

    #[tokio::test]
    async fn test_store_errors() {
        let (status, body) = into_parts(ApiError::Store(StoreError::NotFound("x".into()))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({ "error": "File not found" }));

        let (status, _) = into_parts(ApiError::Store(StoreError::InvalidName("..".into()))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("1-a-cat.JPG"), "image/jpeg");
        assert_eq!(content_type_for("1-a-cat.png"), "image/png");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }
}
