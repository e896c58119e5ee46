//! Client for the external inference service.
//!
//! The service accepts a multipart `file` field and answers
//! `{"predictions": [{"movie": ..., "confidence": ...}]}`.

use crate::config::InferenceConfig;
use crate::file_store::{FileStore, StoreError, StoredFile};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Multipart field name expected by the inference service
pub const DOWNSTREAM_FILE_FIELD: &str = "file";

/// Errors raised while talking to the inference service
#[derive(Debug, Error)]
pub enum InferenceError {
    /// Transport failure or non-2xx status. Never retried.
    #[error("{0}")]
    DownstreamUnavailable(String),

    /// Body was not JSON or lacked a `predictions` sequence
    #[error("Invalid response format from ML service: {message}")]
    InvalidDownstreamResponse { message: String, raw: String },

    /// The stored upload could not be opened for forwarding
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A single caller-facing prediction
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    /// Inferred title
    #[serde(rename = "title")]
    pub label: String,
    /// Score on the inference service's scale
    #[serde(rename = "accuracy")]
    pub confidence: f64,
}

/// Prediction as produced by the inference service
#[derive(Debug, Deserialize)]
struct DownstreamPrediction {
    movie: String,
    confidence: f64,
}

impl From<DownstreamPrediction> for Prediction {
    fn from(p: DownstreamPrediction) -> Self {
        Self {
            label: p.movie,
            confidence: p.confidence,
        }
    }
}

/// Validated inference outcome
#[derive(Debug, Clone, Serialize)]
pub struct DetectionResult {
    /// Predictions in downstream order
    pub predictions: Vec<Prediction>,
    /// Downstream payload, unchanged
    pub raw: Value,
}

impl DetectionResult {
    /// Validate and reshape a downstream response body
    pub fn from_downstream(body: &str) -> Result<Self, InferenceError> {
        let invalid = |message: String| InferenceError::InvalidDownstreamResponse {
            message,
            raw: body.to_string(),
        };

        let raw: Value = serde_json::from_str(body)
            .map_err(|e| invalid(format!("response is not valid JSON: {e}")))?;

        let Some(predictions) = raw.get("predictions") else {
            // Failed predictions come back as {"success": false, "error": "..."}
            let message = match raw.get("error").and_then(Value::as_str) {
                Some(error) => format!("missing `predictions` (service error: {error})"),
                None => "missing `predictions`".to_string(),
            };
            return Err(invalid(message));
        };

        let Some(items) = predictions.as_array() else {
            return Err(invalid("`predictions` is not an array".to_string()));
        };

        let predictions = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                DownstreamPrediction::deserialize(item)
                    .map(Prediction::from)
                    .map_err(|e| invalid(format!("prediction {i} is malformed: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { predictions, raw })
    }
}

/// Something that can turn a stored upload into predictions
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, file: &StoredFile) -> Result<DetectionResult, InferenceError>;
}

/// HTTP client forwarding stored uploads to the inference service
pub struct InferenceClient {
    client: Client,
    url: Url,
    store: Arc<FileStore>,
}

impl InferenceClient {
    /// Create a new inference client
    pub fn new(config: &InferenceConfig, store: Arc<FileStore>) -> Result<Self> {
        let url = Url::parse(&config.url).context("Invalid inference service URL")?;

        // No body size limits are imposed on the outbound request.
        let mut builder = Client::builder().connect_timeout(config.connect_timeout());
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }
        let client = builder.build().context("Failed to build HTTP client")?;

        info!(
            url = %url,
            timeout_secs = config.request_timeout_secs,
            "Inference client initialized"
        );

        Ok(Self { client, url, store })
    }
}

#[async_trait]
impl Predictor for InferenceClient {
    #[instrument(skip(self, file), fields(file = %file.name))]
    async fn predict(&self, file: &StoredFile) -> Result<DetectionResult, InferenceError> {
        let stream = self.store.read(&file.name).await?;
        let part = Part::stream_with_length(Body::wrap_stream(stream), file.size_bytes)
            .file_name(file.name.clone());
        let form = Form::new().part(DOWNSTREAM_FILE_FIELD, part);

        debug!(url = %self.url, size_bytes = file.size_bytes, "Forwarding upload");

        let response = self
            .client
            .post(self.url.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| InferenceError::DownstreamUnavailable(error_chain(&e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| InferenceError::DownstreamUnavailable(error_chain(&e)))?;

        if !status.is_success() {
            warn!(
                status = status.as_u16(),
                body = %body,
                "Inference service returned error status"
            );
            return Err(InferenceError::DownstreamUnavailable(format!(
                "Request failed with status code {}",
                status.as_u16()
            )));
        }

        debug!(body = %body, "Inference service response");

        DetectionResult::from_downstream(&body)
    }
}

/// Render an error with its source chain, e.g. `error sending request: connection refused`
fn error_chain(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        let cause_text = cause.to_string();
        if !message.contains(&cause_text) {
            message.push_str(": ");
            message.push_str(&cause_text);
        }
        source = cause.source();
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spawn_fake_service;
    use axum::extract::Multipart;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use futures::stream;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_maps_movie_and_confidence_to_title_and_accuracy() {
        let body = r#"{"predictions":[{"movie":"Inception","confidence":0.92}]}"#;
        let result = DetectionResult::from_downstream(body).unwrap();

        assert_eq!(
            result.predictions,
            vec![Prediction {
                label: "Inception".to_string(),
                confidence: 0.92
            }]
        );
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            json!({
                "predictions": [{"title": "Inception", "accuracy": 0.92}],
                "raw": {"predictions": [{"movie": "Inception", "confidence": 0.92}]}
            })
        );
    }

    #[test]
    fn test_keeps_order_and_extra_fields_in_raw() {
        let body = r#"{"success":true,"predictions":[
            {"movie":"Your Name","confidence":0.7},
            {"movie":"The Garden of Words","confidence":0.2}
        ]}"#;
        let result = DetectionResult::from_downstream(body).unwrap();

        let titles: Vec<_> = result.predictions.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(titles, ["Your Name", "The Garden of Words"]);
        assert_eq!(result.raw["success"], json!(true));
    }

    #[test]
    fn test_integer_confidence_is_reported_as_float() {
        let body = r#"{"predictions":[{"movie":"Hello World","confidence":1}]}"#;
        let result = DetectionResult::from_downstream(body).unwrap();
        let body = serde_json::to_value(&result).unwrap();

        assert!(body["predictions"][0]["accuracy"].is_f64());
        assert_eq!(body["predictions"][0]["accuracy"], json!(1.0));
        assert_eq!(body["raw"]["predictions"][0]["confidence"], json!(1));
    }

    #[test]
    fn test_empty_predictions_are_valid() {
        let result = DetectionResult::from_downstream(r#"{"predictions":[]}"#).unwrap();
        assert!(result.predictions.is_empty());
    }

    #[test]
    fn test_missing_predictions_is_invalid() {
        let body = r#"{"success":false,"error":"Model not loaded"}"#;
        match DetectionResult::from_downstream(body) {
            Err(InferenceError::InvalidDownstreamResponse { message, raw }) => {
                assert!(message.contains("Model not loaded"));
                assert_eq!(raw, body);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_rejects_malformed_shapes() {
        for body in [
            "not json",
            "null",
            r#"{"predictions":{"movie":"x"}}"#,
            r#"{"predictions":[{"movie":"x"}]}"#,
            r#"{"predictions":[{"movie":1,"confidence":0.5}]}"#,
        ] {
            assert!(
                matches!(
                    DetectionResult::from_downstream(body),
                    Err(InferenceError::InvalidDownstreamResponse { .. })
                ),
                "{body} should be rejected"
            );
        }
    }

    async fn client_for(
        url: String,
        timeout_secs: u64,
    ) -> (tempfile::TempDir, StoredFile, InferenceClient) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let stored = store
            .put(
                "1-frame.jpg",
                stream::iter([Ok::<_, std::io::Error>(bytes::Bytes::from_static(b"imagebytes"))]),
            )
            .await
            .unwrap();
        let config = InferenceConfig {
            url,
            request_timeout_secs: timeout_secs,
            connect_timeout_secs: 1,
        };
        let client = InferenceClient::new(&config, store).unwrap();
        (dir, stored, client)
    }

    #[tokio::test]
    async fn test_forwards_file_field_and_parses_predictions() {
        let app = Router::new().route(
            "/predict",
            post(|mut multipart: Multipart| async move {
                let mut received = None;
                while let Some(field) = multipart.next_field().await.unwrap() {
                    if field.name() == Some("file") {
                        received = Some(field.bytes().await.unwrap());
                    }
                }
                let movie = match received.as_deref() {
                    Some(b"imagebytes") => "Inception",
                    _ => "wrong payload",
                };
                Json(json!({"predictions": [{"movie": movie, "confidence": 0.92}]}))
            }),
        );
        let base = spawn_fake_service(app).await;
        let (_dir, stored, client) = client_for(format!("{base}/predict"), 5).await;

        let result = client.predict(&stored).await.unwrap();
        assert_eq!(result.predictions[0].label, "Inception");
    }

    #[tokio::test]
    async fn test_error_status_is_downstream_unavailable() {
        let app = Router::new().route(
            "/predict",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        );
        let base = spawn_fake_service(app).await;
        let (_dir, stored, client) = client_for(format!("{base}/predict"), 5).await;

        match client.predict(&stored).await {
            Err(InferenceError::DownstreamUnavailable(message)) => {
                assert_eq!(message, "Request failed with status code 500");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connection_refused_is_downstream_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_dir, stored, client) = client_for(format!("http://{addr}/predict"), 5).await;
        assert!(matches!(
            client.predict(&stored).await,
            Err(InferenceError::DownstreamUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_downstream_unavailable() {
        let app = Router::new().route(
            "/predict",
            post(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(json!({"predictions": []}))
            }),
        );
        let base = spawn_fake_service(app).await;
        let (_dir, stored, client) = client_for(format!("{base}/predict"), 1).await;

        assert!(matches!(
            client.predict(&stored).await,
            Err(InferenceError::DownstreamUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_stored_file_is_store_error() {
        let app = Router::new();
        let base = spawn_fake_service(app).await;
        let (_dir, mut stored, client) = client_for(format!("{base}/predict"), 5).await;
        stored.name = "2-gone.jpg".to_string();

        assert!(matches!(
            client.predict(&stored).await,
            Err(InferenceError::Store(StoreError::NotFound(_)))
        ));
    }
}
