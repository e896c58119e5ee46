//! Detection flow: persist the upload, forward it, and always clean up.
//!
//! ```text
//! Idle ──intake──▶ Persisted ──predict──▶ Succeeded | Failed ──release──▶ Cleaned ──▶ Done
//!   └──intake error────────────────────────────────────────────────────────────────▶ Done
//! ```

use crate::file_store::{FileStore, StoreError, StoredFile};
use crate::inference_client::{DetectionResult, InferenceError, Predictor};
use crate::upload_intake::{IntakeError, UploadIntake};
use axum::extract::Multipart;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors surfaced by the detection flow
#[derive(Debug, Error)]
pub enum DetectError {
    /// Nothing was persisted; no cleanup was needed
    #[error(transparent)]
    Intake(#[from] IntakeError),

    /// Inference failed; the upload has already been removed
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// The detection task did not run to completion
    #[error("Detection task aborted: {0}")]
    Aborted(String),
}

/// Owns a persisted upload until it is released.
///
/// `release` deletes the file once. A guard dropped without being released
/// deletes the file synchronously.
pub struct StoredFileGuard {
    store: Arc<FileStore>,
    file: StoredFile,
    released: bool,
}

impl StoredFileGuard {
    pub fn new(store: Arc<FileStore>, file: StoredFile) -> Self {
        Self {
            store,
            file,
            released: false,
        }
    }

    /// The guarded file
    pub fn file(&self) -> &StoredFile {
        &self.file
    }

    /// Delete the guarded file. Failures are logged, never returned.
    pub async fn release(mut self) {
        self.released = true;
        let result = self.store.delete(&self.file.name).await;
        self.log_cleanup(result);
    }

    fn log_cleanup(&self, result: Result<(), StoreError>) {
        match result {
            Ok(()) => debug!(file = %self.file.name, "Cleaned up upload"),
            Err(e) => {
                warn!(file = %self.file.name, error = %e, "Failed to clean up upload");
                metrics::counter!("gateway_cleanup_failures_total").increment(1);
            }
        }
    }
}

impl Drop for StoredFileGuard {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            warn!(file = %self.file.name, "Upload guard dropped before release");
            let result = self.store.delete_blocking(&self.file.name);
            self.log_cleanup(result);
        }
    }
}

/// Composes upload intake, inference and cleanup
#[derive(Clone)]
pub struct Detector {
    store: Arc<FileStore>,
    intake: UploadIntake,
    predictor: Arc<dyn Predictor>,
}

impl Detector {
    pub fn new(store: Arc<FileStore>, predictor: Arc<dyn Predictor>) -> Self {
        Self {
            intake: UploadIntake::new(store.clone()),
            store,
            predictor,
        }
    }

    /// Run the detection flow on its own task.
    ///
    /// Dropping the returned future (client disconnect) does not cancel the
    /// outbound call or the cleanup.
    pub async fn detect(&self, multipart: Multipart) -> Result<DetectionResult, DetectError> {
        let detector = self.clone();
        tokio::spawn(async move { detector.run(multipart).await })
            .await
            .map_err(|e| {
                error!(error = %e, "Detection task failed");
                DetectError::Aborted(e.to_string())
            })?
    }

    /// Run the detection flow on the current task
    #[instrument(skip_all)]
    pub async fn run(&self, multipart: Multipart) -> Result<DetectionResult, DetectError> {
        let started = Instant::now();

        let stored = self.intake.accept(multipart).await.map_err(|e| {
            warn!(error = %e, "Upload intake failed");
            record_outcome("intake_error", started);
            DetectError::Intake(e)
        })?;
        debug!(file = %stored.name, "Upload persisted");

        let guard = StoredFileGuard::new(self.store.clone(), stored);
        let outcome = self.predictor.predict(guard.file()).await;
        guard.release().await;

        match outcome {
            Ok(result) => {
                info!(predictions = result.predictions.len(), "Detection succeeded");
                record_outcome("success", started);
                Ok(result)
            }
            Err(e) => {
                error!(error = %e, "Detection failed");
                record_outcome("inference_error", started);
                Err(e.into())
            }
        }
    }
}

fn record_outcome(outcome: &'static str, started: Instant) {
    metrics::counter!("gateway_detections_total", "outcome" => outcome).increment(1);
    metrics::histogram!("gateway_detection_duration_seconds")
        .record(started.elapsed().as_secs_f64());
}
