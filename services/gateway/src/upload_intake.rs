//! Multipart upload intake: find the file field and persist it.

use crate::file_store::{unique_name, FileStore, StoreError, StoredFile};
use axum::extract::multipart::{Multipart, MultipartError};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};

/// Multipart field carrying the uploaded image
pub const FILE_FIELD: &str = "image";

/// Errors raised while accepting an upload
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("No file provided in field 'image'")]
    NoFileProvided,

    #[error("Malformed multipart body: {0}")]
    Multipart(#[from] MultipartError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Validates inbound multipart requests and persists their file field
#[derive(Debug, Clone)]
pub struct UploadIntake {
    store: Arc<FileStore>,
}

impl UploadIntake {
    pub fn new(store: Arc<FileStore>) -> Self {
        Self { store }
    }

    /// Persist the first `image` field of the request under a unique name.
    ///
    /// Other fields, and `image` fields without a file name, are skipped.
    /// Nothing is written when no file field is present.
    #[instrument(skip_all)]
    pub async fn accept(&self, mut multipart: Multipart) -> Result<StoredFile, IntakeError> {
        while let Some(field) = multipart.next_field().await? {
            if field.name() != Some(FILE_FIELD) {
                debug!(field = ?field.name(), "Skipping multipart field");
                continue;
            }

            // Text fields share the name but carry no file
            let Some(original) = field.file_name().map(str::to_string) else {
                debug!("Skipping image field without a file name");
                continue;
            };
            let name = unique_name(&original);
            let stored = self.store.put(&name, field).await?;

            info!(
                file = %stored.name,
                original = %original,
                size_bytes = stored.size_bytes,
                "Upload persisted"
            );
            metrics::counter!("gateway_uploads_total").increment(1);

            return Ok(stored);
        }

        Err(IntakeError::NoFileProvided)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::multipart;

    async fn intake() -> (tempfile::TempDir, Arc<FileStore>, UploadIntake) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let intake = UploadIntake::new(store.clone());
        (dir, store, intake)
    }

    #[tokio::test]
    async fn test_persists_image_field() {
        let (_dir, store, intake) = intake().await;
        let body = multipart(&[
            ("note", None, "hi"),
            ("image", Some("poster.jpg"), "jpegbytes"),
        ])
        .await;

        let stored = intake.accept(body).await.unwrap();
        assert!(stored.name.ends_with("-poster.jpg"));
        assert_eq!(stored.size_bytes, 9);
        assert!(store.exists(&stored.name).await);
    }

    #[tokio::test]
    async fn test_missing_file_field_touches_nothing() {
        let (_dir, store, intake) = intake().await;
        let body = multipart(&[("other", Some("a.jpg"), "data")]).await;

        let err = intake.accept(body).await.unwrap_err();
        assert!(matches!(err, IntakeError::NoFileProvided));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_text_image_field_is_not_a_file() {
        let (_dir, store, intake) = intake().await;
        let body = multipart(&[("image", None, "just text")]).await;

        let err = intake.accept(body).await.unwrap_err();
        assert!(matches!(err, IntakeError::NoFileProvided));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_overlong_file_name_is_stored() {
        let (_dir, store, intake) = intake().await;
        let long_name = format!("{}.jpg", "a".repeat(250));
        let body = multipart(&[("image", Some(long_name.as_str()), "jpegbytes")]).await;

        let stored = intake.accept(body).await.unwrap();
        assert!(stored.name.ends_with(".jpg"));
        assert!(stored.name.len() < 255);
        assert!(store.exists(&stored.name).await);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_get_distinct_names() {
        let (_dir, store, intake) = intake().await;

        let (a, b) = tokio::join!(
            async { intake.accept(multipart(&[("image", Some("same.png"), "one")]).await).await },
            async { intake.accept(multipart(&[("image", Some("same.png"), "two")]).await).await },
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_ne!(a.name, b.name);
        assert_eq!(store.list().await.unwrap().len(), 2);
    }
}
