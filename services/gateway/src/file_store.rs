//! Disk-backed transient store for uploaded files.
//!
//! All path construction happens here; callers address files by name only.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors raised by the file store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid file name: {0:?}")]
    InvalidName(String),

    #[error("Failed to write {name}: {source}")]
    Write {
        name: String,
        #[source]
        source: io::Error,
    },

    #[error("Storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Descriptor of a file held by the store
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredFile {
    /// Unique name within the store
    pub name: String,
    /// Location on disk
    #[serde(skip)]
    pub path: PathBuf,
    /// File size in bytes
    pub size_bytes: u64,
    /// When the file was created
    pub created_at: DateTime<Utc>,
}

/// Transient file store rooted at a single directory
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Open the store, creating its directory if needed
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        info!(root = %root.display(), "File store ready");

        Ok(Self { root })
    }

    /// Directory backing the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Write a byte stream to a new file called `name`.
    ///
    /// Fails with [`StoreError::Write`] if the file already exists or the
    /// stream/medium fails; a partially written file is removed.
    #[instrument(skip(self, stream))]
    pub async fn put<S, E>(&self, name: &str, stream: S) -> Result<StoredFile, StoreError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = self.path_for(name)?;
        let write_err = |source: io::Error| StoreError::Write {
            name: name.to_string(),
            source,
        };

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(write_err)?;

        match copy_stream(&mut file, stream).await {
            Ok(size_bytes) => {
                debug!(size_bytes, "Stored file");
                Ok(StoredFile {
                    name: name.to_string(),
                    path,
                    size_bytes,
                    created_at: Utc::now(),
                })
            }
            Err(e) => {
                drop(file);
                if let Err(remove_err) = fs::remove_file(&path).await {
                    warn!(error = %remove_err, "Failed to remove partial file");
                }
                Err(write_err(e))
            }
        }
    }

    /// Open a stored file as a byte stream
    pub async fn read(&self, name: &str) -> Result<ReaderStream<File>, StoreError> {
        let path = self.path_for(name)?;
        let file = File::open(&path)
            .await
            .map_err(|e| not_found_or_io(name, e))?;
        Ok(ReaderStream::new(file))
    }

    /// Remove a stored file
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        fs::remove_file(&path)
            .await
            .map_err(|e| not_found_or_io(name, e))?;
        debug!("Deleted file");
        Ok(())
    }

    /// Blocking variant of [`FileStore::delete`] for use from `Drop`
    pub fn delete_blocking(&self, name: &str) -> Result<(), StoreError> {
        let path = self.path_for(name)?;
        std::fs::remove_file(&path).map_err(|e| not_found_or_io(name, e))
    }

    /// Whether a file called `name` is present
    pub async fn exists(&self, name: &str) -> bool {
        match self.path_for(name) {
            Ok(path) => fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Descriptor of a stored file
    pub async fn stat(&self, name: &str) -> Result<StoredFile, StoreError> {
        let path = self.path_for(name)?;
        let metadata = fs::metadata(&path)
            .await
            .map_err(|e| not_found_or_io(name, e))?;
        if !metadata.is_file() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        Ok(describe(name.to_string(), path, &metadata))
    }

    /// All stored files ordered by name
    pub async fn list(&self) -> Result<Vec<StoredFile>, StoreError> {
        let mut entries = fs::read_dir(&self.root).await?;
        let mut files = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                Ok(_) => continue,
                // Removed between read_dir and metadata
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            files.push(describe(name, entry.path(), &metadata));
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn path_for(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

/// Upper bound on the sanitized part of a stored name, in bytes
pub const MAX_SANITIZED_NAME_BYTES: usize = 128;

/// Derive a unique store name from an original client file name.
///
/// Format: `<unix-millis>-<8 hex>-<sanitized name>`.
pub fn unique_name(original: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let nonce = Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", millis, &nonce[..8], sanitize_file_name(original))
}

/// Reduce a client supplied file name to a safe single path component
pub fn sanitize_file_name(original: &str) -> String {
    let base = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        truncate_keeping_extension(cleaned, MAX_SANITIZED_NAME_BYTES)
    }
}

// Input is ASCII after sanitizing, so byte offsets are char boundaries.
fn truncate_keeping_extension(name: String, max: usize) -> String {
    if name.len() <= max {
        return name;
    }

    match name.rfind('.') {
        Some(dot) if dot > 0 && name.len() - dot <= 16 => {
            let extension = &name[dot..];
            format!("{}{}", &name[..max - extension.len()], extension)
        }
        _ => name[..max].to_string(),
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\', '\0']);
    if invalid {
        return Err(StoreError::InvalidName(name.to_string()));
    }
    Ok(())
}

fn not_found_or_io(name: &str, e: io::Error) -> StoreError {
    if e.kind() == io::ErrorKind::NotFound {
        StoreError::NotFound(name.to_string())
    } else {
        StoreError::Io(e)
    }
}

fn describe(name: String, path: PathBuf, metadata: &std::fs::Metadata) -> StoredFile {
    let created_at = metadata
        .created()
        .or_else(|_| metadata.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    StoredFile {
        name,
        path,
        size_bytes: metadata.len(),
        created_at,
    }
}

async fn copy_stream<S, E>(file: &mut File, stream: S) -> io::Result<u64>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let mut stream = std::pin::pin!(stream);
    let mut written = 0u64;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(io::Error::other)?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok(written)
}
