//! Artifact upload
//!
//! The finished recording is posted as multipart field `file` named
//! `<prefix>_<unix millis>.wav`. When the backend rejects it or cannot be
//! reached, the bytes are written to the local artifact directory and the
//! path is returned in the error so the caller can retry later.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::audio::wav::WAV_MIME;
use crate::backend::{BackendClient, BackendError};
use crate::paths;
use crate::recorder::RecordedConversation;

/// Where a page uploads its recordings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    pub path: String,
    pub prefix: String,
}

impl UploadTarget {
    pub fn new(path: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            prefix: prefix.into(),
        }
    }

    pub fn checkin() -> Self {
        Self::new("/upload-checkin", "checkin")
    }

    pub fn insurance_consultation() -> Self {
        Self::new("/upload-insurance-consultation", "insurance_consultation")
    }
}

/// `<prefix>_<unix millis>.wav`
pub fn artifact_file_name(prefix: &str, at: DateTime<Utc>) -> String {
    format!("{}_{}.wav", prefix, at.timestamp_millis())
}

/// Successful upload
#[derive(Debug, Clone)]
pub struct UploadReceipt {
    pub file_name: String,
    pub bytes: usize,
    /// Backend response body
    pub response: Value,
}

/// Errors that can occur while uploading an artifact
#[derive(Debug, Clone, PartialEq)]
pub enum UploadError {
    /// The backend did not accept the artifact. `kept_at` is the local copy,
    /// if it could be written.
    Failed {
        message: String,
        kept_at: Option<PathBuf>,
    },
    /// A kept artifact could not be read back for retry
    Io(String),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::Failed {
                message,
                kept_at: Some(path),
            } => write!(f, "Upload failed: {} (kept at {:?})", message, path),
            UploadError::Failed {
                message,
                kept_at: None,
            } => write!(f, "Upload failed: {}", message),
            UploadError::Io(e) => write!(f, "Failed to read artifact: {}", e),
        }
    }
}

impl std::error::Error for UploadError {}

pub struct ArtifactUploader {
    backend: BackendClient,
    target: UploadTarget,
    keep_dir: PathBuf,
    keep_count: usize,
}

impl ArtifactUploader {
    pub fn new(backend: BackendClient, target: UploadTarget) -> Self {
        Self {
            backend,
            target,
            keep_dir: paths::artifact_dir(),
            keep_count: paths::MAX_KEPT_ARTIFACTS,
        }
    }

    /// Directory for artifacts whose upload failed.
    pub fn with_keep_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.keep_dir = dir.into();
        self
    }

    pub fn target(&self) -> &UploadTarget {
        &self.target
    }

    pub async fn upload(&self, recording: RecordedConversation) -> Result<UploadReceipt, UploadError> {
        let file_name = artifact_file_name(&self.target.prefix, Utc::now());
        let bytes = recording.into_wav_bytes();
        match self.send(&file_name, bytes.clone()).await {
            Ok(receipt) => Ok(receipt),
            Err(e) => {
                log::error!("Upload: {} rejected: {}", file_name, e);
                let kept_at = self.keep(&file_name, &bytes).await;
                Err(UploadError::Failed {
                    message: e.to_string(),
                    kept_at,
                })
            }
        }
    }

    /// Upload an artifact kept by an earlier failure. The local copy is
    /// removed once the backend accepts it.
    pub async fn retry(&self, kept_at: &Path) -> Result<UploadReceipt, UploadError> {
        let bytes = tokio::fs::read(kept_at)
            .await
            .map_err(|e| UploadError::Io(format!("{:?}: {}", kept_at, e)))?;
        let file_name = kept_at
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| artifact_file_name(&self.target.prefix, Utc::now()));

        let receipt = self
            .send(&file_name, bytes)
            .await
            .map_err(|e| UploadError::Failed {
                message: e.to_string(),
                kept_at: Some(kept_at.to_path_buf()),
            })?;

        if let Err(e) = tokio::fs::remove_file(kept_at).await {
            log::warn!("Upload: failed to remove kept artifact {:?}: {}", kept_at, e);
        }
        Ok(receipt)
    }

    async fn send(&self, file_name: &str, bytes: Vec<u8>) -> Result<UploadReceipt, BackendError> {
        let size = bytes.len();
        let response = self
            .backend
            .upload_file(&self.target.path, file_name, WAV_MIME, bytes)
            .await?;
        log::info!("Upload: {} accepted ({} bytes)", file_name, size);
        Ok(UploadReceipt {
            file_name: file_name.to_string(),
            bytes: size,
            response,
        })
    }

    async fn keep(&self, file_name: &str, bytes: &[u8]) -> Option<PathBuf> {
        if let Err(e) = tokio::fs::create_dir_all(&self.keep_dir).await {
            log::error!("Upload: failed to create {:?}: {}", self.keep_dir, e);
            return None;
        }
        let path = self.keep_dir.join(file_name);
        if let Err(e) = tokio::fs::write(&path, bytes).await {
            log::error!("Upload: failed to keep artifact at {:?}: {}", path, e);
            return None;
        }
        log::info!("Upload: artifact kept at {:?}", path);

        match paths::prune_artifacts(&self.keep_dir, self.keep_count) {
            Ok(0) => {}
            Ok(n) => log::debug!("Upload: pruned {} old artifacts", n),
            Err(e) => log::warn!("Upload: failed to prune artifacts: {}", e),
        }
        Some(path)
    }
}
