//! The per-file work behind the batch handlers.
//!
//! PDF extraction and spreadsheet generation live outside this crate; the
//! batch handlers reach them through the [`QuoteProcessor`] trait.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

use super::job::ConfigMap;

/// Leading bytes of every PDF document.
const PDF_SIGNATURE: &[u8] = b"%PDF";

/// Outcome of validating a single input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCheck {
    pub path: String,
    pub valid: bool,
    pub size_bytes: u64,
    /// Why the file is not usable, if it is not.
    pub reason: Option<String>,
}

impl FileCheck {
    pub fn valid(path: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            path: path.into(),
            valid: true,
            size_bytes,
            reason: None,
        }
    }

    pub fn invalid(path: impl Into<String>, size_bytes: u64, reason: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            valid: false,
            size_bytes,
            reason: Some(reason.into()),
        }
    }
}

/// Quote extraction and spreadsheet generation, as seen by the batch tasks.
///
/// `validate` reports unusable files as data (`FileCheck::valid == false`);
/// an `Err` means the check itself could not run and counts against retries.
#[async_trait]
pub trait QuoteProcessor: Send + Sync {
    async fn validate(&self, path: &Path) -> Result<FileCheck, TaskError>;

    async fn process(
        &self,
        files: &[PathBuf],
        config: &ConfigMap,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError>;
}

/// Built-in processor that only inspects files on disk.
///
/// A file is valid when it exists, is non-empty and starts with `%PDF`.
/// Processing reports each file's size.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileCheckProcessor;

impl FileCheckProcessor {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl QuoteProcessor for FileCheckProcessor {
    async fn validate(&self, path: &Path) -> Result<FileCheck, TaskError> {
        let display = path.display().to_string();

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Ok(FileCheck::invalid(display, 0, "file not found"));
            }
            Err(e) => {
                return Err(TaskError::execution(format!(
                    "failed to stat {}: {}",
                    display, e
                )))
            }
        };

        if !metadata.is_file() {
            return Ok(FileCheck::invalid(display, 0, "not a regular file"));
        }

        let size = metadata.len();
        if size == 0 {
            return Ok(FileCheck::invalid(display, 0, "file is empty"));
        }

        if size < PDF_SIGNATURE.len() as u64 {
            return Ok(FileCheck::invalid(display, size, "missing %PDF signature"));
        }

        let mut header = [0u8; 4];
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| TaskError::execution(format!("failed to open {}: {}", display, e)))?;
        file.read_exact(&mut header)
            .await
            .map_err(|e| TaskError::execution(format!("failed to read {}: {}", display, e)))?;

        if header[..] != *PDF_SIGNATURE {
            return Ok(FileCheck::invalid(display, size, "missing %PDF signature"));
        }

        Ok(FileCheck::valid(display, size))
    }

    async fn process(
        &self,
        files: &[PathBuf],
        _config: &ConfigMap,
        cancel: &CancellationToken,
    ) -> Result<Value, TaskError> {
        let mut processed = Vec::with_capacity(files.len());
        let mut total_bytes = 0u64;

        for path in files {
            if cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }

            let metadata = tokio::fs::metadata(path).await.map_err(|e| {
                TaskError::execution(format!("failed to stat {}: {}", path.display(), e))
            })?;
            total_bytes += metadata.len();
            processed.push(json!({
                "path": path.display().to_string(),
                "size_bytes": metadata.len(),
            }));
        }

        Ok(json!({
            "files": processed,
            "total_bytes": total_bytes,
        }))
    }
}
