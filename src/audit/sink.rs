//! Audit batch destinations.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::AuditRecord;
use crate::{Result, SkaldError};

/// Durable destination for audit records.
///
/// Called only from the audit writer task, one batch at a time. A batch
/// must be written entirely or not at all as far as the caller can tell;
/// on error the writer retries the same batch.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<()>;
}

/// Appends records as JSON lines to a file.
///
/// Each batch is synced to disk before `write_batch` returns. A write that
/// fails partway is truncated back to the length the file had before the
/// batch, so a retried batch is not duplicated. The file is opened lazily
/// and reopened after a failed write, so a rotated or briefly unavailable
/// file recovers on the next retry.
#[derive(Debug)]
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        debug!(path = %self.path.display(), "opened audit log");
        Ok(file)
    }
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    async fn write_batch(&self, records: &[AuditRecord]) -> Result<()> {
        let mut buf = Vec::with_capacity(records.len() * 160);
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut guard = self.file.lock().await;
        let mut file = match guard.take() {
            Some(file) => file,
            None => self.open().await.map_err(|e| {
                SkaldError::AuditWriteFailure(format!("open {}: {e}", self.path.display()))
            })?,
        };

        let start = file
            .metadata()
            .await
            .map_err(|e| {
                SkaldError::AuditWriteFailure(format!("stat {}: {e}", self.path.display()))
            })?
            .len();

        let written = async {
            file.write_all(&buf).await?;
            file.flush().await?;
            file.sync_data().await
        }
        .await;

        match written {
            Ok(()) => {
                *guard = Some(file);
                Ok(())
            }
            // The handle is dropped; the next batch reopens the file.
            Err(e) => {
                truncate_to(&file, start, &self.path).await;
                Err(SkaldError::AuditWriteFailure(format!(
                    "write {}: {e}",
                    self.path.display()
                )))
            }
        }
    }
}

/// Drop whatever part of a failed batch reached the file.
async fn truncate_to(file: &File, len: u64, path: &Path) {
    let rolled_back = async {
        file.set_len(len).await?;
        file.sync_data().await
    }
    .await;
    if let Err(e) = rolled_back {
        warn!(path = %path.display(), error = %e, "could not roll back partial audit batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn partial_write_is_rolled_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        tokio::fs::write(&path, b"{\"committed\":true}\n").await.unwrap();

        let mut file = OpenOptions::new().append(true).open(&path).await.unwrap();
        let start = file.metadata().await.unwrap().len();
        file.write_all(b"{\"half\":").await.unwrap();
        file.flush().await.unwrap();
        truncate_to(&file, start, &path).await;
        drop(file);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "{\"committed\":true}\n");
    }
}
