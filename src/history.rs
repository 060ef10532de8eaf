//! Audit log of finished jobs.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::EngineError;
use crate::job::AuditRecord;

/// Receives one record per job that reaches a terminal state.
///
/// Callers treat this as fire-and-forget: a failing sink is logged and never
/// changes the outcome of the job.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, record: AuditRecord) -> Result<(), EngineError>;
}

/// Appends records as JSON lines to a file.
pub struct JsonlHistory {
    path: PathBuf,
}

impl JsonlHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Reads every record back, skipping lines that do not parse.
    pub async fn read_all(&self) -> Result<Vec<AuditRecord>, EngineError> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect())
    }
}

#[async_trait]
impl HistorySink for JsonlHistory {
    async fn record(&self, record: AuditRecord) -> Result<(), EngineError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
