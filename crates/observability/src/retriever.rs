//! Reading job logs back for the API.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::job_logger::log_path;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log of job {0} not found")]
    NotFound(String),

    #[error("invalid job id for log lookup: {0}")]
    InvalidId(String),

    #[error("read log of job {job_id}: {source}")]
    Io {
        job_id: String,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait LogRetriever: Send + Sync {
    /// Raw bytes of the job's log.
    async fn retrieve(&self, job_id: &str) -> Result<Vec<u8>, LogError>;
}

/// Reads `{base_dir}/{job_id}.log`.
#[derive(Debug, Clone)]
pub struct FileLogRetriever {
    base_dir: PathBuf,
}

impl FileLogRetriever {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }
}

#[async_trait]
impl LogRetriever for FileLogRetriever {
    async fn retrieve(&self, job_id: &str) -> Result<Vec<u8>, LogError> {
        if job_id.is_empty() || job_id.contains("..") || job_id.contains(['/', '\\']) {
            return Err(LogError::InvalidId(job_id.to_string()));
        }
        match tokio::fs::read(log_path(&self.base_dir, job_id)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(LogError::NotFound(job_id.to_string()))
            }
            Err(source) => Err(LogError::Io {
                job_id: job_id.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_existing_log() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("job1.log"), b"hello").unwrap();
        let retriever = FileLogRetriever::new(dir.path());
        assert_eq!(retriever.retrieve("job1").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn missing_log_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let retriever = FileLogRetriever::new(dir.path());
        assert!(matches!(retriever.retrieve("nope").await, Err(LogError::NotFound(_))));
    }

    #[tokio::test]
    async fn traversal_is_refused() {
        let retriever = FileLogRetriever::new("/tmp");
        assert!(matches!(
            retriever.retrieve("../etc/passwd").await,
            Err(LogError::InvalidId(_))
        ));
    }
}
