//! Per-job loggers.
//!
//! Each running job gets a [`JobLogger`] built from the `job_loggers` config:
//! a `FILE` entry appends timestamped lines to `{base_dir}/{job_id}.log`, a
//! `STD_OUTPUT` entry mirrors lines into `tracing` with the job id attached.

use std::fmt::Display;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use jobservice_config::{LogLevel, LoggerConfig, LoggerSink};

use crate::tracing::ObservabilityError;

struct FileSink {
    level: LogLevel,
    path: PathBuf,
    file: Mutex<File>,
}

pub struct JobLogger {
    job_id: String,
    file: Option<FileSink>,
    stdout_level: Option<LogLevel>,
}

impl std::fmt::Debug for JobLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLogger")
            .field("job_id", &self.job_id)
            .field("file", &self.file.as_ref().map(|s| &s.path))
            .finish()
    }
}

impl JobLogger {
    /// Logger that discards everything.
    pub fn noop(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            file: None,
            stdout_level: None,
        }
    }

    pub fn open(job_id: &str, loggers: &[LoggerConfig]) -> Result<Self, ObservabilityError> {
        let mut logger = Self::noop(job_id);
        for config in loggers {
            let level = config.log_level()?;
            match config.sink()? {
                LoggerSink::StdOutput => logger.stdout_level = Some(level),
                LoggerSink::File => {
                    let dir = config.setting("base_dir").unwrap_or(crate::DEFAULT_JOB_LOG_DIR);
                    std::fs::create_dir_all(dir).map_err(|source| ObservabilityError::File {
                        path: dir.to_string(),
                        source,
                    })?;
                    let path = log_path(Path::new(dir), job_id);
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .map_err(|source| ObservabilityError::File {
                            path: path.display().to_string(),
                            source,
                        })?;
                    logger.file = Some(FileSink {
                        level,
                        path,
                        file: Mutex::new(file),
                    });
                }
            }
        }
        Ok(logger)
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn path(&self) -> Option<&Path> {
        self.file.as_ref().map(|s| s.path.as_path())
    }

    pub fn debug(&self, msg: impl Display) {
        self.write(LogLevel::Debug, msg);
    }

    pub fn info(&self, msg: impl Display) {
        self.write(LogLevel::Info, msg);
    }

    pub fn warning(&self, msg: impl Display) {
        self.write(LogLevel::Warning, msg);
    }

    pub fn error(&self, msg: impl Display) {
        self.write(LogLevel::Error, msg);
    }

    fn write(&self, level: LogLevel, msg: impl Display) {
        if let Some(sink) = self.file.as_ref().filter(|s| level >= s.level) {
            let line = format!(
                "{} [{}] {}\n",
                Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                level,
                msg
            );
            if let Ok(mut file) = sink.file.lock() {
                // A job must not fail because its log is unwritable.
                let _ = file.write_all(line.as_bytes());
            }
        }

        if self.stdout_level.is_some_and(|min| level >= min) {
            let job_id = self.job_id.as_str();
            match level {
                LogLevel::Debug => ::tracing::debug!(job_id, "{msg}"),
                LogLevel::Info => ::tracing::info!(job_id, "{msg}"),
                LogLevel::Warning => ::tracing::warn!(job_id, "{msg}"),
                LogLevel::Error | LogLevel::Fatal => ::tracing::error!(job_id, "{msg}"),
            }
        }
    }
}

/// Location of a job's log file under `dir`.
pub fn log_path(dir: &Path, job_id: &str) -> PathBuf {
    dir.join(format!("{job_id}.{}", crate::JOB_LOG_EXTENSION))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn file_logger(dir: &Path, level: &str) -> LoggerConfig {
        let mut settings = BTreeMap::new();
        settings.insert("base_dir".to_string(), dir.display().to_string());
        LoggerConfig {
            name: "FILE".to_string(),
            level: level.to_string(),
            settings,
            sweeper: None,
        }
    }

    #[test]
    fn file_sink_writes_lines_at_or_above_level() {
        let dir = tempfile::tempdir().unwrap();
        let logger = JobLogger::open("abc123", &[file_logger(dir.path(), "INFO")]).unwrap();
        logger.debug("hidden");
        logger.info("step 1/3");
        logger.error("boom");

        let content = std::fs::read_to_string(dir.path().join("abc123.log")).unwrap();
        assert!(!content.contains("hidden"));
        assert!(content.contains("[INFO] step 1/3"));
        assert!(content.contains("[ERROR] boom"));
    }

    #[test]
    fn noop_logger_has_no_file() {
        let logger = JobLogger::noop("x");
        logger.info("nothing happens");
        assert!(logger.path().is_none());
    }
}
