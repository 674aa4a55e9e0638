//! Tracing/logging initialization.
//!
//! The `loggers` config picks the sinks: `STD_OUTPUT` writes to stdout (JSON
//! when `settings.format = "json"`), `FILE` appends to `jobservice.log` under
//! `settings.base_dir`. `RUST_LOG` overrides the configured level.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;

use jobservice_config::{LogLevel, LoggerConfig, LoggerSink};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

#[derive(Debug, Error)]
pub enum ObservabilityError {
    #[error("no logger configured")]
    NoLoggers,

    #[error(transparent)]
    Config(#[from] jobservice_config::ConfigError),

    #[error("open log file '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Map a configured severity to an `EnvFilter` directive.
pub fn filter_directive(level: LogLevel) -> &'static str {
    match level {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warning => "warn",
        LogLevel::Error | LogLevel::Fatal => "error",
    }
}

fn build_layer(logger: &LoggerConfig) -> Result<BoxedLayer, ObservabilityError> {
    let json = logger.setting("format") == Some("json");
    match logger.sink()? {
        LoggerSink::StdOutput => Ok(if json {
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(false)
                .boxed()
        } else {
            tracing_subscriber::fmt::layer().with_target(false).boxed()
        }),
        LoggerSink::File => {
            let dir = logger.setting("base_dir").unwrap_or(crate::DEFAULT_JOB_LOG_DIR);
            let path = Path::new(dir).join("jobservice.log");
            std::fs::create_dir_all(dir).map_err(|source| ObservabilityError::File {
                path: dir.to_string(),
                source,
            })?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| ObservabilityError::File {
                    path: path.display().to_string(),
                    source,
                })?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(false);
            Ok(if json { layer.json().boxed() } else { layer.boxed() })
        }
    }
}

/// Initialize tracing for the process from the `loggers` config.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init(loggers: &[LoggerConfig]) -> Result<(), ObservabilityError> {
    if loggers.is_empty() {
        return Err(ObservabilityError::NoLoggers);
    }

    // The most verbose configured sink decides the default level.
    let mut level = LogLevel::Fatal;
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(loggers.len());
    for logger in loggers {
        level = level.min(logger.log_level()?);
        layers.push(build_layer(logger)?);
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directive(level)));

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init();
    Ok(())
}

/// JSON logs to stdout at `info`, for tools that run before config is loaded.
pub fn init_default() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_map_to_filter_directives() {
        assert_eq!(filter_directive(LogLevel::Debug), "debug");
        assert_eq!(filter_directive(LogLevel::Warning), "warn");
        assert_eq!(filter_directive(LogLevel::Fatal), "error");
    }

    #[test]
    fn empty_logger_list_is_an_error() {
        assert!(matches!(init(&[]), Err(ObservabilityError::NoLoggers)));
    }
}
