//! Configuration model as read from YAML.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

pub const DEFAULT_PORT: u16 = 9444;
pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_NAMESPACE: &str = "harbor_job_service_namespace";
pub const MIN_MAX_UPDATE_HOURS: u64 = 24;
pub const MIN_MAX_DANGLING_HOURS: u64 = 168;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

impl FromStr for Protocol {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            other => Err(ConfigError::invalid("protocol", format!("unsupported protocol '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpsConfig {
    pub cert: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisPoolConfig {
    #[serde(default)]
    pub redis_url: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_second: i64,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            redis_url: String::new(),
            namespace: default_namespace(),
            idle_timeout_second: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default)]
    pub redis_pool: RedisPoolConfig,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            backend: default_backend(),
            redis_pool: RedisPoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookAgentConfig {
    #[serde(default = "default_shards")]
    pub shards: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_drain_grace")]
    pub drain_grace_seconds: u64,
}

impl Default for HookAgentConfig {
    fn default() -> Self {
        Self {
            shards: default_shards(),
            max_retries: default_max_retries(),
            drain_grace_seconds: default_drain_grace(),
        }
    }
}

/// Severity names accepted in logger configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    #[serde(rename = "DEBUG")]
    Debug,
    #[serde(rename = "INFO")]
    Info,
    #[serde(rename = "WARNING", alias = "WARN")]
    Warning,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "FATAL")]
    Fatal,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARNING" | "WARN" => Ok(Self::Warning),
            "ERROR" => Ok(Self::Error),
            "FATAL" => Ok(Self::Fatal),
            other => Err(ConfigError::invalid("level", format!("unknown log level '{other}'"))),
        }
    }
}

/// Log sink kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerSink {
    StdOutput,
    File,
}

impl FromStr for LoggerSink {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STD_OUTPUT" => Ok(Self::StdOutput),
            "FILE" => Ok(Self::File),
            other => Err(ConfigError::invalid("loggers", format!("unknown logger '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Age in days after which log files are removed.
    pub duration: u32,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub name: String,
    pub level: String,
    #[serde(default)]
    pub settings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sweeper: Option<SweeperConfig>,
}

impl LoggerConfig {
    pub fn sink(&self) -> Result<LoggerSink, ConfigError> {
        self.name.parse()
    }

    pub fn log_level(&self) -> Result<LogLevel, ConfigError> {
        self.level.parse()
    }

    pub fn setting(&self, key: &str) -> Option<&str> {
        self.settings.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_metric_path")]
    pub path: String,
    #[serde(default = "default_metric_port")]
    pub port: u16,
}

impl Default for MetricConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_metric_path(),
            port: default_metric_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_max_update_hours")]
    pub max_update_hours: u64,
    #[serde(default = "default_max_dangling_hours")]
    pub max_dangling_hours: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            max_update_hours: MIN_MAX_UPDATE_HOURS,
            max_dangling_hours: MIN_MAX_DANGLING_HOURS,
        }
    }
}

/// Root of the job service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_config: Option<HttpsConfig>,
    #[serde(default)]
    pub worker_pool: WorkerPoolConfig,
    #[serde(default)]
    pub hook_agent: HookAgentConfig,
    #[serde(default)]
    pub loggers: Vec<LoggerConfig>,
    #[serde(default)]
    pub job_loggers: Vec<LoggerConfig>,
    #[serde(default)]
    pub metric: MetricConfig,
    #[serde(default)]
    pub reaper: ReaperConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            protocol: Protocol::Http,
            port: DEFAULT_PORT,
            https_config: None,
            worker_pool: WorkerPoolConfig::default(),
            hook_agent: HookAgentConfig::default(),
            loggers: Vec::new(),
            job_loggers: Vec::new(),
            metric: MetricConfig::default(),
            reaper: ReaperConfig::default(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_backend() -> String {
    "redis".to_string()
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_idle_timeout() -> i64 {
    3600
}

fn default_shards() -> u32 {
    4
}

fn default_max_retries() -> u32 {
    10
}

fn default_drain_grace() -> u64 {
    10
}

fn default_metric_path() -> String {
    "/metrics".to_string()
}

fn default_metric_port() -> u16 {
    8001
}

fn default_max_update_hours() -> u64 {
    MIN_MAX_UPDATE_HOURS
}

fn default_max_dangling_hours() -> u64 {
    MIN_MAX_DANGLING_HOURS
}
