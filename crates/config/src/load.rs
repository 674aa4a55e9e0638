//! Loading, environment overrides and validation.

use std::path::Path;

use tracing::warn;

use crate::model::{
    Configuration, HttpsConfig, LoggerConfig, MIN_MAX_DANGLING_HOURS, MIN_MAX_UPDATE_HOURS,
    Protocol,
};
use crate::ConfigError;

pub const ENV_PROTOCOL: &str = "JOB_SERVICE_PROTOCOL";
pub const ENV_PORT: &str = "JOB_SERVICE_PORT";
pub const ENV_HTTPS_CERT: &str = "JOB_SERVICE_HTTPS_CERT";
pub const ENV_HTTPS_KEY: &str = "JOB_SERVICE_HTTPS_KEY";
pub const ENV_POOL_BACKEND: &str = "JOB_SERVICE_POOL_BACKEND";
pub const ENV_POOL_WORKERS: &str = "JOB_SERVICE_POOL_WORKERS";
pub const ENV_REDIS_URL: &str = "JOB_SERVICE_POOL_REDIS_URL";
pub const ENV_REDIS_NAMESPACE: &str = "JOB_SERVICE_POOL_REDIS_NAMESPACE";
pub const ENV_REDIS_IDLE_TIMEOUT: &str = "JOB_SERVICE_POOL_REDIS_CONN_IDLE_TIMEOUT_SECOND";
pub const ENV_CORE_SECRET: &str = "CORE_SECRET";

/// Read a config file, apply environment overrides from the process env and validate.
pub fn load(path: &Path) -> Result<Configuration, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let mut cfg = from_yaml(&raw)?;
    apply_env(&mut cfg, |key| std::env::var(key).ok())?;
    validate(&mut cfg)?;
    Ok(cfg)
}

pub fn from_yaml(raw: &str) -> Result<Configuration, ConfigError> {
    serde_yaml::from_str(raw).map_err(ConfigError::Parse)
}

/// Override file values with the recognized environment variables.
///
/// `lookup` abstracts the environment so tests don't mutate process state.
pub fn apply_env<F>(cfg: &mut Configuration, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

    if let Some(protocol) = get(ENV_PROTOCOL) {
        cfg.protocol = protocol.parse()?;
    }
    if let Some(port) = get(ENV_PORT) {
        cfg.port = port
            .parse()
            .map_err(|_| ConfigError::invalid(ENV_PORT, format!("'{port}' is not a valid port")))?;
    }
    if let Some(cert) = get(ENV_HTTPS_CERT) {
        cfg.https_config.get_or_insert_with(HttpsConfig::default).cert = cert;
    }
    if let Some(key) = get(ENV_HTTPS_KEY) {
        cfg.https_config.get_or_insert_with(HttpsConfig::default).key = key;
    }
    if let Some(backend) = get(ENV_POOL_BACKEND) {
        cfg.worker_pool.backend = backend;
    }
    if let Some(workers) = get(ENV_POOL_WORKERS) {
        cfg.worker_pool.workers = workers.parse().map_err(|_| {
            ConfigError::invalid(ENV_POOL_WORKERS, format!("'{workers}' is not a valid worker count"))
        })?;
    }
    if let Some(url) = get(ENV_REDIS_URL) {
        cfg.worker_pool.redis_pool.redis_url = url;
    }
    if let Some(namespace) = get(ENV_REDIS_NAMESPACE) {
        cfg.worker_pool.redis_pool.namespace = namespace;
    }
    if let Some(idle) = get(ENV_REDIS_IDLE_TIMEOUT) {
        cfg.worker_pool.redis_pool.idle_timeout_second = idle.parse().map_err(|_| {
            ConfigError::invalid(ENV_REDIS_IDLE_TIMEOUT, format!("'{idle}' is not an integer"))
        })?;
    }
    Ok(())
}

fn validate_loggers(field: &'static str, loggers: &[LoggerConfig]) -> Result<(), ConfigError> {
    if loggers.is_empty() {
        return Err(ConfigError::invalid(field, "at least one logger is required"));
    }
    for logger in loggers {
        logger.sink()?;
        logger.log_level()?;
    }
    Ok(())
}

/// Check the fatal conditions and normalize values in place.
///
/// The redis URL gains a `redis://` prefix when it has no scheme, and reaper
/// thresholds below their floors are raised to the floor.
pub fn validate(cfg: &mut Configuration) -> Result<(), ConfigError> {
    if cfg.port == 0 {
        return Err(ConfigError::invalid("port", "port must be greater than 0"));
    }

    if cfg.protocol == Protocol::Https {
        let https = cfg
            .https_config
            .as_ref()
            .ok_or_else(|| ConfigError::invalid("https_config", "https requires a certificate and key"))?;
        for (field, path) in [("https_config.cert", &https.cert), ("https_config.key", &https.key)] {
            if path.is_empty() || !Path::new(path).is_file() {
                return Err(ConfigError::invalid(field, format!("file '{path}' does not exist")));
            }
        }
    }

    let pool = &mut cfg.worker_pool;
    if pool.backend != "redis" {
        return Err(ConfigError::invalid(
            "worker_pool.backend",
            format!("unsupported backend '{}'", pool.backend),
        ));
    }
    if pool.workers == 0 {
        return Err(ConfigError::invalid("worker_pool.workers", "at least one worker is required"));
    }
    let redis = &mut pool.redis_pool;
    if redis.redis_url.trim().is_empty() {
        return Err(ConfigError::invalid("worker_pool.redis_pool.redis_url", "redis url is required"));
    }
    if !redis.redis_url.contains("://") {
        redis.redis_url = format!("redis://{}", redis.redis_url.trim());
    }
    if redis.namespace.trim().is_empty() {
        return Err(ConfigError::invalid("worker_pool.redis_pool.namespace", "namespace is required"));
    }

    if cfg.hook_agent.shards == 0 {
        return Err(ConfigError::invalid("hook_agent.shards", "at least one shard is required"));
    }

    validate_loggers("loggers", &cfg.loggers)?;
    validate_loggers("job_loggers", &cfg.job_loggers)?;

    if cfg.metric.enabled && !cfg.metric.path.starts_with('/') {
        return Err(ConfigError::invalid("metric.path", "metric path must start with '/'"));
    }

    if cfg.reaper.max_update_hours < MIN_MAX_UPDATE_HOURS {
        warn!(
            configured = cfg.reaper.max_update_hours,
            floor = MIN_MAX_UPDATE_HOURS,
            "reaper max_update_hours below floor, using floor"
        );
        cfg.reaper.max_update_hours = MIN_MAX_UPDATE_HOURS;
    }
    if cfg.reaper.max_dangling_hours < MIN_MAX_DANGLING_HOURS {
        warn!(
            configured = cfg.reaper.max_dangling_hours,
            floor = MIN_MAX_DANGLING_HOURS,
            "reaper max_dangling_hours below floor, using floor"
        );
        cfg.reaper.max_dangling_hours = MIN_MAX_DANGLING_HOURS;
    }

    Ok(())
}

/// Secret presented to core when delivering hooks.
pub fn core_secret() -> Option<String> {
    std::env::var(ENV_CORE_SECRET).ok().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
protocol: http
port: 9444
worker_pool:
  workers: 4
  backend: redis
  redis_pool:
    redis_url: localhost:6379/1
    namespace: ns
loggers:
  - name: STD_OUTPUT
    level: INFO
job_loggers:
  - name: FILE
    level: DEBUG
    settings: { base_dir: /tmp/job_logs }
    sweeper: { duration: 1, settings: { work_dir: /tmp/job_logs } }
reaper: { max_update_hours: 2, max_dangling_hours: 500 }
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn sample_config_validates_and_normalizes() {
        let mut cfg = from_yaml(SAMPLE).unwrap();
        validate(&mut cfg).unwrap();
        assert_eq!(cfg.worker_pool.redis_pool.redis_url, "redis://localhost:6379/1");
        assert_eq!(cfg.reaper.max_update_hours, MIN_MAX_UPDATE_HOURS);
        assert_eq!(cfg.reaper.max_dangling_hours, 500);
        assert_eq!(cfg.hook_agent.max_retries, 10);
        assert_eq!(cfg.job_loggers[0].setting("base_dir"), Some("/tmp/job_logs"));
    }

    #[test]
    fn env_overrides_file_values() {
        let mut cfg = from_yaml(SAMPLE).unwrap();
        apply_env(
            &mut cfg,
            env(&[
                (ENV_PORT, "8080"),
                (ENV_POOL_WORKERS, "16"),
                (ENV_REDIS_NAMESPACE, "other"),
                (ENV_REDIS_URL, "redis://redis:6379/2"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.worker_pool.workers, 16);
        assert_eq!(cfg.worker_pool.redis_pool.namespace, "other");
        assert_eq!(cfg.worker_pool.redis_pool.redis_url, "redis://redis:6379/2");
    }

    #[test]
    fn invalid_env_values_are_errors() {
        let mut cfg = from_yaml(SAMPLE).unwrap();
        assert!(apply_env(&mut cfg, env(&[(ENV_PORT, "not-a-port")])).is_err());
        assert!(apply_env(&mut cfg, env(&[(ENV_PROTOCOL, "ftp")])).is_err());
    }

    #[test]
    fn fatal_conditions_are_rejected() {
        let mut cfg = from_yaml(SAMPLE).unwrap();
        cfg.worker_pool.backend = "memory".to_string();
        assert!(validate(&mut cfg).is_err());

        let mut cfg = from_yaml(SAMPLE).unwrap();
        cfg.worker_pool.redis_pool.namespace = String::new();
        assert!(validate(&mut cfg).is_err());

        let mut cfg = from_yaml(SAMPLE).unwrap();
        cfg.loggers.clear();
        assert!(validate(&mut cfg).is_err());

        let mut cfg = from_yaml(SAMPLE).unwrap();
        cfg.protocol = Protocol::Https;
        cfg.https_config = Some(HttpsConfig {
            cert: "/definitely/missing/cert.pem".to_string(),
            key: "/definitely/missing/key.pem".to_string(),
        });
        assert!(validate(&mut cfg).is_err());
    }

    #[test]
    fn https_accepts_existing_files() {
        let mut cert = tempfile::NamedTempFile::new().unwrap();
        writeln!(cert, "cert").unwrap();
        let mut key = tempfile::NamedTempFile::new().unwrap();
        writeln!(key, "key").unwrap();

        let mut cfg = from_yaml(SAMPLE).unwrap();
        cfg.protocol = Protocol::Https;
        cfg.https_config = Some(HttpsConfig {
            cert: cert.path().display().to_string(),
            key: key.path().display().to_string(),
        });
        validate(&mut cfg).unwrap();
    }

    #[test]
    fn load_reads_a_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = load(file.path()).unwrap();
        assert_eq!(cfg.worker_pool.workers, 4);
    }

    #[test]
    fn unknown_logger_level_is_rejected() {
        let mut cfg = from_yaml(SAMPLE).unwrap();
        cfg.loggers[0].level = "LOUD".to_string();
        assert!(validate(&mut cfg).is_err());
    }
}
