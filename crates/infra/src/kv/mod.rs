//! Key-value store adapter.
//!
//! The job service keeps all shared state (job records, queues, policies,
//! hook queues, heartbeats) in one KV store. [`KvStore`] exposes the typed
//! operations the service needs; [`RedisStore`] is the production backend and
//! [`InMemoryStore`] backs tests and single-process runs.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod keys;
pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use keys::Keys;
pub use memory::InMemoryStore;
#[cfg(feature = "redis")]
pub use self::redis::{RedisStore, RedisTimeouts};

pub type KvResult<T> = Result<T, KvError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KvError {
    #[error("kv connection error: {0}")]
    Connection(String),

    #[error("kv command error: {0}")]
    Command(String),

    #[error("kv operation timed out")]
    Timeout,

    #[error("wrong value type at key '{0}'")]
    WrongType(String),

    #[error("kv store lock poisoned")]
    Poisoned,
}

/// Result of a versioned hash update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// Fields written; carries the new version.
    Applied(u64),
    /// Stored version differed; carries the stored version.
    VersionMismatch(u64),
    /// No record (or no version field) at the key.
    Missing,
}

/// Sorted-set insert modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZAddMode {
    Always,
    /// Only add new members.
    Nx,
    /// Only update existing members.
    Xx,
}

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn ping(&self) -> KvResult<()>;

    async fn get(&self, key: &str) -> KvResult<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()>;
    /// Set only when absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool>;
    async fn del(&self, key: &str) -> KvResult<bool>;
    async fn exists(&self, key: &str) -> KvResult<bool>;
    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool>;
    /// Delete a string key only while it still holds `expected`.
    async fn del_if_eq(&self, key: &str, expected: &str) -> KvResult<bool>;
    /// Refresh the TTL of a string key only while it still holds `expected`.
    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> KvResult<bool>;

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()>;
    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>>;
    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>>;
    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool>;
    /// Compare-and-set on the integer `version_field` of a hash.
    ///
    /// When the stored version equals `expected`, writes `fields` and bumps the
    /// version by one atomically.
    async fn hcas(
        &self,
        key: &str,
        version_field: &str,
        expected: u64,
        fields: &[(String, String)],
    ) -> KvResult<CasOutcome>;

    async fn zadd(&self, key: &str, member: &str, score: f64, mode: ZAddMode) -> KvResult<()>;
    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool>;
    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>>;
    async fn zcard(&self, key: &str) -> KvResult<u64>;
    async fn zcount(&self, key: &str, min: f64, max: f64) -> KvResult<u64>;
    /// Members with `min <= score <= max`, ascending by score.
    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        count: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>>;
    /// Members with `min <= score <= max`, descending by score.
    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>>;

    async fn rpush(&self, key: &str, value: &str) -> KvResult<u64>;
    async fn lpush(&self, key: &str, value: &str) -> KvResult<u64>;
    async fn lpop(&self, key: &str) -> KvResult<Option<String>>;
    /// Pop from the first non-empty list, waiting up to `timeout`.
    ///
    /// Returns the list key together with the popped value.
    async fn blpop(&self, keys: &[String], timeout: Duration) -> KvResult<Option<(String, String)>>;
    async fn lindex(&self, key: &str, index: i64) -> KvResult<Option<String>>;
    async fn lset(&self, key: &str, index: i64, value: &str) -> KvResult<()>;
    async fn llen(&self, key: &str) -> KvResult<u64>;
    /// Remove every occurrence of `value`.
    async fn lrem(&self, key: &str, value: &str) -> KvResult<u64>;

    /// One step of a cursor walk over keys matching a `*` glob. Cursor 0 starts
    /// the walk; a returned cursor of 0 ends it.
    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> KvResult<(u64, Vec<String>)>;
}

/// Walk every key matching `pattern`.
pub async fn scan_all(kv: &dyn KvStore, pattern: &str) -> KvResult<Vec<String>> {
    let mut cursor = 0;
    let mut keys = Vec::new();
    loop {
        let (next, mut batch) = kv.scan(cursor, pattern, 100).await?;
        keys.append(&mut batch);
        if next == 0 {
            break;
        }
        cursor = next;
    }
    keys.sort();
    keys.dedup();
    Ok(keys)
}
