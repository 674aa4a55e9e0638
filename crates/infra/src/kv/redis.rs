//! Redis-backed KV store.
//!
//! Regular commands share one auto-reconnecting [`ConnectionManager`].
//! `BLPOP` parks a connection for its whole timeout, so blocking pops use
//! their own small pool of multiplexed connections, dropped once idle for
//! longer than the configured idle timeout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::{FromRedisValue, Script};
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{CasOutcome, KvError, KvResult, KvStore, ZAddMode};

/// `{status, version}`: 1 applied, 0 version mismatch, -1 missing.
const HCAS_SCRIPT: &str = r#"
local cur = redis.call('HGET', KEYS[1], ARGV[1])
if not cur then
  return {-1, 0}
end
cur = tonumber(cur)
if cur ~= tonumber(ARGV[2]) then
  return {0, cur}
end
local nxt = cur + 1
local args = {ARGV[1], tostring(nxt)}
for i = 3, #ARGV do
  args[#args + 1] = ARGV[i]
end
redis.call('HSET', KEYS[1], unpack(args))
return {1, nxt}
"#;

const DEL_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

const EXPIRE_IF_EQ_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return 0
"#;

/// Connection and command deadlines.
#[derive(Debug, Clone, Copy)]
pub struct RedisTimeouts {
    pub dial: Duration,
    pub read: Duration,
    pub write: Duration,
    /// Idle blocking connections older than this are closed.
    pub idle: Duration,
}

impl Default for RedisTimeouts {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(30),
            read: Duration::from_secs(70),
            write: Duration::from_secs(10),
            idle: Duration::from_secs(3600),
        }
    }
}

impl From<::redis::RedisError> for KvError {
    fn from(e: ::redis::RedisError) -> Self {
        if e.is_timeout() {
            KvError::Timeout
        } else if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            KvError::Connection(e.to_string())
        } else {
            KvError::Command(e.to_string())
        }
    }
}

fn score_arg(score: f64) -> String {
    if score == f64::INFINITY {
        "+inf".to_string()
    } else if score == f64::NEG_INFINITY {
        "-inf".to_string()
    } else {
        score.to_string()
    }
}

fn millis(ttl: Duration) -> u64 {
    ttl.as_millis().max(1) as u64
}

pub struct RedisStore {
    client: ::redis::Client,
    conn: ConnectionManager,
    blocking: Mutex<Vec<(MultiplexedConnection, Instant)>>,
    timeouts: RedisTimeouts,
    hcas: Script,
    del_if_eq: Script,
    expire_if_eq: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

impl RedisStore {
    /// Connect to `redis_url` (e.g. `redis://localhost:6379/1`).
    pub async fn connect(redis_url: &str, timeouts: RedisTimeouts) -> KvResult<Self> {
        let client = ::redis::Client::open(redis_url).map_err(|e| KvError::Connection(e.to_string()))?;
        let conn = tokio::time::timeout(timeouts.dial, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| KvError::Timeout)?
            .map_err(|e| KvError::Connection(e.to_string()))?;
        info!(url = %redact(redis_url), "connected to redis");
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(Vec::new()),
            timeouts,
            hcas: Script::new(HCAS_SCRIPT),
            del_if_eq: Script::new(DEL_IF_EQ_SCRIPT),
            expire_if_eq: Script::new(EXPIRE_IF_EQ_SCRIPT),
        })
    }

    async fn query<T: FromRedisValue>(&self, cmd: &::redis::Cmd, deadline: Duration) -> KvResult<T> {
        let mut conn = self.conn.clone();
        tokio::time::timeout(deadline, cmd.query_async::<_, T>(&mut conn))
            .await
            .map_err(|_| KvError::Timeout)?
            .map_err(KvError::from)
    }

    async fn read<T: FromRedisValue>(&self, cmd: &::redis::Cmd) -> KvResult<T> {
        self.query(cmd, self.timeouts.read).await
    }

    async fn write<T: FromRedisValue>(&self, cmd: &::redis::Cmd) -> KvResult<T> {
        self.query(cmd, self.timeouts.write).await
    }

    async fn take_blocking(&self) -> KvResult<MultiplexedConnection> {
        {
            let mut pool = self.blocking.lock().await;
            while let Some((conn, last_used)) = pool.pop() {
                if last_used.elapsed() < self.timeouts.idle {
                    return Ok(conn);
                }
                debug!("dropping idle blocking redis connection");
            }
        }
        tokio::time::timeout(self.timeouts.dial, self.client.get_multiplexed_tokio_connection())
            .await
            .map_err(|_| KvError::Timeout)?
            .map_err(|e| KvError::Connection(e.to_string()))
    }

    async fn give_back(&self, conn: MultiplexedConnection) {
        self.blocking.lock().await.push((conn, Instant::now()));
    }

    async fn zrange_inner(
        &self,
        command: &str,
        key: &str,
        first: f64,
        second: f64,
        offset: usize,
        count: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        let mut cmd = ::redis::cmd(command);
        cmd.arg(key)
            .arg(score_arg(first))
            .arg(score_arg(second))
            .arg("WITHSCORES");
        if offset > 0 || count.is_some() {
            let count = count.map_or(-1, |c| c as i64);
            cmd.arg("LIMIT").arg(offset).arg(count);
        }
        self.read(&cmd).await
    }
}

/// Hide credentials when logging a redis URL.
fn redact(url: &str) -> String {
    match url::Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => {
            let _ = parsed.set_password(Some("***"));
            parsed.to_string()
        }
        _ => url.to_string(),
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn ping(&self) -> KvResult<()> {
        let _: String = self.read(&::redis::cmd("PING")).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.read(::redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let _: () = self.write(&cmd).await?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        let mut cmd = ::redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(millis(ttl));
        }
        let reply: Option<String> = self.write(&cmd).await?;
        Ok(reply.is_some())
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        let n: u64 = self.write(::redis::cmd("DEL").arg(key)).await?;
        Ok(n > 0)
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let n: u64 = self.read(::redis::cmd("EXISTS").arg(key)).await?;
        Ok(n > 0)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let n: u64 = self
            .write(::redis::cmd("PEXPIRE").arg(key).arg(millis(ttl)))
            .await?;
        Ok(n > 0)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let n: u64 = tokio::time::timeout(
            self.timeouts.write,
            self.del_if_eq.key(key).arg(expected).invoke_async::<_, u64>(&mut conn),
        )
        .await
        .map_err(|_| KvError::Timeout)??;
        Ok(n > 0)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let n: u64 = tokio::time::timeout(
            self.timeouts.write,
            self.expire_if_eq
                .key(key)
                .arg(expected)
                .arg(millis(ttl))
                .invoke_async::<_, u64>(&mut conn),
        )
        .await
        .map_err(|_| KvError::Timeout)??;
        Ok(n > 0)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut cmd = ::redis::cmd("HSET");
        cmd.arg(key);
        for (field, value) in fields {
            cmd.arg(field).arg(value);
        }
        let _: u64 = self.write(&cmd).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        self.read(::redis::cmd("HGET").arg(key).arg(field)).await
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        self.read(::redis::cmd("HGETALL").arg(key)).await
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        let n: u64 = self.write(::redis::cmd("HDEL").arg(key).arg(field)).await?;
        Ok(n > 0)
    }

    async fn hcas(
        &self,
        key: &str,
        version_field: &str,
        expected: u64,
        fields: &[(String, String)],
    ) -> KvResult<CasOutcome> {
        let mut invocation = self.hcas.prepare_invoke();
        invocation.key(key).arg(version_field).arg(expected);
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }
        let mut conn = self.conn.clone();
        let reply: Vec<i64> = tokio::time::timeout(
            self.timeouts.write,
            invocation.invoke_async::<_, Vec<i64>>(&mut conn),
        )
        .await
        .map_err(|_| KvError::Timeout)??;
        match reply.as_slice() {
            [1, version] => Ok(CasOutcome::Applied(*version as u64)),
            [0, version] => Ok(CasOutcome::VersionMismatch(*version as u64)),
            [-1, _] => Ok(CasOutcome::Missing),
            other => Err(KvError::Command(format!("unexpected hcas reply {other:?}"))),
        }
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, mode: ZAddMode) -> KvResult<()> {
        let mut cmd = ::redis::cmd("ZADD");
        cmd.arg(key);
        match mode {
            ZAddMode::Always => {}
            ZAddMode::Nx => {
                cmd.arg("NX");
            }
            ZAddMode::Xx => {
                cmd.arg("XX");
            }
        }
        cmd.arg(score_arg(score)).arg(member);
        let _: u64 = self.write(&cmd).await?;
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let n: u64 = self.write(::redis::cmd("ZREM").arg(key).arg(member)).await?;
        Ok(n > 0)
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        self.read(::redis::cmd("ZSCORE").arg(key).arg(member)).await
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        self.read(::redis::cmd("ZCARD").arg(key)).await
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        self.read(
            ::redis::cmd("ZCOUNT")
                .arg(key)
                .arg(score_arg(min))
                .arg(score_arg(max)),
        )
        .await
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        count: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        self.zrange_inner("ZRANGEBYSCORE", key, min, max, offset, count)
            .await
    }

    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        self.zrange_inner("ZREVRANGEBYSCORE", key, max, min, offset, count)
            .await
    }

    async fn rpush(&self, key: &str, value: &str) -> KvResult<u64> {
        self.write(::redis::cmd("RPUSH").arg(key).arg(value)).await
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<u64> {
        self.write(::redis::cmd("LPUSH").arg(key).arg(value)).await
    }

    async fn lpop(&self, key: &str) -> KvResult<Option<String>> {
        self.write(::redis::cmd("LPOP").arg(key)).await
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> KvResult<Option<(String, String)>> {
        let mut conn = self.take_blocking().await?;
        let secs = timeout.as_secs().max(1);
        let mut cmd = ::redis::cmd("BLPOP");
        cmd.arg(keys).arg(secs);
        let deadline = Duration::from_secs(secs) + self.timeouts.read;
        let result = tokio::time::timeout(
            deadline,
            cmd.query_async::<_, Option<(String, String)>>(&mut conn),
        )
        .await;
        match result {
            Ok(Ok(popped)) => {
                self.give_back(conn).await;
                Ok(popped)
            }
            // A failed or abandoned connection is not reused.
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(KvError::Timeout),
        }
    }

    async fn lindex(&self, key: &str, index: i64) -> KvResult<Option<String>> {
        self.read(::redis::cmd("LINDEX").arg(key).arg(index)).await
    }

    async fn lset(&self, key: &str, index: i64, value: &str) -> KvResult<()> {
        let _: () = self
            .write(::redis::cmd("LSET").arg(key).arg(index).arg(value))
            .await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        self.read(::redis::cmd("LLEN").arg(key)).await
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<u64> {
        self.write(::redis::cmd("LREM").arg(key).arg(0).arg(value))
            .await
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> KvResult<(u64, Vec<String>)> {
        self.read(
            ::redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count),
        )
        .await
    }
}
