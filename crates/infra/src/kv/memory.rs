//! In-memory KV store.
//!
//! Mirrors the Redis semantics the service relies on (TTL, sorted-set
//! ordering, blocking pops, cursor scans) inside one process.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{CasOutcome, KvError, KvResult, KvStore, ZAddMode};

#[derive(Debug, Default)]
struct State {
    strings: HashMap<String, String>,
    hashes: HashMap<String, HashMap<String, String>>,
    zsets: HashMap<String, HashMap<String, f64>>,
    lists: HashMap<String, VecDeque<String>>,
    expiry: HashMap<String, Instant>,
}

impl State {
    fn remove(&mut self, key: &str) -> bool {
        self.expiry.remove(key);
        let a = self.strings.remove(key).is_some();
        let b = self.hashes.remove(key).is_some();
        let c = self.zsets.remove(key).is_some();
        let d = self.lists.remove(key).is_some();
        a || b || c || d
    }

    fn purge(&mut self, key: &str) {
        if self.expiry.get(key).is_some_and(|at| *at <= Instant::now()) {
            self.remove(key);
        }
    }

    fn purge_all(&mut self) {
        let now = Instant::now();
        let expired: Vec<String> = self
            .expiry
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
    }

    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key)
            || self.hashes.contains_key(key)
            || self.zsets.contains_key(key)
            || self.lists.contains_key(key)
    }

    fn all_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .strings
            .keys()
            .chain(self.hashes.keys())
            .chain(self.zsets.keys())
            .chain(self.lists.keys())
            .cloned()
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn sorted_members(&self, key: &str, min: f64, max: f64) -> Vec<(String, f64)> {
        let mut members: Vec<(String, f64)> = self
            .zsets
            .get(key)
            .map(|z| {
                z.iter()
                    .filter(|(_, s)| **s >= min && **s <= max)
                    .map(|(m, s)| (m.clone(), *s))
                    .collect()
            })
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        members
    }
}

/// `*` matches any run of characters, `?` exactly one.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    match (pattern.first(), text.first()) {
        (None, None) => true,
        (Some(b'*'), _) => {
            glob_match(&pattern[1..], text) || (!text.is_empty() && glob_match(pattern, &text[1..]))
        }
        (Some(b'?'), Some(_)) => glob_match(&pattern[1..], &text[1..]),
        (Some(p), Some(t)) if p == t => glob_match(&pattern[1..], &text[1..]),
        _ => false,
    }
}

fn page<T>(items: Vec<T>, offset: usize, count: Option<usize>) -> Vec<T> {
    let iter = items.into_iter().skip(offset);
    match count {
        Some(n) => iter.take(n).collect(),
        None => iter.collect(),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    pushed: Notify,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> KvResult<MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| KvError::Poisoned)
    }

    fn try_pop(&self, keys: &[String]) -> KvResult<Option<(String, String)>> {
        let mut state = self.state()?;
        for key in keys {
            state.purge(key);
            let popped = state.lists.get_mut(key).and_then(VecDeque::pop_front);
            if let Some(value) = popped {
                if state.lists.get(key).is_some_and(VecDeque::is_empty) {
                    state.lists.remove(key);
                }
                return Ok(Some((key.clone(), value)));
            }
        }
        Ok(None)
    }

    fn list_index(len: usize, index: i64) -> Option<usize> {
        let idx = if index < 0 { len as i64 + index } else { index };
        (idx >= 0 && (idx as usize) < len).then_some(idx as usize)
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn ping(&self) -> KvResult<()> {
        self.state().map(|_| ())
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.strings.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut state = self.state()?;
        state.remove(key);
        state.strings.insert(key.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            state.expiry.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<bool> {
        let mut state = self.state()?;
        state.purge(key);
        if state.contains(key) {
            return Ok(false);
        }
        state.strings.insert(key.to_string(), value.to_string());
        if let Some(ttl) = ttl {
            state.expiry.insert(key.to_string(), Instant::now() + ttl);
        }
        Ok(true)
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.remove(key))
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.contains(key))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let mut state = self.state()?;
        state.purge(key);
        if !state.contains(key) {
            return Ok(false);
        }
        state.expiry.insert(key.to_string(), Instant::now() + ttl);
        Ok(true)
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> KvResult<bool> {
        let mut state = self.state()?;
        state.purge(key);
        if state.strings.get(key).map(String::as_str) == Some(expected) {
            state.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn expire_if_eq(&self, key: &str, expected: &str, ttl: Duration) -> KvResult<bool> {
        let mut state = self.state()?;
        state.purge(key);
        if state.strings.get(key).map(String::as_str) == Some(expected) {
            state.expiry.insert(key.to_string(), Instant::now() + ttl);
            return Ok(true);
        }
        Ok(false)
    }

    async fn hset(&self, key: &str, fields: &[(String, String)]) -> KvResult<()> {
        let mut state = self.state()?;
        state.purge(key);
        let hash = state.hashes.entry(key.to_string()).or_default();
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> KvResult<Option<String>> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hgetall(&self, key: &str) -> KvResult<HashMap<String, String>> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hdel(&self, key: &str, field: &str) -> KvResult<bool> {
        let mut state = self.state()?;
        state.purge(key);
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(false);
        };
        let removed = hash.remove(field).is_some();
        if hash.is_empty() {
            state.remove(key);
        }
        Ok(removed)
    }

    async fn hcas(
        &self,
        key: &str,
        version_field: &str,
        expected: u64,
        fields: &[(String, String)],
    ) -> KvResult<CasOutcome> {
        let mut state = self.state()?;
        state.purge(key);
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(CasOutcome::Missing);
        };
        let Some(current) = hash.get(version_field).and_then(|v| v.parse::<u64>().ok()) else {
            return Ok(CasOutcome::Missing);
        };
        if current != expected {
            return Ok(CasOutcome::VersionMismatch(current));
        }
        for (field, value) in fields {
            hash.insert(field.clone(), value.clone());
        }
        let next = current + 1;
        hash.insert(version_field.to_string(), next.to_string());
        Ok(CasOutcome::Applied(next))
    }

    async fn zadd(&self, key: &str, member: &str, score: f64, mode: ZAddMode) -> KvResult<()> {
        let mut state = self.state()?;
        state.purge(key);
        let zset = state.zsets.entry(key.to_string()).or_default();
        let present = zset.contains_key(member);
        match mode {
            ZAddMode::Nx if present => {}
            ZAddMode::Xx if !present => {}
            _ => {
                zset.insert(member.to_string(), score);
            }
        }
        if zset.is_empty() {
            state.zsets.remove(key);
        }
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut state = self.state()?;
        state.purge(key);
        let Some(zset) = state.zsets.get_mut(key) else {
            return Ok(false);
        };
        let removed = zset.remove(member).is_some();
        if zset.is_empty() {
            state.remove(key);
        }
        Ok(removed)
    }

    async fn zscore(&self, key: &str, member: &str) -> KvResult<Option<f64>> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.zsets.get(key).and_then(|z| z.get(member)).copied())
    }

    async fn zcard(&self, key: &str) -> KvResult<u64> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.zsets.get(key).map_or(0, |z| z.len() as u64))
    }

    async fn zcount(&self, key: &str, min: f64, max: f64) -> KvResult<u64> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.sorted_members(key, min, max).len() as u64)
    }

    async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        offset: usize,
        count: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(page(state.sorted_members(key, min, max), offset, count))
    }

    async fn zrevrange_by_score(
        &self,
        key: &str,
        max: f64,
        min: f64,
        offset: usize,
        count: Option<usize>,
    ) -> KvResult<Vec<(String, f64)>> {
        let mut state = self.state()?;
        state.purge(key);
        let mut members = state.sorted_members(key, min, max);
        members.reverse();
        Ok(page(members, offset, count))
    }

    async fn rpush(&self, key: &str, value: &str) -> KvResult<u64> {
        let len = {
            let mut state = self.state()?;
            state.purge(key);
            let list = state.lists.entry(key.to_string()).or_default();
            list.push_back(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<u64> {
        let len = {
            let mut state = self.state()?;
            state.purge(key);
            let list = state.lists.entry(key.to_string()).or_default();
            list.push_front(value.to_string());
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn lpop(&self, key: &str) -> KvResult<Option<String>> {
        Ok(self.try_pop(&[key.to_string()])?.map(|(_, v)| v))
    }

    async fn blpop(&self, keys: &[String], timeout: Duration) -> KvResult<Option<(String, String)>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register interest before checking so a push in between is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.try_pop(keys)? {
                return Ok(Some(popped));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn lindex(&self, key: &str, index: i64) -> KvResult<Option<String>> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.lists.get(key).and_then(|list| {
            Self::list_index(list.len(), index).and_then(|i| list.get(i).cloned())
        }))
    }

    async fn lset(&self, key: &str, index: i64, value: &str) -> KvResult<()> {
        let mut state = self.state()?;
        state.purge(key);
        let list = state
            .lists
            .get_mut(key)
            .ok_or_else(|| KvError::Command(format!("no such list '{key}'")))?;
        let i = Self::list_index(list.len(), index)
            .ok_or_else(|| KvError::Command(format!("index {index} out of range")))?;
        list[i] = value.to_string();
        Ok(())
    }

    async fn llen(&self, key: &str) -> KvResult<u64> {
        let mut state = self.state()?;
        state.purge(key);
        Ok(state.lists.get(key).map_or(0, |l| l.len() as u64))
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<u64> {
        let mut state = self.state()?;
        state.purge(key);
        let Some(list) = state.lists.get_mut(key) else {
            return Ok(0);
        };
        let before = list.len();
        list.retain(|v| v != value);
        let removed = (before - list.len()) as u64;
        if list.is_empty() {
            state.remove(key);
        }
        Ok(removed)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> KvResult<(u64, Vec<String>)> {
        let mut state = self.state()?;
        state.purge_all();
        let keys = state.all_keys();
        let start = cursor as usize;
        let end = (start + count.max(1)).min(keys.len());
        let batch = keys
            .get(start..end)
            .unwrap_or_default()
            .iter()
            .filter(|k| glob_match(pattern.as_bytes(), k.as_bytes()))
            .cloned()
            .collect();
        let next = if end >= keys.len() { 0 } else { end as u64 };
        Ok((next, batch))
    }
}
