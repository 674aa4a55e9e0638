//! Key layout under a namespace.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keys {
    ns: String,
}

impl Keys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self { ns: namespace.into() }
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    /// Hash holding a job's stats record.
    pub fn job_stats(&self, job_id: &str) -> String {
        format!("{}:job:{}", self.ns, job_id)
    }

    pub fn job_stats_pattern(&self) -> String {
        format!("{}:job:*", self.ns)
    }

    /// Hash describing the pool that runs a job and any pending op command.
    pub fn in_progress(&self, job_id: &str) -> String {
        format!("{}:job:{}:in_progress", self.ns, job_id)
    }

    pub fn in_progress_pattern(&self) -> String {
        format!("{}:job:*:in_progress", self.ns)
    }

    /// Job id of a stats key; `None` for any other key under `job:`.
    pub fn job_id_from_stats_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        let id = key.strip_prefix(self.ns.as_str())?.strip_prefix(":job:")?;
        (!id.is_empty() && !id.contains(':')).then_some(id)
    }

    pub fn job_id_from_in_progress_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.ns.as_str())?
            .strip_prefix(":job:")?
            .strip_suffix(":in_progress")
    }

    /// Sorted set of policy ids by next fire time.
    pub fn periodic_index(&self) -> String {
        format!("{}:periodic:index", self.ns)
    }

    pub fn periodic_policies(&self) -> String {
        format!("{}:periodic:policies", self.ns)
    }

    pub fn periodic_leader(&self) -> String {
        format!("{}:periodic:leader", self.ns)
    }

    /// Sorted set of a parent's executions by `run_at`; finished ones score -1.
    pub fn periodic_executions(&self, parent_id: &str) -> String {
        format!("{}:periodic:execs:{}", self.ns, parent_id)
    }

    pub fn periodic_executions_pattern(&self) -> String {
        format!("{}:periodic:execs:*", self.ns)
    }

    pub fn parent_id_from_executions_key<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.ns.as_str())?
            .strip_prefix(":periodic:execs:")
            .filter(|id| !id.is_empty())
    }

    pub fn hook_queue(&self, shard: u32) -> String {
        format!("{}:hooks:queue:{}", self.ns, shard)
    }

    pub fn hook_lease(&self, shard: u32) -> String {
        format!("{}:hooks:lease:{}", self.ns, shard)
    }

    /// Highest revision of a job already delivered to its hook.
    pub fn hook_delivered(&self, job_id: &str) -> String {
        format!("{}:hooks:delivered:{}", self.ns, job_id)
    }

    /// Hash of pool id to heartbeat JSON.
    pub fn workers(&self) -> String {
        format!("{}:workers", self.ns)
    }

    pub fn queue_priority(&self) -> String {
        format!("{}:queue:priority", self.ns)
    }

    pub fn queue_default(&self) -> String {
        format!("{}:queue:default", self.ns)
    }

    /// Sorted set of delayed job ids by `run_at`.
    pub fn scheduled(&self) -> String {
        format!("{}:scheduled", self.ns)
    }

    pub fn unique(&self, name: &str, params_hash: &str) -> String {
        format!("{}:unique:{}:{}", self.ns, name, params_hash)
    }

    pub fn status_update_retry(&self) -> String {
        format!("{}:status_update_retry", self.ns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stats_keys_round_trip_to_ids() {
        let keys = Keys::new("ns");
        let key = keys.job_stats("abc");
        assert_eq!(key, "ns:job:abc");
        assert_eq!(keys.job_id_from_stats_key(&key), Some("abc"));
        assert_eq!(keys.job_id_from_stats_key(&keys.in_progress("abc")), None);
        assert_eq!(keys.job_id_from_in_progress_key(&keys.in_progress("abc")), Some("abc"));
        assert_eq!(keys.job_id_from_stats_key("other:job:abc"), None);
        assert_eq!(
            keys.parent_id_from_executions_key(&keys.periodic_executions("p1")),
            Some("p1")
        );
    }
}
