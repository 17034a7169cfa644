//! Engine parameters. Loading/defaulting of config files lives outside this
//! workspace; we only read flat `STAGEHAND_*` environment variables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::resource::GroupKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub pod_parallelism: usize,
    pub node_parallelism: usize,
    pub lease_duration_secs: u32,
    pub lease_parallelism: usize,
    pub lease_namespace: String,
    /// Holder identity written into renewed leases.
    pub lease_holder: String,
    /// Label selector limiting which objects the engine may touch.
    pub manage_selector: Option<String>,
    pub max_conflict_retries: u32,
    pub max_transient_retries: u32,
    pub request_timeout: Duration,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub queue_cap: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pod_parallelism: 16,
            node_parallelism: 4,
            lease_duration_secs: 40,
            lease_parallelism: 4,
            lease_namespace: "kube-node-lease".to_string(),
            lease_holder: "stagehand".to_string(),
            manage_selector: None,
            max_conflict_retries: 5,
            max_transient_retries: 3,
            request_timeout: Duration::from_millis(10_000),
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            queue_cap: 65_536,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Build from an arbitrary variable lookup; unset or unparsable values keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(lookup: &dyn Fn(&str) -> Option<String>, key: &str, default: T) -> T {
            match lookup(key) {
                Some(raw) => match raw.trim().parse::<T>() {
                    Ok(v) => v,
                    Err(_) => {
                        tracing::warn!(var = %key, value = %raw, "ignoring unparsable setting");
                        default
                    }
                },
                None => default,
            }
        }
        let d = Self::default();
        let lookup: &dyn Fn(&str) -> Option<String> = &lookup;
        Self {
            pod_parallelism: parsed(lookup, "STAGEHAND_POD_PARALLELISM", d.pod_parallelism).max(1),
            node_parallelism: parsed(lookup, "STAGEHAND_NODE_PARALLELISM", d.node_parallelism).max(1),
            lease_duration_secs: parsed(lookup, "STAGEHAND_LEASE_DURATION_SECS", d.lease_duration_secs),
            lease_parallelism: parsed(lookup, "STAGEHAND_LEASE_PARALLELISM", d.lease_parallelism).max(1),
            lease_namespace: lookup("STAGEHAND_LEASE_NAMESPACE").unwrap_or(d.lease_namespace),
            lease_holder: lookup("STAGEHAND_LEASE_HOLDER").unwrap_or(d.lease_holder),
            manage_selector: lookup("STAGEHAND_MANAGE_SELECTOR").filter(|s| !s.trim().is_empty()),
            max_conflict_retries: parsed(lookup, "STAGEHAND_MAX_CONFLICT_RETRIES", d.max_conflict_retries),
            max_transient_retries: parsed(lookup, "STAGEHAND_MAX_TRANSIENT_RETRIES", d.max_transient_retries),
            request_timeout: Duration::from_millis(parsed(
                lookup,
                "STAGEHAND_REQUEST_TIMEOUT_MS",
                d.request_timeout.as_millis() as u64,
            )),
            retry_initial_delay: d.retry_initial_delay,
            retry_max_delay: d.retry_max_delay,
            queue_cap: parsed(lookup, "STAGEHAND_QUEUE_CAP", d.queue_cap).max(1),
        }
    }

    /// Worker pool size for a managed kind. Nodes get their own limit; everything else
    /// shares the pod limit.
    pub fn parallelism_for(&self, gk: &GroupKind) -> usize {
        if gk.group.is_empty() && gk.kind == "Node" { self.node_parallelism } else { self.pod_parallelism }
    }

    /// Leases are renewed four times per duration, like the kubelet.
    pub fn lease_renew_interval(&self) -> Duration {
        Duration::from_millis((self.lease_duration_secs.max(1) as u64 * 1000) / 4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn lookup_overrides_and_bad_values_fall_back() {
        let vars: HashMap<&str, &str> = [
            ("STAGEHAND_POD_PARALLELISM", "64"),
            ("STAGEHAND_NODE_PARALLELISM", "zero"),
            ("STAGEHAND_MANAGE_SELECTOR", "type=kwok"),
            ("STAGEHAND_REQUEST_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();
        let cfg = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.pod_parallelism, 64);
        assert_eq!(cfg.node_parallelism, 4);
        assert_eq!(cfg.manage_selector.as_deref(), Some("type=kwok"));
        assert_eq!(cfg.request_timeout, Duration::from_millis(250));
        assert_eq!(cfg.parallelism_for(&GroupKind::new("", "Node")), 4);
        assert_eq!(cfg.parallelism_for(&GroupKind::new("", "Pod")), 64);
    }

    #[test]
    fn renew_interval_is_quarter_duration() {
        let cfg = EngineConfig { lease_duration_secs: 40, ..Default::default() };
        assert_eq!(cfg.lease_renew_interval(), Duration::from_secs(10));
    }
}
