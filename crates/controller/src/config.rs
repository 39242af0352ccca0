use serde::{Deserialize, Serialize};
use tandem_core::BackoffPolicy;
use tandem_store::CacheConfig;

/// Controller and cache tuning. Every field has a default so partial
/// config files deserialize.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControllerConfig {
    /// Concurrent reconcile workers
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Delay between a dropped watch and the relist that follows it
    #[serde(default = "default_watch_backoff")]
    pub watch_backoff: BackoffPolicy,

    /// Per-key delay for items requeued after a retryable error
    #[serde(default = "default_requeue_backoff")]
    pub requeue_backoff: BackoffPolicy,

    /// Notifications buffered per subscriber before it lags
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,

    /// How long shutdown waits for in-flight reconciles (unit: milliseconds)
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            watch_backoff: default_watch_backoff(),
            requeue_backoff: default_requeue_backoff(),
            broadcast_capacity: default_broadcast_capacity(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

fn default_workers() -> usize {
    2
}
fn default_watch_backoff() -> BackoffPolicy {
    CacheConfig::default().backoff
}
fn default_requeue_backoff() -> BackoffPolicy {
    BackoffPolicy { base_delay_ms: 50, max_delay_ms: 10_000, factor: 2.0, jitter: 0.2 }
}
fn default_broadcast_capacity() -> usize {
    CacheConfig::default().broadcast_capacity
}
fn default_drain_timeout_ms() -> u64 {
    5_000
}

impl ControllerConfig {
    /// Defaults overridden by `TANDEM_*` variables. Unparseable values are ignored.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Override fields that have a `TANDEM_*` variable set.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Override fields from `lookup(TANDEM_*)`; missing or unparseable values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
            lookup(name).and_then(|s| s.trim().parse().ok())
        }
        let lookup = &lookup;
        if let Some(v) = parse(lookup, "TANDEM_WORKERS") {
            self.workers = v;
        }
        if let Some(v) = parse(lookup, "TANDEM_WATCH_BACKOFF_BASE_MS") {
            self.watch_backoff.base_delay_ms = v;
        }
        if let Some(v) = parse(lookup, "TANDEM_WATCH_BACKOFF_MAX_MS") {
            self.watch_backoff.max_delay_ms = v;
        }
        if let Some(v) = parse(lookup, "TANDEM_REQUEUE_BASE_MS") {
            self.requeue_backoff.base_delay_ms = v;
        }
        if let Some(v) = parse(lookup, "TANDEM_REQUEUE_MAX_MS") {
            self.requeue_backoff.max_delay_ms = v;
        }
        if let Some(v) = parse(lookup, "TANDEM_BROADCAST_CAP") {
            self.broadcast_capacity = v;
        }
        if let Some(v) = parse(lookup, "TANDEM_DRAIN_TIMEOUT_MS") {
            self.drain_timeout_ms = v;
        }
    }

    /// Settings for the caches of a registry serving this controller.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig { backoff: self.watch_backoff, broadcast_capacity: self.broadcast_capacity.max(1) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let cfg: ControllerConfig = serde_json::from_str(r#"{"workers": 7, "requeue_backoff": {"base_delay_ms": 1}}"#).unwrap();
        assert_eq!(cfg.workers, 7);
        assert_eq!(cfg.requeue_backoff.base_delay_ms, 1);
        assert_eq!(cfg.requeue_backoff.max_delay_ms, 30_000);
        assert_eq!(cfg.drain_timeout_ms, 5_000);
        assert_eq!(cfg.cache_config(), CacheConfig::default());
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let vars: rustc_hash::FxHashMap<&str, &str> =
            [("TANDEM_WORKERS", "5"), ("TANDEM_REQUEUE_BASE_MS", " 25 "), ("TANDEM_DRAIN_TIMEOUT_MS", "not-a-number")].into_iter().collect();
        let mut cfg = ControllerConfig::default();
        cfg.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));
        assert_eq!(cfg.workers, 5);
        assert_eq!(cfg.requeue_backoff.base_delay_ms, 25);
        assert_eq!(cfg.drain_timeout_ms, 5_000);
        assert_eq!(cfg.broadcast_capacity, ControllerConfig::default().broadcast_capacity);
    }
}
