//! Tandem store: per-projection watch caches and the registry that creates them.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use tandem_core::BackoffPolicy;

mod cache;
mod registry;

pub use cache::{CacheSnapshot, CacheStats, Change, Notification, Phase, WatchCache};
pub use registry::ProjectionRegistry;

/// Settings shared by every cache a registry creates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Delay between a dropped watch or failed list and the next list.
    #[serde(default = "default_watch_backoff")]
    pub backoff: BackoffPolicy,

    /// Notifications buffered per subscriber before it lags.
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { backoff: default_watch_backoff(), broadcast_capacity: default_broadcast_capacity() }
    }
}

fn default_watch_backoff() -> BackoffPolicy {
    BackoffPolicy { base_delay_ms: 200, max_delay_ms: 30_000, factor: 2.0, jitter: 0.2 }
}
fn default_broadcast_capacity() -> usize {
    1024
}
