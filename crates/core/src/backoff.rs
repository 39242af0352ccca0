use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential backoff with a cap and proportional jitter.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    /// First delay (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Upper bound on any single delay (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor per attempt
    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Fraction of the delay randomised, in [0, 1]
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            factor: default_factor(),
            jitter: default_jitter(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    5
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_factor() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.2
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base_delay_ms: base.as_millis() as u64, max_delay_ms: max.as_millis() as u64, ..Self::default() }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn nominal(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms.max(1) as f64;
        let cap = self.max_delay_ms.max(self.base_delay_ms) as f64;
        let exp = self.factor.max(1.0).powi(attempt.min(64) as i32);
        Duration::from_millis((base * exp).min(cap) as u64)
    }

    /// Delay before retry number `attempt`, jittered down by up to `jitter` of
    /// the nominal delay so the cap is never exceeded.
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return nominal;
        }
        let scale = 1.0 - rand::thread_rng().gen_range(0.0..=jitter);
        nominal.mul_f64(scale)
    }

    pub fn start(&self) -> Backoff {
        Backoff { policy: *self, attempt: 0 }
    }
}

/// Stateful cursor over a [`BackoffPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let d = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        d
    }

    pub fn attempts(&self) -> u32 { self.attempt }

    pub fn reset(&mut self) { self.attempt = 0; }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let p = BackoffPolicy { base_delay_ms: 10, max_delay_ms: 100, factor: 2.0, jitter: 0.0 };
        let got: Vec<u64> = (0..6).map(|a| p.delay(a).as_millis() as u64).collect();
        assert_eq!(got, vec![10, 20, 40, 80, 100, 100]);
    }

    #[test]
    fn jitter_stays_within_cap() {
        let p = BackoffPolicy { base_delay_ms: 10, max_delay_ms: 50, factor: 3.0, jitter: 0.5 };
        for attempt in 0..20 {
            let d = p.delay(attempt);
            assert!(d <= p.nominal(attempt));
            assert!(d >= p.nominal(attempt).mul_f64(0.5));
        }
    }

    #[test]
    fn cursor_resets() {
        let mut b = BackoffPolicy { jitter: 0.0, ..BackoffPolicy::new(Duration::from_millis(1), Duration::from_millis(8)) }.start();
        assert_eq!(b.next_delay(), Duration::from_millis(1));
        assert_eq!(b.next_delay(), Duration::from_millis(2));
        assert_eq!(b.attempts(), 2);
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(1));
    }

    #[test]
    fn deserializes_with_defaults() {
        let p: BackoffPolicy = serde_json::from_str(r#"{"base_delay_ms": 100}"#).unwrap();
        assert_eq!(p.base_delay_ms, 100);
        assert_eq!(p.max_delay_ms, 30_000);
    }
}
