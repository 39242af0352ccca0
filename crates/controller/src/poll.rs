//! Bounded polling for conditions that settle eventually.

use std::future::Future;
use std::time::Duration;

use tandem_core::Error;
use tokio::time::Instant;

#[derive(Debug, thiserror::Error)]
pub enum PollError {
    #[error("condition not met within {0:?}")]
    Timeout(Duration),
    #[error("condition failed: {0}")]
    Condition(#[from] Error),
}

/// Evaluate `cond` now and then every `interval` until it returns `true`.
///
/// An `Err` from `cond` stops polling. The condition is always evaluated
/// at least once, even with a zero timeout.
pub async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, mut cond: F) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if cond().await? {
            return Ok(());
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(PollError::Timeout(timeout));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
