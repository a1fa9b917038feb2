//! Bounded retries with exponential backoff for transient failures

use crate::error::{Result, VendorError};
use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::warn;

const MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub retries: usize,
    pub base_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(retries: usize, base_delay_ms: u64) -> Self {
        Self {
            retries,
            base_delay_ms,
        }
    }

    pub fn none() -> Self {
        Self::new(0, 0)
    }

    /// Delays `base, 2*base, 4*base, ...` capped at 30s
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(2)
            .factor((self.base_delay_ms / 2).max(1))
            .max_delay(MAX_DELAY)
            .take(self.retries)
    }

    /// Runs `action` until it succeeds, fails permanently, or retries run out
    pub async fn run<T, F, Fut>(&self, what: &str, mut action: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        RetryIf::spawn(
            self.delays(),
            || action(),
            |err: &VendorError| {
                let retry = err.is_retryable();
                if retry {
                    warn!(what, error = %err, "Transient failure, retrying");
                }
                retry
            },
        )
        .await
    }
}
