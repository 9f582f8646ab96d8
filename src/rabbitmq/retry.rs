//! Bounded and unbounded retry executors with exponential backoff.
//!
//! Only [`MessageBusError::is_transient`] failures are retried. Every other
//! error, including [`MessageBusError::Cancelled`], is returned immediately.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::errors::{MessageBusError, Result};
use super::shutdown::Shutdown;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);
const DEFAULT_PUBLISH_RETRIES: u32 = 5;

/// Delay before retry number `n` (the first retry is `n = 1`).
#[derive(Clone)]
pub enum Backoff {
    /// `min(2^n * base, cap)`, no cap when `cap` is `None`.
    Exponential { base: Duration, cap: Option<Duration> },
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl Backoff {
    pub fn exponential(base: Duration) -> Self {
        Backoff::Exponential { base, cap: None }
    }

    pub fn capped(base: Duration, cap: Duration) -> Self {
        Backoff::Exponential {
            base,
            cap: Some(cap),
        }
    }

    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            Backoff::Exponential { base, cap } => {
                let factor = 1u32.checked_shl(retry).unwrap_or(u32::MAX);
                let delay = base.saturating_mul(factor);
                match cap {
                    Some(cap) => delay.min(*cap),
                    None => delay,
                }
            }
            Backoff::Custom(f) => f(retry),
        }
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backoff::Exponential { base, cap } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("cap", cap)
                .finish(),
            Backoff::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryKind {
    /// Give up after `retries` retries, i.e. `retries + 1` attempts in total.
    Bounded { retries: u32 },
    Unbounded,
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub kind: RetryKind,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn bounded(retries: u32, backoff: Backoff) -> Self {
        Self {
            kind: RetryKind::Bounded { retries },
            backoff,
        }
    }

    pub fn unbounded(backoff: Backoff) -> Self {
        Self {
            kind: RetryKind::Unbounded,
            backoff,
        }
    }

    /// 5 retries, `2^n * 100ms`.
    pub fn default_publish() -> Self {
        Self::bounded(
            DEFAULT_PUBLISH_RETRIES,
            Backoff::exponential(DEFAULT_BASE_DELAY),
        )
    }

    /// Forever, `min(2^n * 100ms, 30s)`.
    pub fn default_unbounded() -> Self {
        Self::unbounded(Backoff::capped(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY))
    }

    fn allows_retry(&self, retry: u32) -> bool {
        match self.kind {
            RetryKind::Bounded { retries } => retry <= retries,
            RetryKind::Unbounded => true,
        }
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error,
    /// the policy is exhausted, or `shutdown` fires.
    ///
    /// `on_retry` is called with the failure, the retry number and the delay
    /// before that retry.
    pub async fn execute<T, F, Fut, N>(
        &self,
        shutdown: &Shutdown,
        mut on_retry: N,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
        N: FnMut(&MessageBusError, u32, Duration),
    {
        let mut retry = 0u32;
        loop {
            let error = match shutdown.run_until(operation()).await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            if !error.is_transient() {
                return Err(error);
            }

            retry = retry.saturating_add(1);
            if !self.allows_retry(retry) {
                return Err(error);
            }

            let delay = self.backoff.delay(retry);
            on_retry(&error, retry, delay);
            shutdown.sleep(delay).await?;
        }
    }
}
