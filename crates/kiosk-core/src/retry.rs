//! Backoff for ledger and hardware calls.
//!
//! A settlement that could not be written is retried in the background, and
//! an aborted start refunds the debit with a short retry. Both go through
//! [`with_retry`], which gives up at once on errors that are not
//! [transient](Error::is_transient).
//!
//! ```
//! use kiosk_core::{Error, RetryConfig, with_retry};
//!
//! # async fn example() -> Result<(), Error> {
//! let balance = with_retry(&RetryConfig::for_refund(), "refund", || async {
//!     Ok::<_, Error>(40.0)
//! })
//! .await?;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::Result;

/// How often and how patiently to retry.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt (0 disables retrying).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Growth factor between delays. Values below 1 are treated as 1.
    pub factor: f64,
    /// Stretch each delay by up to 25 %.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Default timing with `max_retries` retries.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// A single attempt.
    pub fn none() -> Self {
        Self::new(0)
    }

    /// Settlement writes: 2 s doubling to a 60 s cap, six retries.
    pub fn for_settlement() -> Self {
        Self {
            max_retries: 6,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            ..Self::default()
        }
    }

    /// Refunds of an aborted start.
    pub fn for_refund() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            ..Self::default()
        }
    }

    /// Short, deterministic retries for tests and local backends.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            factor: 2.0,
            jitter: false,
        }
    }

    #[must_use]
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    #[must_use]
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// The delays between attempts, one per retry.
    pub fn delays(&self) -> Backoff {
        Backoff {
            next: self.initial_delay.min(self.max_delay),
            max: self.max_delay,
            factor: self.factor.max(1.0),
            jitter: self.jitter,
            remaining: self.max_retries,
        }
    }
}

/// Iterator over retry delays; see [`RetryConfig::delays`].
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
    remaining: u32,
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let delay = self.next;
        self.next = self.next.mul_f64(self.factor).min(self.max);
        if self.jitter {
            Some(delay.mul_f64(rand::rng().random_range(1.0..1.25)))
        } else {
            Some(delay)
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or the retries in
/// `config` are used up. The last error is returned.
pub async fn with_retry<F, Fut, T>(config: &RetryConfig, name: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delays = config.delays();
    let mut attempt = 1u32;

    loop {
        let err = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!("{} succeeded on attempt {}", name, attempt);
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        if !err.is_transient() {
            return Err(err);
        }
        let Some(delay) = delays.next() else {
            warn!("{} gave up after {} attempt(s): {}", name, attempt, err);
            return Err(err);
        };

        warn!(
            "{} failed on attempt {}: {}; retrying in {:?}",
            name, attempt, err, delay
        );
        sleep(delay).await;
        attempt += 1;
    }
}
