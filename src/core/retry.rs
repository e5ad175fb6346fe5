/// Retry with exponential backoff, and size validation of produced files

use std::fmt::Display;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::utils::{DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    /// Run `action` until it succeeds or attempts are exhausted.
    ///
    /// The action receives the 1-based attempt number. Between attempts the
    /// executor sleeps, doubling the delay each time. The last failure is returned.
    pub async fn run<T, E, F, Fut>(&self, label: &str, mut action: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.initial_delay;
        let mut attempt = 1;

        loop {
            match action(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= max_attempts => {
                    tracing::error!(
                        action = label,
                        attempt,
                        max_attempts,
                        error = %err,
                        "giving up after final attempt"
                    );
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        action = label,
                        attempt,
                        max_attempts,
                        retry_in = ?delay,
                        error = %err,
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

/// Outcome of checking a produced file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Ok { size: u64 },
    /// Non-empty but below the expected minimum; kept with a warning
    Undersized { size: u64, min_size: u64 },
    Empty,
    Missing,
}

impl Validation {
    pub fn size(&self) -> u64 {
        match self {
            Validation::Ok { size } | Validation::Undersized { size, .. } => *size,
            Validation::Empty | Validation::Missing => 0,
        }
    }
}

/// Check that `path` exists and is plausibly sized
pub async fn validate(path: &Path, min_size: u64) -> Validation {
    let size = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        _ => return Validation::Missing,
    };

    if size == 0 {
        Validation::Empty
    } else if size < min_size {
        Validation::Undersized { size, min_size }
    } else {
        Validation::Ok { size }
    }
}
