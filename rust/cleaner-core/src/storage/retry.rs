// rust/cleaner-core/src/storage/retry.rs

//! Retry policy for object store transport calls.
//!
//! Calls are retried with exponential backoff and jitter. `NotFound` is
//! never retried: callers use it as the "absent" branch of existence checks.

use std::future::Future;
use std::time::Duration;

use crate::config::S3Config;

/// Backoff policy for transient object store failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// Upper bound for a single delay, before jitter.
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Stretch each delay by up to a quarter to spread out retries.
    pub jitter: bool,
}

impl RetryConfig {
    /// Policy matching the transport settings of an S3 configuration.
    pub fn from_s3(s3: &S3Config) -> Self {
        Self {
            max_retries: s3.max_retries,
            initial_delay: Duration::from_millis(s3.retry_delay_ms),
            max_delay: Duration::from_millis(s3.max_retry_delay_ms),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Fails on the first error.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay to wait before retry number `retry`, counting from zero.
    pub fn delay_before(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = (self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent))
            .min(self.max_delay.as_secs_f64());

        if self.jitter {
            Duration::from_secs_f64(secs * (1.0 + spread(retry) / 4.0))
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from_s3(&S3Config::default())
    }
}

/// Deterministic value in `[0, 1)` derived from the retry number.
fn spread(retry: u32) -> f64 {
    let mixed = u64::from(retry)
        .wrapping_add(1)
        .wrapping_mul(0x9E37_79B9_7F4A_7C15);
    (mixed >> 11) as f64 / (1u64 << 53) as f64
}

/// Outcome of one attempt.
#[derive(Debug)]
pub enum RetryResult<T> {
    Ok(T),
    /// Transient failure, worth another attempt.
    Retry(object_store::Error),
    /// Permanent failure.
    Fail(object_store::Error),
}

/// Whether an object store error may go away on its own.
pub fn is_retryable_error(error: &object_store::Error) -> bool {
    use object_store::Error;

    match error {
        Error::NotFound { .. }
        | Error::AlreadyExists { .. }
        | Error::Precondition { .. }
        | Error::NotModified { .. }
        | Error::NotImplemented
        | Error::InvalidPath { .. } => false,
        Error::Generic { .. } => true,
        other => {
            let message = other.to_string().to_lowercase();
            ["timeout", "timed out", "connection", "500", "502", "503", "504"]
                .iter()
                .any(|needle| message.contains(needle))
        }
    }
}

/// Sorts a transport result into success, transient or permanent failure.
pub fn classify<T>(result: object_store::Result<T>) -> RetryResult<T> {
    match result {
        Ok(value) => RetryResult::Ok(value),
        Err(e) if is_retryable_error(&e) => RetryResult::Retry(e),
        Err(e) => RetryResult::Fail(e),
    }
}

/// Runs `operation` until it succeeds, fails permanently or runs out of
/// retries. The last error is returned.
pub async fn retry_async<T, F, Fut>(config: &RetryConfig, mut operation: F) -> object_store::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = RetryResult<T>>,
{
    let mut retries = 0;
    loop {
        let error = match operation().await {
            RetryResult::Ok(value) => return Ok(value),
            RetryResult::Fail(error) => return Err(error),
            RetryResult::Retry(error) => error,
        };
        if retries >= config.max_retries {
            return Err(error);
        }

        let delay = config.delay_before(retries);
        tracing::debug!(retries, ?delay, error = %error, "retrying object store call");
        tokio::time::sleep(delay).await;
        retries += 1;
    }
}
