use reddimon_core::{
    ClientSettings, CoreError, ErrorExt, RedditApiError, DEFAULT_RETRYABLE_STATUS_CODES,
};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info};

/// Retry behaviour for transient Reddit failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry, doubled for each following one
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Maximum jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Gateway-style status codes worth another attempt
    pub retryable_status_codes: Vec<u16>,
    /// Wait out a 429 instead of failing the call
    pub continue_after_rate_limit: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::reddit()
    }
}

impl RetryPolicy {
    pub fn reddit() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(2000),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.0,
            retryable_status_codes: DEFAULT_RETRYABLE_STATUS_CODES.to_vec(),
            continue_after_rate_limit: true,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
            retryable_status_codes: settings.retryable_status_codes.clone(),
            continue_after_rate_limit: settings.continue_after_rate_limit,
            ..Self::reddit()
        }
    }

    /// Classification comes from [`ErrorExt`]; the policy only narrows it.
    /// Server errors are judged against this policy's own status set, and a
    /// server-requested wait is capped at `max_delay`.
    pub fn strategy_for(&self, error: &CoreError) -> RetryStrategy {
        match error.as_reddit() {
            Some(RedditApiError::ServerError { status_code }) => {
                if self.retryable_status_codes.contains(status_code) {
                    RetryStrategy::Retry
                } else {
                    RetryStrategy::NoRetry
                }
            }
            Some(RedditApiError::RateLimitExceeded { .. }) if !self.continue_after_rate_limit => {
                RetryStrategy::NoRetry
            }
            // An InvalidToken lands here once the rejected token is discarded
            _ if error.is_retryable() => match error.retry_after() {
                Some(wait) => RetryStrategy::RetryWithDelay(wait.min(self.max_delay)),
                None => RetryStrategy::Retry,
            },
            _ => RetryStrategy::NoRetry,
        }
    }

    /// Delay before retry number `retry` (0-based): `base * 2^retry`, plus jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(retry))
            .min(self.max_delay);

        let jitter_range = (exponential.as_millis() as f64 * self.jitter_factor) as u64;
        let jitter = if jitter_range > 0 {
            fastrand::u64(0..=jitter_range)
        } else {
            0
        };

        (exponential + Duration::from_millis(jitter)).min(self.max_delay)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryStrategy {
    /// Retry with exponential backoff
    Retry,
    /// Retry after the delay the server asked for
    RetryWithDelay(Duration),
    /// Permanent failure
    NoRetry,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    pub total_retries: u64,
    pub recovered_operations: u64,
    pub failed_operations: u64,
}

#[derive(Debug, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    total_retries: AtomicU64,
    recovered_operations: AtomicU64,
    failed_operations: AtomicU64,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            total_retries: AtomicU64::new(0),
            recovered_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation`, retrying transient failures. The last error is
    /// returned once retries are exhausted.
    pub async fn execute<F, Fut, T>(&self, operation_name: &str, operation: F) -> Result<T, CoreError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut retry = 0u32;

        loop {
            match operation().await {
                Ok(result) => {
                    if retry > 0 {
                        self.recovered_operations.fetch_add(1, Ordering::Relaxed);
                        info!("{} succeeded after {} retries", operation_name, retry);
                    }
                    return Ok(result);
                }
                Err(error) => {
                    let delay = match self.policy.strategy_for(&error) {
                        _ if retry >= self.policy.max_retries => None,
                        RetryStrategy::Retry => Some(self.policy.delay_for(retry)),
                        RetryStrategy::RetryWithDelay(delay) => Some(delay),
                        RetryStrategy::NoRetry => {
                            debug!("Not retrying {}: {}", operation_name, error);
                            None
                        }
                    };

                    match delay {
                        Some(delay) => {
                            info!(
                                "Retrying {} in {:?} (retry {}/{}) due to: {}",
                                operation_name,
                                delay,
                                retry + 1,
                                self.policy.max_retries,
                                error
                            );
                            self.total_retries.fetch_add(1, Ordering::Relaxed);
                            sleep(delay).await;
                            retry += 1;
                        }
                        None => {
                            self.failed_operations.fetch_add(1, Ordering::Relaxed);
                            error!(
                                "{} failed after {} attempts: {}",
                                operation_name,
                                retry + 1,
                                error
                            );
                            return Err(error);
                        }
                    }
                }
            }
        }
    }

    pub fn metrics(&self) -> RetryMetrics {
        RetryMetrics {
            total_retries: self.total_retries.load(Ordering::Relaxed),
            recovered_operations: self.recovered_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
        }
    }
}
