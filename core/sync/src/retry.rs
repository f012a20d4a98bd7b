//! Bounded retry with exponential backoff.
//!
//! The orchestrator reruns a whole attempt on `TransientInconsistency`; the
//! dispatcher reruns an event on transport failures. Both go through
//! [`RetryExecutor`], differing only in the retry condition.

use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use moldap_common::{Error, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts after the first one.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Retry settings as they appear in the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl From<&RetrySettings> for RetryConfig {
    fn from(settings: &RetrySettings) -> Self {
        RetryConfig::new(settings.max_attempts.saturating_sub(1))
            .with_initial_delay(Duration::from_millis(settings.initial_delay_ms))
            .with_max_delay(Duration::from_millis(settings.max_delay_ms))
    }
}

/// Retry executor for running operations with retry logic.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Execute an operation, rerunning it while it fails with
    /// `TransientInconsistency`.
    ///
    /// Each run must re-resolve current state; nothing from a failed run is
    /// carried into the next.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_condition(operation, Error::is_transient)
            .await
    }

    /// Execute with a custom retry condition.
    pub async fn execute_with_condition<F, Fut, T, C>(
        &self,
        operation: F,
        should_retry: C,
    ) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
        C: Fn(&Error) -> bool,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!("Operation succeeded after {} retries", attempt);
                    }
                    return Ok(result);
                }
                Err(err) => {
                    if !should_retry(&err) {
                        return Err(err);
                    }

                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!(
                            error_kind = %err.kind(),
                            "Giving up after {} attempts: {}",
                            attempt, err
                        );
                        return Err(err);
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    warn!(
                        error_kind = %err.kind(),
                        "Attempt {} failed: {}. Retrying in {:?}...",
                        attempt, err, delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_secs(1))
            .with_backoff_multiplier(2.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(10))
            .with_backoff_multiplier(10.0)
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(10));
    }

    #[test]
    fn test_settings_conversion() {
        let settings = RetrySettings {
            max_attempts: 4,
            initial_delay_ms: 10,
            max_delay_ms: 100,
        };
        let config = RetryConfig::from(&settings);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_delay, Duration::from_millis(10));
        assert_eq!(config.max_delay, Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_successful_operation() {
        let executor = RetryExecutor::default();
        let result: Result<i32> = executor.execute(|| async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_on_transient_inconsistency() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let executor = RetryExecutor::new(config);

        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    let current = count.fetch_add(1, Ordering::SeqCst);
                    if current < 2 {
                        Err(Error::TransientInconsistency("no primary yet".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::default();
        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Configuration("unknown attribute".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Configuration(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_errors_not_retried_by_default() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let executor = RetryExecutor::new(RetryConfig::new(3).with_initial_delay(Duration::ZERO));
        let result: Result<i32> = executor
            .execute(move || {
                let count = count_clone.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Transport("connection reset".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_max_retries_exceeded_with_condition() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let count_clone = attempt_count.clone();

        let config = RetryConfig::new(2).with_initial_delay(Duration::from_millis(1));
        let executor = RetryExecutor::new(config);

        let result: Result<i32> = executor
            .execute_with_condition(
                move || {
                    let count = count_clone.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err(Error::Transport("always fails".to_string()))
                    }
                },
                Error::is_transport,
            )
            .await;

        assert!(result.is_err());
        // Initial + 2 retries = 3 attempts
        assert_eq!(attempt_count.load(Ordering::SeqCst), 3);
    }
}
