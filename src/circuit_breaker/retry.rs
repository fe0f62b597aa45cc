use super::types::RetryConfig;
use backoff::{backoff::Backoff, ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

/// Retry executor with exponential backoff
///
/// Used to re-run breaker compare-and-set rounds that lost a race against
/// another gateway instance.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `f` until it succeeds, the error is not retryable, or retries run out
    pub async fn execute<F, Fut, T, E, P>(&self, mut f: F, should_retry: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let mut backoff = self.create_backoff();
        let mut attempt = 0;

        loop {
            attempt += 1;

            let e = match f().await {
                Ok(result) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retries");
                    }
                    return Ok(result);
                }
                Err(e) => e,
            };

            if !should_retry(&e) {
                debug!(attempt, error = %e, "Error not retryable");
                return Err(e);
            }

            if attempt > self.config.max_retries {
                warn!(
                    attempt,
                    max_retries = self.config.max_retries,
                    error = %e,
                    "Operation failed after max retries"
                );
                return Err(e);
            }

            match backoff.next_backoff() {
                Some(wait) => {
                    debug!(
                        attempt,
                        wait_ms = wait.as_millis() as u64,
                        error = %e,
                        "Retrying after backoff"
                    );
                    tokio::time::sleep(wait).await;
                }
                None => {
                    warn!(attempt, error = %e, "Backoff exhausted");
                    return Err(e);
                }
            }
        }
    }

    fn create_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.initial_backoff())
            .with_max_interval(self.config.max_backoff())
            .with_multiplier(self.config.backoff_multiplier)
            .with_max_elapsed_time(None) // Bounded by max_retries instead
            .build()
    }
}
