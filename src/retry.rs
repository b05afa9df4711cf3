use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::RetryConfig;
use crate::error::SyncError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Bounded retry around remote calls. Fatal errors are returned on the first
/// attempt; everything else is retried on a fixed schedule.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    max_attempts: u32,
    delays: Vec<Duration>,
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(
            DEFAULT_MAX_ATTEMPTS,
            vec![Duration::from_secs(30), Duration::from_secs(180)],
        )
    }
}

impl RetryExecutor {
    pub fn new(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delays,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config
                .delays_secs
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        )
    }

    /// Delay before `attempt` (1-based). The last configured delay repeats.
    fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.delays.is_empty() {
            return Duration::ZERO;
        }
        let idx = (attempt as usize - 2).min(self.delays.len() - 1);
        self.delays[idx]
    }

    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, SyncError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 1;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_retryable() || attempt >= self.max_attempts => return Err(err),
                Err(err) => {
                    attempt += 1;
                    let delay = self.delay_before(attempt);
                    warn!(
                        label,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_secs = delay.as_secs_f64(),
                        error = %err,
                        "retrying after failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
