//! Bounded in-cycle retry for transient platform failures.
use crate::config;
use crate::error::PlatformError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &config::Scheduler) -> Self {
        Self {
            retries: cfg.transient_retries,
            delay: Duration::from_millis(cfg.retry_delay_ms),
        }
    }

    pub fn none() -> Self {
        Self {
            retries: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// retry budget is spent. Delay grows linearly with the attempt number.
pub async fn with_retries<T, F, Fut>(
    policy: RetryPolicy,
    what: &str,
    mut op: F,
) -> Result<T, PlatformError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PlatformError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < policy.retries => {
                attempt += 1;
                warn!(?err, attempt, what, "transient failure; retrying");
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay * attempt).await;
                }
            }
            other => return other,
        }
    }
}
