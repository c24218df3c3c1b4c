use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::broker::channel::{BrokerChannel, Connector};
use crate::utils::error::PipelineError;

/// Startup retry policy: after a failed attempt, wait `base * 2^retry` and try
/// again, for up to `max_attempts` retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration) -> Self {
        Self { max_attempts, base }
    }

    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base.saturating_mul(2u32.saturating_pow(retry))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(1))
    }
}

/// Open a channel, retrying with exponential backoff while the broker is
/// unreachable. Other broker errors are returned immediately.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    policy: RetryPolicy,
) -> Result<Arc<dyn BrokerChannel>, PipelineError> {
    let mut retry = 0;
    loop {
        match connector.open_channel().await {
            Ok(channel) => {
                if retry > 0 {
                    info!(attempt = retry + 1, "connected to broker");
                }
                return Ok(channel);
            }
            Err(e) if e.is_unavailable() && retry < policy.max_attempts => {
                retry += 1;
                let delay = policy.delay_for(retry);
                warn!(
                    attempt = retry,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "broker unreachable, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) if e.is_unavailable() => {
                return Err(PipelineError::BrokerUnavailable {
                    attempts: retry + 1,
                    source: e,
                });
            }
            Err(e) => return Err(e.into()),
        }
    }
}
