// ABOUTME: Keeps the bridge running: restarts the full startup sequence with exponential backoff
// ABOUTME: The first start is fail-fast; only a bridge that ran successfully is retried

use super::error::BridgeError;
use super::orchestrator::{start, start_with_backlog};
use crate::broker::Broker;
use crate::config::BridgeConfig;
use crate::session::SessionConnector;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Reconnect backoff.
///
/// The delay before attempt `n` (starting at 1) is
/// `min(initial_delay * 2^(n-1), max_delay)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Attempts per outage before giving up; 0 retries forever
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, initial_delay: Duration, max_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self.max_delay = max_delay;
        self
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.max_attempts == 0 || attempt <= self.max_attempts
    }
}

/// Start the bridge and keep it running until `shutdown` flips to true.
///
/// A failure of the first start is returned straight away. After that, a
/// run that ends with an error is stopped, and the full startup is retried
/// per `config.retry`, carrying over inbound events that were not yet
/// published. The attempt counter resets once a restart succeeds. When the
/// attempts run out the last error is returned.
pub async fn supervise<B, C>(
    broker: &B,
    connector: &C,
    config: &BridgeConfig,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BridgeError>
where
    B: Broker,
    C: SessionConnector,
{
    let mut bridge = start(broker, connector, config).await?;

    loop {
        let result = bridge.run(&mut shutdown).await;
        let mut backlog = bridge.stop().await;

        let mut last_error = match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                warn!(error = %e, "Bridge stopped, reconnecting");
                e
            }
        };

        let mut attempt = 0;
        bridge = loop {
            attempt += 1;
            if !config.retry.allows(attempt) {
                warn!(attempts = attempt - 1, "Giving up reconnecting");
                return Err(last_error);
            }

            let delay = config.retry.delay(attempt);
            info!(attempt, delay_ms = delay.as_millis() as u64, "Reconnecting");

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Shutdown requested while reconnecting");
                        return Ok(());
                    }
                    continue;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match start_with_backlog(broker, connector, config, &mut backlog).await {
                Ok(bridge) => {
                    info!(attempt, "Bridge restarted");
                    break bridge;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Restart failed");
                    last_error = e;
                }
            }
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_doubles_up_to_the_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(4), Duration::from_secs(8));
        assert_eq!(policy.delay(7), Duration::from_secs(60));
        assert_eq!(policy.delay(40), Duration::from_secs(60));
    }

    #[test]
    fn zero_attempts_means_unbounded() {
        let bounded = RetryPolicy::default().with_max_attempts(3);
        assert!(bounded.allows(3));
        assert!(!bounded.allows(4));

        let unbounded = RetryPolicy::default().with_max_attempts(0);
        assert!(unbounded.allows(1_000));
    }
}
