// ABOUTME: SSMI link-check bookkeeping for keeping a long-lived gateway session healthy
// ABOUTME: Tracks when to send the next link check and how many went unanswered in a row

use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Configuration for SSMI link checks
///
/// Gateways drop idle sessions, and a half-open TCP connection is otherwise
/// only noticed on the next send. Sending a link check (`SSMI|3`) on an
/// interval keeps the session alive and surfaces a dead link early.
///
/// # Example
///
/// ```rust
/// use ssmi_bridge::ssmi::KeepAliveConfig;
/// use std::time::Duration;
///
/// // Default configuration (60s interval, 15s timeout, 3 max failures)
/// let config = KeepAliveConfig::default();
///
/// let config = KeepAliveConfig::new(Duration::from_secs(30))
///     .with_timeout(Duration::from_secs(5))
///     .with_max_failures(5);
///
/// let config = KeepAliveConfig::disabled();
/// assert!(!config.enabled);
/// ```
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// Interval between link checks (default: 60 seconds)
    pub interval: Duration,

    /// How long to wait for the gateway to acknowledge a link check
    /// (default: 15 seconds). Should be well under the interval.
    pub timeout: Duration,

    /// Consecutive failures before the session is considered dead (default: 3)
    pub max_failures: u32,

    /// Whether link checks are sent at all (default: true)
    pub enabled: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            timeout: Duration::from_secs(15),
            max_failures: 3,
            enabled: true,
        }
    }
}

impl KeepAliveConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_failures(mut self, max_failures: u32) -> Self {
        self.max_failures = max_failures;
        self
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

/// Snapshot of link-check health
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveStatus {
    pub running: bool,
    pub consecutive_failures: u32,
    pub total_pings: u32,
    pub total_pongs: u32,
}

/// Decides when to send link checks and whether the link is still alive.
///
/// The session's keep-alive task ticks this on a timer:
///
/// 1. `is_overdue()` - the last link check went unanswered, record a failure
/// 2. `should_ping()` - time for another link check
/// 3. `on_ping_sent()` / `on_ping_failure()` after the write
///
/// The reader task calls `on_ping_success()` whenever the gateway
/// acknowledges a link check.
#[derive(Debug)]
pub struct KeepAliveManager {
    config: KeepAliveConfig,
    last_ping: Option<Instant>,
    awaiting_reply: bool,
    consecutive_failures: u32,
    total_pings: u32,
    total_pongs: u32,
}

impl KeepAliveManager {
    pub fn new(config: KeepAliveConfig) -> Self {
        Self {
            config,
            last_ping: None,
            awaiting_reply: false,
            consecutive_failures: 0,
            total_pings: 0,
            total_pongs: 0,
        }
    }

    /// True when enabled, under the failure limit, not waiting on a reply,
    /// and the interval has passed since the last link check.
    pub fn should_ping(&self) -> bool {
        if !self.config.enabled || self.awaiting_reply {
            return false;
        }

        if self.is_connection_failed() {
            debug!("Max link check failures reached, not sending more");
            return false;
        }

        match self.last_ping {
            None => true,
            Some(last) => last.elapsed() >= self.config.interval,
        }
    }

    /// True when a link check has waited longer than the timeout for its reply.
    pub fn is_overdue(&self) -> bool {
        self.awaiting_reply
            && self
                .last_ping
                .is_some_and(|last| last.elapsed() >= self.config.timeout)
    }

    pub fn on_ping_sent(&mut self) {
        self.last_ping = Some(Instant::now());
        self.awaiting_reply = true;
        self.total_pings += 1;
        debug!(total = self.total_pings, "Link check sent");
    }

    pub fn on_ping_success(&mut self) {
        if !self.awaiting_reply {
            return;
        }
        self.awaiting_reply = false;
        self.consecutive_failures = 0;
        self.total_pongs += 1;
        debug!(total = self.total_pongs, "Link check acknowledged");
    }

    pub fn on_ping_failure(&mut self) {
        self.awaiting_reply = false;
        self.consecutive_failures += 1;
        warn!(
            consecutive_failures = self.consecutive_failures,
            "Link check failed"
        );
    }

    /// A successful send proves the link too.
    pub fn reset_failures(&mut self) {
        if self.consecutive_failures > 0 {
            debug!("Resetting {} consecutive failures", self.consecutive_failures);
            self.consecutive_failures = 0;
        }
    }

    pub fn is_connection_failed(&self) -> bool {
        self.consecutive_failures >= self.config.max_failures
    }

    pub fn status(&self) -> KeepAliveStatus {
        KeepAliveStatus {
            running: self.config.enabled,
            consecutive_failures: self.consecutive_failures,
            total_pings: self.total_pings,
            total_pongs: self.total_pongs,
        }
    }
}
