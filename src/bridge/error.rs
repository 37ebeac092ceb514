// ABOUTME: Bridge-level error type aggregating broker, session and configuration failures
// ABOUTME: Connection failures carry the broker address so fatal startup errors name host and port

use crate::broker::BrokerError;
use crate::config::ConfigError;
use crate::session::{SendError, SessionError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// The broker could not be reached at startup
    #[error("failed to connect to host: {host}, port: {port}: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: BrokerError,
    },

    /// The broker rejected the configured credentials or virtual host
    #[error("broker refused login for {username:?} on vhost {vhost:?}: {source}")]
    Authentication {
        username: String,
        vhost: String,
        #[source]
        source: BrokerError,
    },

    #[error("failed to open broker channel: {0}")]
    Channel(#[source] BrokerError),

    #[error("failed to declare topology: {0}")]
    Topology(#[source] BrokerError),

    #[error("failed to consume from {queue}: {source}")]
    Consume {
        queue: String,
        #[source]
        source: BrokerError,
    },

    /// The broker cancelled our consumer
    #[error("consumer on {0} was cancelled by the broker")]
    ConsumerCancelled(String),

    /// Ack, reject or delivery failure on a running bridge
    #[error("broker error: {0}")]
    Broker(#[source] BrokerError),

    #[error("SSMI session failed: {0}")]
    Session(#[from] SessionError),

    /// A command arrived while the session was down
    #[error("SSMI session is not ready")]
    SessionUnavailable,

    #[error("send to SSMI gateway failed: {0}")]
    Send(#[source] SendError),

    #[error("failed to publish inbound event: {0}")]
    Publish(#[source] BrokerError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Map a failed `Broker::connect` to the startup step that failed.
    pub(crate) fn from_connect(
        host: &str,
        port: u16,
        username: &str,
        vhost: &str,
        source: BrokerError,
    ) -> Self {
        match source {
            BrokerError::AccessRefused(_) => BridgeError::Authentication {
                username: username.to_string(),
                vhost: vhost.to_string(),
                source,
            },
            source => BridgeError::Connection {
                host: host.to_string(),
                port,
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_names_the_address() {
        let err = BridgeError::from_connect(
            "broker.local",
            5672,
            "richmond",
            "/richmond",
            BrokerError::Unreachable("connection refused".to_string()),
        );
        assert!(matches!(err, BridgeError::Connection { port: 5672, .. }));
        let message = err.to_string();
        assert!(message.contains("broker.local"));
        assert!(message.contains("5672"));
    }

    #[test]
    fn access_refused_is_an_authentication_failure() {
        let err = BridgeError::from_connect(
            "localhost",
            5672,
            "richmond",
            "/richmond",
            BrokerError::AccessRefused("ACCESS_REFUSED".to_string()),
        );
        assert!(matches!(
            err,
            BridgeError::Authentication { ref username, .. } if username == "richmond"
        ));
    }
}
