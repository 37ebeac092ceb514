pub mod bridge;
pub mod broker;
pub mod config;
pub mod message;
pub mod session;
pub mod ssmi;


// Re-export the types most callers need
pub use bridge::{BridgeError, RetryPolicy, RunningBridge, start, supervise};
pub use config::{AmqpSettings, BridgeConfig, ConfigError, Options, SsmiSettings};
pub use message::{InboundEvent, MessageKind, SendCommand, UssdType};
pub use session::{InboundSink, ProtocolSession, SendError, SessionConnector, SessionError};

/// Error returned by the binary and by helpers that do not need a typed error.
///
/// Each layer has its own `thiserror` enum (`BrokerError`, `SessionError`,
/// `BridgeError`, ...) so callers can match on what went wrong. Where that
/// detail does not matter, such as `main`, a boxed `std::error::Error` is
/// sufficient. The SSMI frame reader also returns it so a parse error and an
/// I/O error can travel the same path.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

/// A specialized `Result` type for bridge operations.
///
/// This is defined as a convenience.
///
/// # Examples
///
/// ## Running the bridge against RabbitMQ
///
/// ```rust,no_run
/// use ssmi_bridge::broker::AmqpBroker;
/// use ssmi_bridge::ssmi::SsmiConnector;
/// use ssmi_bridge::{AmqpSettings, BridgeConfig, SsmiSettings};
///
/// #[tokio::main]
/// async fn main() -> ssmi_bridge::Result<()> {
///     let config = BridgeConfig::new(
///         AmqpSettings::default(),
///         SsmiSettings::new("ssmi.example.org", 9000, "user", "secret"),
///     );
///
///     // Connect, declare the topology, log in and start consuming
///     let mut bridge = ssmi_bridge::start(&AmqpBroker::new(), &SsmiConnector, &config).await?;
///
///     let (_shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
///     bridge.run(&mut shutdown_rx).await?;
///     bridge.stop().await;
///
///     Ok(())
/// }
/// ```
///
/// ## Publishing a send command
///
/// Applications put JSON on the exchange with the send routing key:
///
/// ```rust
/// use ssmi_bridge::{SendCommand, UssdType};
///
/// let command = SendCommand::ussd("27711234567", "Welcome", UssdType::New);
/// let body = command.encode().unwrap();
///
/// assert_eq!(SendCommand::decode(&body).unwrap(), command);
/// ```
pub type Result<T> = std::result::Result<T, Error>;
