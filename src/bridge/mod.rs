// ABOUTME: The broker-to-SSMI bridge: topology, consume-and-forward, inbound publishing and supervision
// ABOUTME: Generic over the broker and session traits so the whole pipeline runs against in-memory fakes

//! Bridge Module
//!
//! Wires a [`Broker`](crate::broker::Broker) to a
//! [`SessionConnector`](crate::session::SessionConnector):
//!
//! ```text
//! send queue  --> consumer --> SSMI session --> gateway
//! exchange    <-- publisher <-- SSMI session <-- gateway
//! ```
//!
//! [`start`] runs the ordered startup and returns a [`RunningBridge`];
//! [`supervise`] keeps one running, restarting with [`RetryPolicy`] backoff.
//!
//! # Example
//!
//! ```rust,no_run
//! use ssmi_bridge::bridge::supervise;
//! use ssmi_bridge::broker::AmqpBroker;
//! use ssmi_bridge::config::{AmqpSettings, BridgeConfig, SsmiSettings};
//! use ssmi_bridge::ssmi::SsmiConnector;
//!
//! #[tokio::main]
//! async fn main() -> ssmi_bridge::Result<()> {
//!     let config = BridgeConfig::new(
//!         AmqpSettings::default(),
//!         SsmiSettings::new("ssmi.example.org", 9000, "user", "secret"),
//!     );
//!     let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//!
//!     supervise(&AmqpBroker::new(), &SsmiConnector, &config, shutdown_rx).await?;
//!     Ok(())
//! }
//! ```

pub mod consumer;
pub mod error;
pub mod orchestrator;
pub mod publisher;
pub mod supervisor;
pub mod topology;

pub use consumer::{Handled, handle_delivery};
pub use error::BridgeError;
pub use orchestrator::{RunningBridge, start, start_with_backlog};
pub use publisher::InboundPublisher;
pub use supervisor::{RetryPolicy, supervise};
pub use topology::Topology;
