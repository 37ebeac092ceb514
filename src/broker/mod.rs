// ABOUTME: Message broker abstraction used by the bridge: connection, channel and consumer traits
// ABOUTME: Implemented for RabbitMQ (AMQP 0-9-1 via lapin) and for an in-process broker used in tests

//! Broker Module
//!
//! The bridge only needs a narrow slice of AMQP: connect and log in, open one
//! channel, declare a direct exchange and two durable queues, bind them,
//! consume with manual acknowledgement and publish. These traits capture that
//! slice so the orchestration can be exercised against [`MemoryBroker`]
//! without a running RabbitMQ.
//!
//! ## Layers
//!
//! * [`Broker`] - opens an authenticated [`BrokerConnection`]
//! * [`BrokerConnection`] - owns channels, closes the connection
//! * [`BrokerChannel`] - declarations, ack/reject and publish
//! * [`Consumer`] - the stream of deliveries for one queue

pub mod amqp;
pub mod memory;

pub use amqp::{AmqpBroker, AmqpChannel, AmqpConnection, AmqpConsumer};
pub use memory::{BrokerOp, MemoryBroker, MemoryChannel, MemoryConnection, MemoryConsumer};

use crate::config::AmqpSettings;
use thiserror::Error;

/// Errors reported by a broker implementation
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker could not be reached (refused, unresolvable, reset)
    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// Credentials or virtual host were rejected during the handshake
    #[error("access refused: {0}")]
    AccessRefused(String),

    /// The channel or its connection is gone
    #[error("channel closed")]
    ChannelClosed,

    /// A declaration referenced something that does not exist
    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    /// A redeclaration conflicted with the existing entity
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    /// Ack or reject for a tag that is not outstanding on this channel
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// The broker refused to take responsibility for a published message
    #[error("publish to {exchange:?} with routing key {routing_key:?} was nacked")]
    PublishNacked {
        exchange: String,
        routing_key: String,
    },

    /// Any other client library error
    #[error("amqp error: {0}")]
    Amqp(#[from] lapin::Error),
}

/// Exchange routing type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// A message handed to a consumer, outstanding until acked or rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub data: Vec<u8>,
}

/// Entry point: opens an authenticated connection.
pub trait Broker {
    type Connection: BrokerConnection;

    /// Open a connection to `settings.host:settings.port` and log in with the
    /// configured credentials and virtual host.
    ///
    /// AMQP performs the SASL exchange as part of the connection handshake,
    /// so implementations must tell the two failure modes apart:
    /// [`BrokerError::Unreachable`] for transport failures and
    /// [`BrokerError::AccessRefused`] for rejected credentials.
    async fn connect(&self, settings: &AmqpSettings) -> Result<Self::Connection, BrokerError>;
}

/// An open, authenticated broker connection
pub trait BrokerConnection {
    type Channel: BrokerChannel;

    async fn open_channel(&mut self) -> Result<Self::Channel, BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

/// Operations on a single channel.
///
/// A channel is not safe for overlapping operations; callers drive it from a
/// single task.
pub trait BrokerChannel {
    type Consumer: Consumer;

    /// Declare a durable exchange. Redeclaring with the same kind is a no-op.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Declare a durable queue. Redeclaring with the same arguments is a no-op.
    ///
    /// Deliveries rejected without requeue are republished to
    /// `dead_letter_exchange` when one is given, and dropped otherwise.
    async fn declare_queue(
        &self,
        name: &str,
        dead_letter_exchange: Option<&str>,
    ) -> Result<(), BrokerError>;

    /// Bind `queue` to `exchange` for `routing_key`. Rebinding is a no-op.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Register a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<Self::Consumer, BrokerError>;

    /// Acknowledge a single delivery (never cumulative).
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Reject a single delivery, optionally returning it to the queue.
    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Publish and wait until the broker has taken the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError>;
}

/// Deliveries for one queue, in broker order.
pub trait Consumer {
    /// Wait for the next delivery.
    ///
    /// Returns `Ok(None)` when the broker cancelled the consumer.
    async fn next_delivery(&mut self) -> Result<Option<Delivery>, BrokerError>;
}
