// ABOUTME: Protocol session traits the bridge drives: connect, readiness, send and the inbound sink
// ABOUTME: Error types separate session failures (reconnect) from commands the endpoint cannot take

use crate::config::SsmiSettings;
use crate::message::{InboundEvent, SendCommand};
use std::io;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors establishing or holding a protocol session
#[derive(Debug, Error)]
pub enum SessionError {
    /// TCP connect failed (refused, unresolvable, unreachable)
    #[error("cannot connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// The endpoint rejected our login
    #[error("login refused: {0}")]
    LoginRefused(String),

    /// I/O error on an established session
    #[error("session error: {0}")]
    Io(#[from] io::Error),

    /// The endpoint closed the connection
    #[error("session closed by peer")]
    Closed,

    /// The endpoint said something we did not expect
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Errors handing a command to the session
#[derive(Debug, Error)]
pub enum SendError {
    /// No live session to send on
    #[error("session not ready")]
    NotReady,

    /// The command cannot be expressed on the wire; retrying will not help
    #[error("command rejected: {0}")]
    Rejected(String),

    /// Writing to the endpoint failed
    #[error("send failed: {0}")]
    Io(#[from] io::Error),
}

impl SendError {
    /// True when the session itself is broken rather than the command.
    pub fn is_session_failure(&self) -> bool {
        !matches!(self, SendError::Rejected(_))
    }
}

/// The callback a session uses to report inbound messages and receipts.
///
/// Events are queued until the inbound publisher drains them, so nothing the
/// endpoint reports before publishing is switched on is lost.
#[derive(Debug, Clone)]
pub struct InboundSink {
    tx: mpsc::UnboundedSender<InboundEvent>,
}

impl InboundSink {
    /// Create a sink and the receiving end handed to the publisher.
    pub fn channel() -> (InboundSink, mpsc::UnboundedReceiver<InboundEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (InboundSink { tx }, rx)
    }

    /// Report an event. Returns false if the publisher side has gone away.
    pub fn emit(&self, event: InboundEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

/// Establishes sessions with the protocol endpoint
pub trait SessionConnector {
    type Session: ProtocolSession;

    /// Connect to `settings.host:settings.port` and log in with the configured
    /// credentials. Inbound events are reported through `sink` for the life
    /// of the session.
    async fn connect(
        &self,
        settings: &SsmiSettings,
        sink: InboundSink,
    ) -> Result<Self::Session, SessionError>;
}

/// A live session with the protocol endpoint
pub trait ProtocolSession {
    /// Whether the session is logged in and its connection still up.
    fn is_ready(&self) -> bool;

    /// Hand a command to the endpoint. Returns once the command is written.
    async fn send(&mut self, command: &SendCommand) -> Result<(), SendError>;

    /// Close the session. Safe to call more than once.
    async fn close(&mut self);
}
