// ABOUTME: SSMI protocol support: line codec, buffered connection halves, link checks and the TCP session
// ABOUTME: The session implements the crate's session traits so the bridge can drive a real gateway

//! SSMI Module
//!
//! SSMI is a line-oriented protocol. Every frame is a `|`-separated line
//! starting with `SSMI` and a numeric command code:
//!
//! ```text
//! SSMI|1|username|password          login
//! SSMI|110|27711234567|1|Welcome    send USSD (type 1 opens a session)
//! SSMI|100|1                        ack
//! SSMI|107|27711234567|hi there     incoming SMS
//! ```

pub mod connection;
pub mod frame;
pub mod keepalive;
pub mod session;

pub use connection::{FrameReader, FrameWriter};
pub use frame::{Command, Frame, Inbound};
pub use keepalive::{KeepAliveConfig, KeepAliveManager, KeepAliveStatus};
pub use session::{SsmiConnector, SsmiSession};
