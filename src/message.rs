// ABOUTME: Broker payload types: outbound send commands and inbound session events
// ABOUTME: Decodes the JSON send body published by applications and encodes events for consumers

use num_enum::{IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// USSD session step carried with every USSD send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum UssdType {
    /// Opens a new USSD session with the handset
    New = 1,
    /// Continues an existing session and waits for a reply
    Existing = 2,
    /// Final message, closes the session
    End = 3,
    /// Session timed out
    Timeout = 4,
}

impl UssdType {
    pub fn code(self) -> u8 {
        self.into()
    }
}

impl fmt::Display for UssdType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

impl FromStr for UssdType {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u8>()
            .ok()
            .and_then(|code| UssdType::try_from(code).ok())
            .ok_or_else(|| DecodeError::InvalidUssdType(s.to_string()))
    }
}

/// How a command is delivered to the handset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Sms,
    Ussd(UssdType),
}

/// Errors raised while decoding an outbound message body
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed send body: {0}")]
    Json(#[from] serde_json::Error),

    #[error("send body has an empty msisdn")]
    EmptyDestination,

    #[error("unknown ussd_type: {0:?}")]
    InvalidUssdType(String),
}

/// A decoded outbound message, forwarded to the protocol session exactly once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendCommand {
    pub destination: String,
    pub body: String,
    pub kind: MessageKind,
}

// Producers are not consistent about quoting numbers, so both forms are accepted.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Scalar {
    Text(String),
    Number(u64),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Text(s) => s,
            Scalar::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SendBody {
    msisdn: Scalar,
    message: String,
    #[serde(default)]
    ussd_type: Option<Scalar>,
}

#[derive(Debug, Serialize)]
struct SendBodyRef<'a> {
    msisdn: &'a str,
    message: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ussd_type: Option<String>,
}

impl SendCommand {
    pub fn sms(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
            kind: MessageKind::Sms,
        }
    }

    pub fn ussd(
        destination: impl Into<String>,
        body: impl Into<String>,
        ussd_type: UssdType,
    ) -> Self {
        Self {
            destination: destination.into(),
            body: body.into(),
            kind: MessageKind::Ussd(ussd_type),
        }
    }

    /// Decode a broker message body of the form
    /// `{"msisdn": "...", "message": "...", "ussd_type": "1"}`.
    ///
    /// A body without `ussd_type` is sent as a plain SMS.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let body: SendBody = serde_json::from_slice(payload)?;

        let destination = body.msisdn.into_string();
        if destination.trim().is_empty() {
            return Err(DecodeError::EmptyDestination);
        }

        let kind = match body.ussd_type {
            None => MessageKind::Sms,
            Some(tag) => MessageKind::Ussd(tag.into_string().parse()?),
        };

        Ok(Self {
            destination,
            body: body.message,
            kind,
        })
    }

    /// Encode in the same shape `decode` accepts, for producers and tooling.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        let ussd_type = match self.kind {
            MessageKind::Sms => None,
            MessageKind::Ussd(t) => Some(t.to_string()),
        };
        serde_json::to_vec(&SendBodyRef {
            msisdn: &self.destination,
            message: &self.body,
            ussd_type,
        })
    }
}

/// Something the protocol endpoint told us: an incoming message or a receipt.
///
/// Field values are passed through exactly as the endpoint reported them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundEvent {
    Sms {
        msisdn: String,
        message: String,
    },
    Ussd {
        msisdn: String,
        ussd_type: String,
        phase: String,
        message: String,
    },
    DeliveryReport {
        msisdn: String,
        reference: String,
        status: String,
    },
}

impl InboundEvent {
    pub fn msisdn(&self) -> &str {
        match self {
            InboundEvent::Sms { msisdn, .. }
            | InboundEvent::Ussd { msisdn, .. }
            | InboundEvent::DeliveryReport { msisdn, .. } => msisdn,
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
