//! SSMI Frame Implementation
//!
//! SSMI is a line protocol. Every frame is a single line
//!
//! ```text
//! SSMI|<code>|<field>|<field>...\r\n
//! ```
//!
//! The last field of a message-carrying frame is free text and may itself
//! contain `|`, so typed accessors re-join everything after the fixed fields.
//!
//! | code | direction         | fields                          |
//! |------|-------------------|---------------------------------|
//! | 1    | client → gateway  | username, password              |
//! | 2    | client → gateway  | msisdn, text                    |
//! | 3    | client → gateway  | (none), link check              |
//! | 110  | client → gateway  | msisdn, ussd type, text         |
//! | 100  | gateway → client  | code of the acknowledged frame  |
//! | 101  | gateway → client  | reason                          |
//! | 105  | gateway → client  | msisdn, reference, status       |
//! | 107  | gateway → client  | msisdn, text                    |
//! | 110  | gateway → client  | msisdn, ussd type, phase, text  |

use crate::message::{InboundEvent, MessageKind, SendCommand};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::io::Cursor;
use thiserror::Error;

/// Longest line accepted from the gateway, terminator included
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Every frame starts with this token
pub const PREFIX: &str = "SSMI";

const SEPARATOR: char = '|';

/// SSMI command codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum Command {
    Login = 1,
    SendSms = 2,
    LinkCheck = 3,
    Ack = 100,
    Nack = 101,
    DeliveryReport = 105,
    IncomingSms = 107,
    Ussd = 110,
}

#[derive(Debug, Error)]
pub enum Error {
    /// Not enough data is available to parse a frame
    #[error("incomplete frame")]
    Incomplete,

    #[error("frame exceeds 65536 bytes (got {0})")]
    TooLong(usize),

    #[error("frame does not start with SSMI: {0:?}")]
    BadPrefix(String),

    #[error("invalid command code {0:?}")]
    BadCode(String),

    #[error("frame is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("field '{field}' {reason}")]
    InvalidField { field: &'static str, reason: &'static str },
}

/// A single SSMI line: the command code plus its `|`-separated fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u16,
    pub fields: Vec<String>,
}

/// What a gateway frame means to the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// The gateway accepted the frame with this command code
    Ack(String),
    Nack(String),
    Event(InboundEvent),
    /// Well formed but not something the session handles
    Other(Frame),
}

fn check_field(value: &str, field: &'static str, last: bool) -> Result<(), Error> {
    if value.contains(['\r', '\n']) {
        return Err(Error::InvalidField {
            field,
            reason: "contains a line break",
        });
    }
    if !last && value.contains(SEPARATOR) {
        return Err(Error::InvalidField {
            field,
            reason: "contains the field separator",
        });
    }
    Ok(())
}

impl Frame {
    pub fn new(command: Command, fields: Vec<String>) -> Frame {
        Frame {
            code: command.into(),
            fields,
        }
    }

    pub fn command(&self) -> Option<Command> {
        Command::try_from(self.code).ok()
    }

    pub fn login(username: &str, password: &str) -> Result<Frame, Error> {
        check_field(username, "username", false)?;
        check_field(password, "password", true)?;
        Ok(Frame::new(
            Command::Login,
            vec![username.to_string(), password.to_string()],
        ))
    }

    pub fn link_check() -> Frame {
        Frame::new(Command::LinkCheck, Vec::new())
    }

    /// Build the frame that delivers `command` to the handset.
    pub fn send(command: &SendCommand) -> Result<Frame, Error> {
        check_field(&command.destination, "msisdn", false)?;
        check_field(&command.body, "message", true)?;

        let frame = match command.kind {
            MessageKind::Sms => Frame::new(
                Command::SendSms,
                vec![command.destination.clone(), command.body.clone()],
            ),
            MessageKind::Ussd(ussd_type) => Frame::new(
                Command::Ussd,
                vec![
                    command.destination.clone(),
                    ussd_type.to_string(),
                    command.body.clone(),
                ],
            ),
        };
        Ok(frame)
    }

    /// Checks if an entire frame can be decoded from `src`.
    ///
    /// On success the cursor is left just past the line terminator, so
    /// `src.position()` is the number of bytes the frame occupies.
    pub fn check(src: &mut Cursor<&[u8]>) -> Result<(), Error> {
        let start = src.position() as usize;
        let buffer: &[u8] = *src.get_ref();
        let data = &buffer[start..];

        match data.iter().position(|&b| b == b'\n') {
            Some(end) if end + 1 > MAX_FRAME_SIZE => Err(Error::TooLong(end + 1)),
            Some(end) => {
                src.advance(end + 1);
                Ok(())
            }
            None if data.len() >= MAX_FRAME_SIZE => Err(Error::TooLong(data.len())),
            None => Err(Error::Incomplete),
        }
    }

    /// Parse one frame. The caller must have validated it with `check`.
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Frame, Error> {
        let start = src.position() as usize;
        let buffer: &[u8] = *src.get_ref();
        let data = &buffer[start..];
        let end = data
            .iter()
            .position(|&b| b == b'\n')
            .ok_or(Error::Incomplete)?;
        src.advance(end + 1);

        let line = std::str::from_utf8(&data[..end])?;
        let line = line.strip_suffix('\r').unwrap_or(line);

        let mut parts = line.split(SEPARATOR);
        match parts.next() {
            Some(PREFIX) => {}
            _ => return Err(Error::BadPrefix(line.chars().take(32).collect())),
        }

        let code = parts.next().unwrap_or_default();
        let code = code
            .trim()
            .parse::<u16>()
            .map_err(|_| Error::BadCode(code.to_string()))?;

        Ok(Frame {
            code,
            fields: parts.map(str::to_string).collect(),
        })
    }

    /// Write the wire form of this frame, terminator included.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(PREFIX.as_bytes());
        dst.put_u8(b'|');
        dst.put_slice(self.code.to_string().as_bytes());
        for field in &self.fields {
            dst.put_u8(b'|');
            dst.put_slice(field.as_bytes());
        }
        dst.put_slice(b"\r\n");
    }

    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(64);
        self.encode(&mut buf);
        buf
    }

    fn field(&self, index: usize) -> String {
        self.fields.get(index).cloned().unwrap_or_default()
    }

    /// Everything from `index` on, re-joined: the free-text tail.
    fn text_from(&self, index: usize) -> String {
        self.fields
            .get(index..)
            .map(|rest| rest.join("|"))
            .unwrap_or_default()
    }

    /// Interpret a frame received from the gateway.
    pub fn into_inbound(self) -> Inbound {
        let event = match self.command() {
            Some(Command::Ack) => return Inbound::Ack(self.field(0)),
            Some(Command::Nack) => return Inbound::Nack(self.text_from(0)),
            Some(Command::IncomingSms) if self.fields.len() >= 2 => InboundEvent::Sms {
                msisdn: self.field(0),
                message: self.text_from(1),
            },
            Some(Command::DeliveryReport) if self.fields.len() >= 3 => {
                InboundEvent::DeliveryReport {
                    msisdn: self.field(0),
                    reference: self.field(1),
                    status: self.text_from(2),
                }
            }
            Some(Command::Ussd) if self.fields.len() >= 4 => InboundEvent::Ussd {
                msisdn: self.field(0),
                ussd_type: self.field(1),
                phase: self.field(2),
                message: self.text_from(3),
            },
            _ => return Inbound::Other(self),
        };
        Inbound::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::UssdType;

    fn parse_one(data: &[u8]) -> Result<Frame, Error> {
        let mut cursor = Cursor::new(data);
        Frame::check(&mut cursor)?;
        cursor.set_position(0);
        Frame::parse(&mut cursor)
    }

    #[test]
    fn check_needs_a_full_line() {
        let mut cursor = Cursor::new(&b"SSMI|107|2771"[..]);
        assert!(matches!(Frame::check(&mut cursor), Err(Error::Incomplete)));
    }

    #[test]
    fn check_reports_consumed_length() {
        let data = b"SSMI|100|1\r\nSSMI|100|2\r\n";
        let mut cursor = Cursor::new(&data[..]);
        Frame::check(&mut cursor).unwrap();
        assert_eq!(cursor.position(), 12);
    }

    #[test]
    fn check_rejects_oversized_lines() {
        let data = vec![b'a'; MAX_FRAME_SIZE + 1];
        let mut cursor = Cursor::new(data.as_slice());
        assert!(matches!(Frame::check(&mut cursor), Err(Error::TooLong(_))));
    }

    #[test]
    fn parse_rejects_foreign_lines() {
        assert!(matches!(parse_one(b"HTTP/1.1 200 OK\r\n"), Err(Error::BadPrefix(_))));
        assert!(matches!(parse_one(b"SSMI|abc\r\n"), Err(Error::BadCode(_))));
    }

    #[test]
    fn incoming_sms_keeps_separators_in_text() {
        let frame = parse_one(b"SSMI|107|27711234567|price: 5|10 units\r\n").unwrap();
        assert_eq!(
            frame.into_inbound(),
            Inbound::Event(InboundEvent::Sms {
                msisdn: "27711234567".to_string(),
                message: "price: 5|10 units".to_string(),
            })
        );
    }

    #[test]
    fn incoming_ussd_and_receipts() {
        let frame = parse_one(b"SSMI|110|27711234567|2|1|reply text\n").unwrap();
        assert_eq!(
            frame.into_inbound(),
            Inbound::Event(InboundEvent::Ussd {
                msisdn: "27711234567".to_string(),
                ussd_type: "2".to_string(),
                phase: "1".to_string(),
                message: "reply text".to_string(),
            })
        );

        let frame = parse_one(b"SSMI|105|27711234567|abc123|1\r\n").unwrap();
        assert_eq!(
            frame.into_inbound(),
            Inbound::Event(InboundEvent::DeliveryReport {
                msisdn: "27711234567".to_string(),
                reference: "abc123".to_string(),
                status: "1".to_string(),
            })
        );
    }

    #[test]
    fn acks_and_unknown_codes() {
        assert_eq!(
            parse_one(b"SSMI|100|1\r\n").unwrap().into_inbound(),
            Inbound::Ack("1".to_string())
        );
        assert_eq!(
            parse_one(b"SSMI|101|bad login\r\n").unwrap().into_inbound(),
            Inbound::Nack("bad login".to_string())
        );
        assert!(matches!(
            parse_one(b"SSMI|999|x\r\n").unwrap().into_inbound(),
            Inbound::Other(Frame { code: 999, .. })
        ));
    }

    #[test]
    fn ussd_send_encoding() {
        let command = SendCommand::ussd("27711234567", "hello", UssdType::New);
        let frame = Frame::send(&command).unwrap();
        assert_eq!(&frame.to_bytes()[..], b"SSMI|110|27711234567|1|hello\r\n");
    }

    #[test]
    fn sms_send_encoding() {
        let command = SendCommand::sms("27711234567", "hi");
        let frame = Frame::send(&command).unwrap();
        assert_eq!(&frame.to_bytes()[..], b"SSMI|2|27711234567|hi\r\n");
    }

    #[test]
    fn unframeable_commands_are_rejected() {
        let command = SendCommand::sms("2771|1", "hi");
        assert!(matches!(
            Frame::send(&command),
            Err(Error::InvalidField { field: "msisdn", .. })
        ));

        let command = SendCommand::sms("2771", "line one\r\nSSMI|1|x|y");
        assert!(matches!(
            Frame::send(&command),
            Err(Error::InvalidField { field: "message", .. })
        ));
    }
}
