//! Datagram envelopes for the relay channel.
//!
//! Every field is a big-endian `u16` byte length followed by UTF-8 text:
//!
//! ```text
//! client -> server   | room_name | token | message_body |
//! server -> client   | sender_username | message_body |
//! ```
//!
//! Control traffic shares the channel. `__REGISTER__` and `__LEAVE__` travel
//! as the body of a normal envelope; `__ROOM_CLOSED__` is sent raw with no
//! framing at all. Inbound datagrams are classified into [`Request`] or
//! [`Notice`] before anything acts on them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::EnvelopeError;

/// Largest datagram either side will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 4096;

pub const REGISTER: &str = "__REGISTER__";
pub const LEAVE: &str = "__LEAVE__";
pub const ROOM_CLOSED: &str = "__ROOM_CLOSED__";

const LENGTH_PREFIX: usize = 2;

/// A datagram sent by a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub room_name: String,
    pub token: String,
    pub body: String,
}

impl Envelope {
    pub fn new(
        room_name: impl Into<String>,
        token: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            room_name: room_name.into(),
            token: token.into(),
            body: body.into(),
        }
    }

    /// Encodes the envelope, refusing anything over [`MAX_DATAGRAM_SIZE`].
    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        encode_fields(&[&self.room_name, &self.token, &self.body])
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, EnvelopeError> {
        let mut buf = datagram;
        let room_name = take_field(&mut buf)?;
        let token = take_field(&mut buf)?;
        let body = take_field(&mut buf)?;
        ensure_consumed(buf)?;
        Ok(Self {
            room_name,
            token,
            body,
        })
    }
}

/// A chat message forwarded by the relay. Room and token are stripped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relayed {
    pub sender: String,
    pub body: String,
}

impl Relayed {
    pub fn new(sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            body: body.into(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, EnvelopeError> {
        encode_fields(&[&self.sender, &self.body])
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, EnvelopeError> {
        let mut buf = datagram;
        let sender = take_field(&mut buf)?;
        let body = take_field(&mut buf)?;
        ensure_consumed(buf)?;
        Ok(Self { sender, body })
    }
}

/// What a client datagram asks the relay to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Register { room_name: String, token: String },
    Leave { room_name: String, token: String },
    Chat(Envelope),
}

impl Request {
    pub fn decode(datagram: &[u8]) -> Result<Self, EnvelopeError> {
        Envelope::decode(datagram).map(Self::from)
    }
}

impl From<Envelope> for Request {
    fn from(envelope: Envelope) -> Self {
        match envelope.body.as_str() {
            REGISTER => Request::Register {
                room_name: envelope.room_name,
                token: envelope.token,
            },
            LEAVE => Request::Leave {
                room_name: envelope.room_name,
                token: envelope.token,
            },
            _ => Request::Chat(envelope),
        }
    }
}

/// What the relay told a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Chat(Relayed),
    RoomClosed,
}

impl Notice {
    pub fn decode(datagram: &[u8]) -> Result<Self, EnvelopeError> {
        if datagram == ROOM_CLOSED.as_bytes() {
            return Ok(Notice::RoomClosed);
        }
        Relayed::decode(datagram).map(Notice::Chat)
    }
}

fn encode_fields(fields: &[&str]) -> Result<Bytes, EnvelopeError> {
    let mut size = 0;
    for field in fields {
        if field.len() > usize::from(u16::MAX) {
            return Err(EnvelopeError::FieldTooLong(field.len()));
        }
        size += LENGTH_PREFIX + field.len();
    }
    if size > MAX_DATAGRAM_SIZE {
        return Err(EnvelopeError::TooLarge(size));
    }

    let mut buf = BytesMut::with_capacity(size);
    for field in fields {
        // Length checked above.
        buf.put_u16(field.len() as u16);
        buf.put_slice(field.as_bytes());
    }
    Ok(buf.freeze())
}

fn take_field(buf: &mut &[u8]) -> Result<String, EnvelopeError> {
    if buf.remaining() < LENGTH_PREFIX {
        return Err(EnvelopeError::Truncated);
    }
    let len = usize::from(buf.get_u16());
    if buf.remaining() < len {
        return Err(EnvelopeError::Truncated);
    }
    let slice: &[u8] = *buf;
    let (field, rest) = slice.split_at(len);
    *buf = rest;
    String::from_utf8(field.to_vec()).map_err(|_| EnvelopeError::InvalidUtf8)
}

fn ensure_consumed(buf: &[u8]) -> Result<(), EnvelopeError> {
    match buf.len() {
        0 => Ok(()),
        extra => Err(EnvelopeError::TrailingBytes(extra)),
    }
}
