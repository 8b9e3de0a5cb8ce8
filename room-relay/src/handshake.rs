//! Create/join handshake over a reliable stream.
//!
//! One request per connection. Every message is a single frame:
//!
//! ```text
//! +-----+-------+----------+-------------+-----------+---------+
//! | op  | state | room_len | payload_len | room_name | payload |
//! | u8  | u8    | u16 BE   | u32 BE      | UTF-8     | UTF-8   |
//! +-----+-------+----------+-------------+-----------+---------+
//! ```
//!
//! The client sends REQUEST with the username as payload. The server answers
//! with COMPLIANCE `{"success": bool}` and COMPLETE `{"token": string}` in one
//! write, then closes. A refused request still gets both frames, with
//! `success = false` and an empty token. A frame with an unknown operation or
//! a state other than REQUEST is a protocol error: no reply, connection closed.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};

use crate::{error::HandshakeError, store::RoomStore};

/// Upper bound on a frame payload.
pub const MAX_PAYLOAD: usize = 64 * 1024;

const HEADER_LEN: usize = 8;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    CreateRoom = 1,
    JoinRoom = 2,
}

impl TryFrom<u8> for Operation {
    type Error = HandshakeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Operation::CreateRoom),
            2 => Ok(Operation::JoinRoom),
            other => Err(HandshakeError::UnknownOperation(other)),
        }
    }
}

/// State code carried by every frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Request = 0,
    Compliance = 1,
    Complete = 2,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::Request => "REQUEST",
            Phase::Compliance => "COMPLIANCE",
            Phase::Complete => "COMPLETE",
        }
    }
}

impl TryFrom<u8> for Phase {
    type Error = HandshakeError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Phase::Request),
            1 => Ok(Phase::Compliance),
            2 => Ok(Phase::Complete),
            other => Err(HandshakeError::UnknownState(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub operation: Operation,
    pub phase: Phase,
    pub room_name: String,
    pub payload: String,
}

impl Frame {
    pub fn new(
        operation: Operation,
        phase: Phase,
        room_name: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            operation,
            phase,
            room_name: room_name.into(),
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        let room_len = u16::try_from(self.room_name.len())
            .map_err(|_| HandshakeError::RoomNameTooLong(self.room_name.len()))?;
        if self.payload.len() > MAX_PAYLOAD {
            return Err(HandshakeError::PayloadTooLarge(self.payload.len()));
        }
        // Bounded by MAX_PAYLOAD above.
        let payload_len = self.payload.len() as u32;

        let mut encoded =
            Vec::with_capacity(HEADER_LEN + self.room_name.len() + self.payload.len());
        encoded.push(self.operation as u8);
        encoded.push(self.phase as u8);
        encoded.extend_from_slice(&room_len.to_be_bytes());
        encoded.extend_from_slice(&payload_len.to_be_bytes());
        encoded.extend_from_slice(self.room_name.as_bytes());
        encoded.extend_from_slice(self.payload.as_bytes());
        Ok(encoded)
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), HandshakeError> {
        if self.phase == expected {
            return Ok(());
        }
        Err(HandshakeError::UnexpectedState {
            expected: expected.name(),
            actual: self.phase.name(),
        })
    }
}

/// Reads exactly one frame, never past its end.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let operation = Operation::try_from(reader.read_u8().await?)?;
    let phase = Phase::try_from(reader.read_u8().await?)?;
    let room_len = usize::from(reader.read_u16().await?);
    let payload_len = reader.read_u32().await? as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(HandshakeError::PayloadTooLarge(payload_len));
    }

    let room_name = read_text(reader, room_len).await?;
    let payload = read_text(reader, payload_len).await?;
    Ok(Frame {
        operation,
        phase,
        room_name,
        payload,
    })
}

async fn read_text<R>(reader: &mut R, len: usize) -> Result<String, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0; len];
    reader.read_exact(&mut buf).await?;
    Ok(String::from_utf8(buf)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compliance {
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Complete {
    pub token: String,
}

/// What the server did with one handshake connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub operation: Operation,
    pub room_name: String,
    pub username: String,
    /// `None` when the request was refused.
    pub token: Option<String>,
}

/// Serves one handshake on `stream`: reads the REQUEST, applies it to the
/// store and writes COMPLIANCE and COMPLETE together.
///
/// `read_timeout` bounds the wait for the request. With `None` the read
/// blocks until the peer sends or disconnects.
pub async fn serve<S>(
    stream: &mut S,
    store: &RoomStore,
    read_timeout: Option<Duration>,
) -> Result<Outcome, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match read_timeout {
        Some(limit) => timeout(limit, read_frame(stream))
            .await
            .map_err(|_| HandshakeError::TimedOut)??,
        None => read_frame(stream).await?,
    };
    request.expect_phase(Phase::Request)?;

    let username = clean_username(&request.payload);
    let token = if username.is_empty() || request.room_name.trim().is_empty() {
        None
    } else {
        match request.operation {
            Operation::CreateRoom => store.create_room(&request.room_name, &username, None).await,
            Operation::JoinRoom => store.join_room(&request.room_name, &username, None).await,
        }
    };

    let reply = reply_frames(request.operation, &request.room_name, token.as_deref())?;
    stream.write_all(&reply).await?;
    stream.flush().await?;

    Ok(Outcome {
        operation: request.operation,
        room_name: request.room_name,
        username,
        token,
    })
}

fn reply_frames(
    operation: Operation,
    room_name: &str,
    token: Option<&str>,
) -> Result<Vec<u8>, HandshakeError> {
    let compliance = serde_json::to_string(&Compliance {
        success: token.is_some(),
    })?;
    let complete = serde_json::to_string(&Complete {
        token: token.unwrap_or_default().to_string(),
    })?;

    let mut reply = Frame::new(operation, Phase::Compliance, room_name, compliance).encode()?;
    reply.extend(Frame::new(operation, Phase::Complete, room_name, complete).encode()?);
    Ok(reply)
}

/// Client side of the exchange: sends one REQUEST and reads COMPLIANCE then
/// COMPLETE. Returns the token, or `None` if the server refused.
pub async fn request<S>(
    stream: &mut S,
    operation: Operation,
    room_name: &str,
    username: &str,
) -> Result<Option<String>, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = Frame::new(operation, Phase::Request, room_name, username).encode()?;
    stream.write_all(&request).await?;
    stream.flush().await?;

    let compliance = read_frame(stream).await?;
    compliance.expect_phase(Phase::Compliance)?;
    let Compliance { success } = serde_json::from_str(&compliance.payload)?;
    if !success {
        return Ok(None);
    }

    let complete = read_frame(stream).await?;
    complete.expect_phase(Phase::Complete)?;
    let Complete { token } = serde_json::from_str(&complete.payload)?;
    Ok(Some(token).filter(|token| !token.is_empty()))
}

/// Strips whitespace and stray quoting picked up in transit.
fn clean_username(raw: &str) -> String {
    raw.trim().trim_matches('"').trim().to_string()
}
