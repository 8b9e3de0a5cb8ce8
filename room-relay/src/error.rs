//! Error types for the wire protocols and the snapshot sidecar.
//!
//! Business outcomes (room already exists, room missing) are not errors and
//! never appear here; they travel as `success = false` on the handshake.

use std::io;

use thiserror::Error;

/// Failures on the handshake stream. The server answers none of these; it
/// closes the connection without replying.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("unknown operation code {0}")]
    UnknownOperation(u8),

    #[error("unknown state code {0}")]
    UnknownState(u8),

    #[error("expected {expected} message, got {actual}")]
    UnexpectedState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("payload of {0} bytes exceeds the handshake limit")]
    PayloadTooLarge(usize),

    #[error("room name of {0} bytes does not fit in a frame")]
    RoomNameTooLong(usize),

    #[error("frame field is not valid UTF-8")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("timed out waiting for the request")]
    TimedOut,
}

/// Failures while encoding or decoding relay datagrams.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("datagram of {0} bytes exceeds the 4096 byte limit")]
    TooLarge(usize),

    #[error("field of {0} bytes does not fit a u16 length prefix")]
    FieldTooLong(usize),

    #[error("datagram truncated")]
    Truncated,

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("field is not valid UTF-8")]
    InvalidUtf8,
}

/// Failures of the persistence sidecar. Always logged, never propagated to
/// the caller of a store mutation.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("snapshot is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures of a client-side relay session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("relay socket failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}
