//! Room-based chat over a TCP handshake and a UDP relay.
//!
//! A client opens a short TCP connection to create or join a named room and
//! receives an opaque token. It then talks to the relay over UDP: it
//! registers its socket under the token and sends messages addressed by
//! (room, token); the relay forwards them to every other registered member.
//!
//! - [`store`] is the authoritative room and token registry, shared by both
//!   listeners behind one lock.
//! - [`handshake`] is the create/join wire protocol, both sides of it.
//! - [`envelope`] encodes relay datagrams and classifies control traffic.
//! - [`relay`] validates tokens and fans messages out.
//! - [`snapshot`] saves the store to disk after each change.
//! - [`server`] runs the handshake acceptor and the relay loop together.
//! - [`client`] performs the handshake and drives an interactive chat.
//! - [`cli`] parses the command line for the `room-relay` binary.

pub mod cli;
pub mod client;
pub mod envelope;
pub mod error;
pub mod handshake;
pub mod relay;
pub mod server;
pub mod snapshot;
pub mod store;
