//! Authoritative in-memory room and token registry.
//!
//! Both the handshake tasks and the relay loop mutate this store, so every
//! operation takes the single state lock for its whole read-then-write
//! sequence. Snapshots are written while the lock is still held, which keeps
//! the file in mutation order.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::{
    error::SnapshotError,
    snapshot::{Persistence, Snapshot, timestamp},
};

const TOKEN_PREFIX: &str = "token_";
const TOKEN_BYTES: usize = 16;

/// A chat room. The room name is the key it is stored under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub host_token: String,
    /// Member tokens in join order. The host is always first.
    pub members: Vec<String>,
    #[serde(with = "timestamp")]
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub username: String,
    pub room_name: String,
    pub is_host: bool,
    #[serde(default)]
    pub address: Option<PeerAddr>,
}

/// Last known relay address of a token.
///
/// Addresses are written as `"ip:port"` strings, but older snapshots store
/// them as a `[host, port]` pair. Both forms are accepted and resolved before
/// use as a send target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerAddr {
    Socket(SocketAddr),
    Pair(String, u16),
}

impl PeerAddr {
    pub fn resolve(&self) -> Option<SocketAddr> {
        match self {
            PeerAddr::Socket(addr) => Some(*addr),
            PeerAddr::Pair(host, port) => {
                let ip = if host.eq_ignore_ascii_case("localhost") {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                } else {
                    host.parse().ok()?
                };
                Some(SocketAddr::new(ip, *port))
            }
        }
    }
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::Socket(addr)
    }
}

/// Why a token failed validation against a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("invalid token")]
    UnknownToken,
    #[error("room does not exist")]
    UnknownRoom,
    #[error("token is not a member of this room")]
    NotAMember,
    #[error("token belongs to a different room")]
    RoomMismatch,
}

/// A member removed as part of a cascading close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departed {
    pub token: String,
    pub username: String,
    pub address: Option<PeerAddr>,
}

/// Result of removing a departing token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Departure {
    /// The token was not known; nothing changed.
    Unknown,
    /// A non-host member left; the room is unchanged otherwise.
    Left { room_name: String, username: String },
    /// The host left. The room and every member token are gone; `members`
    /// lists the other members that should be told.
    RoomClosed {
        room_name: String,
        host: String,
        members: Vec<Departed>,
    },
}

/// Everything the relay needs to fan a message out, resolved under one lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTargets {
    pub sender: String,
    /// Other members with a registered address, in join order.
    pub recipients: Vec<(String, PeerAddr)>,
    /// Other members that have not registered yet.
    pub unregistered: usize,
}

#[derive(Debug, Default)]
struct StoreState {
    rooms: BTreeMap<String, Room>,
    tokens: BTreeMap<String, TokenRecord>,
}

impl StoreState {
    fn find_user_token(&self, room_name: &str, username: &str) -> Option<String> {
        let room = self.rooms.get(room_name)?;
        room.members
            .iter()
            .find(|token| {
                self.tokens
                    .get(token.as_str())
                    .is_some_and(|record| record.username == username)
            })
            .cloned()
    }

    fn validate(&self, token: &str, room_name: &str) -> Result<(), Rejection> {
        let record = self.tokens.get(token).ok_or(Rejection::UnknownToken)?;
        let room = self.rooms.get(room_name).ok_or(Rejection::UnknownRoom)?;
        if !room.members.iter().any(|member| member == token) {
            return Err(Rejection::NotAMember);
        }
        if record.room_name != room_name {
            return Err(Rejection::RoomMismatch);
        }
        Ok(())
    }

    fn mint_token(&self) -> String {
        loop {
            let mut bytes = [0u8; TOKEN_BYTES];
            OsRng.fill_bytes(&mut bytes);
            let mut token = String::with_capacity(TOKEN_PREFIX.len() + TOKEN_BYTES * 2);
            token.push_str(TOKEN_PREFIX);
            for byte in bytes {
                let _ = write!(token, "{byte:02x}");
            }
            if !self.tokens.contains_key(&token) {
                return token;
            }
        }
    }

    fn remove(&mut self, token: &str) -> Departure {
        let Some(record) = self.tokens.remove(token) else {
            warn!(token = short(token), "unknown token is leaving");
            return Departure::Unknown;
        };

        let is_host = self
            .rooms
            .get(&record.room_name)
            .is_some_and(|room| room.host_token == token);

        if is_host {
            let room = self.rooms.remove(&record.room_name);
            let members = room
                .map(|room| room.members)
                .unwrap_or_default()
                .into_iter()
                .filter(|member| member != token)
                .filter_map(|member| {
                    let removed = self.tokens.remove(&member)?;
                    Some(Departed {
                        token: member,
                        username: removed.username,
                        address: removed.address,
                    })
                })
                .collect();
            info!(room = %record.room_name, host = %record.username, "host left, room closed");
            return Departure::RoomClosed {
                room_name: record.room_name,
                host: record.username,
                members,
            };
        }

        if let Some(room) = self.rooms.get_mut(&record.room_name) {
            room.members.retain(|member| member != token);
        }
        info!(room = %record.room_name, username = %record.username, "member left room");
        Departure::Left {
            room_name: record.room_name,
            username: record.username,
        }
    }
}

/// Process-wide room and token store.
pub struct RoomStore {
    state: Mutex<StoreState>,
    persistence: Option<Arc<dyn Persistence>>,
}

impl Default for RoomStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomStore {
    /// Creates an empty store that is never persisted.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            persistence: None,
        }
    }

    /// Creates an empty store that saves itself after every mutation.
    pub fn with_persistence<P>(persistence: P) -> Self
    where
        P: Persistence + 'static,
    {
        Self {
            state: Mutex::new(StoreState::default()),
            persistence: Some(Arc::new(persistence)),
        }
    }

    /// Loads the last snapshot from `persistence`, if there is one, and keeps
    /// saving to it afterwards. A snapshot that cannot be read is set aside
    /// and the store starts empty. If it cannot be set aside either, the
    /// store runs unpersisted rather than overwrite it.
    pub fn load<P>(persistence: P) -> Self
    where
        P: Persistence + 'static,
    {
        let state = match persistence.load() {
            Ok(Some(snapshot)) => {
                info!(
                    rooms = snapshot.rooms.len(),
                    tokens = snapshot.tokens.len(),
                    saved_at = ?snapshot.saved_at,
                    "loaded room snapshot"
                );
                StoreState {
                    rooms: snapshot.rooms,
                    tokens: snapshot.tokens,
                }
            }
            Ok(None) => {
                info!("no room snapshot found, starting empty");
                StoreState::default()
            }
            Err(error) => {
                warn!(%error, "failed to load room snapshot, starting empty");
                if let Err(error) = Self::set_aside(&persistence) {
                    warn!(%error, "cannot move unreadable snapshot aside, persistence disabled");
                    return Self::new();
                }
                StoreState::default()
            }
        };

        Self {
            state: Mutex::new(state),
            persistence: Some(Arc::new(persistence)),
        }
    }

    fn set_aside(persistence: &dyn Persistence) -> Result<(), SnapshotError> {
        let moved_to = persistence.set_aside()?;
        warn!(path = %moved_to.display(), "unreadable room snapshot moved aside");
        Ok(())
    }

    /// Builds an unpersisted store from a snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            state: Mutex::new(StoreState {
                rooms: snapshot.rooms,
                tokens: snapshot.tokens,
            }),
            persistence: None,
        }
    }

    /// Creates `room_name` with the caller as host. Returns `None` if the
    /// room already exists.
    pub async fn create_room(
        &self,
        room_name: &str,
        username: &str,
        address: Option<SocketAddr>,
    ) -> Option<String> {
        let mut state = self.state.lock().await;
        if state.rooms.contains_key(room_name) {
            return None;
        }

        let token = state.mint_token();
        state.rooms.insert(
            room_name.to_string(),
            Room {
                host_token: token.clone(),
                members: vec![token.clone()],
                created_at: OffsetDateTime::now_utc(),
            },
        );
        state.tokens.insert(
            token.clone(),
            TokenRecord {
                username: username.to_string(),
                room_name: room_name.to_string(),
                is_host: true,
                address: address.map(PeerAddr::from),
            },
        );

        self.persist(&state).await;
        Some(token)
    }

    /// Joins an existing room. A username that already holds a token in the
    /// room gets that token back, with its address refreshed when one is
    /// given. Returns `None`
    /// if the room does not exist.
    pub async fn join_room(
        &self,
        room_name: &str,
        username: &str,
        address: Option<SocketAddr>,
    ) -> Option<String> {
        let mut state = self.state.lock().await;
        if !state.rooms.contains_key(room_name) {
            return None;
        }

        if let Some(existing) = state.find_user_token(room_name, username) {
            // A handshake that knows no address keeps the registered one.
            if let (Some(record), Some(address)) = (state.tokens.get_mut(&existing), address) {
                record.address = Some(address.into());
            }
            debug!(room = room_name, username, "existing member rejoined");
            self.persist(&state).await;
            return Some(existing);
        }

        let token = state.mint_token();
        if let Some(room) = state.rooms.get_mut(room_name) {
            room.members.push(token.clone());
        }
        state.tokens.insert(
            token.clone(),
            TokenRecord {
                username: username.to_string(),
                room_name: room_name.to_string(),
                is_host: false,
                address: address.map(PeerAddr::from),
            },
        );

        self.persist(&state).await;
        Some(token)
    }

    pub async fn find_user_token_in_room(&self, room_name: &str, username: &str) -> Option<String> {
        self.state.lock().await.find_user_token(room_name, username)
    }

    /// Checks that `token` exists, `room_name` exists, the token is a member
    /// of the room and was issued for it.
    pub async fn validate_token_and_address(
        &self,
        token: &str,
        room_name: &str,
    ) -> Result<(), Rejection> {
        self.state.lock().await.validate(token, room_name)
    }

    /// Binds `address` to `token`. Returns `false` for unknown tokens.
    pub async fn register_address(&self, token: &str, address: SocketAddr) -> bool {
        let mut state = self.state.lock().await;
        let Some(record) = state.tokens.get_mut(token) else {
            return false;
        };
        record.address = Some(address.into());
        self.persist(&state).await;
        true
    }

    /// Removes `token`, closing its room if it is the host.
    pub async fn remove_departing_token(&self, token: &str) -> Departure {
        let mut state = self.state.lock().await;
        let departure = state.remove(token);
        if departure != Departure::Unknown {
            self.persist(&state).await;
        }
        departure
    }

    /// Like [`RoomStore::remove_departing_token`], but only if the token was
    /// issued for `room_name`. A token claiming a foreign room is left alone.
    pub async fn leave_room(&self, room_name: &str, token: &str) -> Departure {
        let mut state = self.state.lock().await;
        match state.tokens.get(token) {
            Some(record) if record.room_name == room_name => {}
            Some(record) => {
                warn!(
                    token = short(token),
                    claimed = room_name,
                    actual = %record.room_name,
                    "leave for a foreign room ignored"
                );
                return Departure::Unknown;
            }
            None => {
                debug!(token = short(token), "leave for unknown token ignored");
                return Departure::Unknown;
            }
        }

        let departure = state.remove(token);
        self.persist(&state).await;
        departure
    }

    /// Validates the sender and collects every other member it should reach.
    pub async fn relay_targets(
        &self,
        room_name: &str,
        token: &str,
    ) -> Result<RelayTargets, Rejection> {
        let state = self.state.lock().await;
        state.validate(token, room_name)?;

        let sender = state
            .tokens
            .get(token)
            .map(|record| record.username.clone())
            .ok_or(Rejection::UnknownToken)?;
        let room = state.rooms.get(room_name).ok_or(Rejection::UnknownRoom)?;

        let mut recipients = Vec::new();
        let mut unregistered = 0;
        for member in room.members.iter().filter(|member| *member != token) {
            match state.tokens.get(member).and_then(|record| {
                record
                    .address
                    .clone()
                    .map(|address| (record.username.clone(), address))
            }) {
                Some(target) => recipients.push(target),
                None => unregistered += 1,
            }
        }

        Ok(RelayTargets {
            sender,
            recipients,
            unregistered,
        })
    }

    pub async fn room(&self, room_name: &str) -> Option<Room> {
        self.state.lock().await.rooms.get(room_name).cloned()
    }

    pub async fn token(&self, token: &str) -> Option<TokenRecord> {
        self.state.lock().await.tokens.get(token).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.state.lock().await.rooms.len()
    }

    pub async fn token_count(&self) -> usize {
        self.state.lock().await.tokens.len()
    }

    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().await;
        Snapshot::capture(&state.rooms, &state.tokens)
    }

    /// Writes the snapshot on the blocking pool. Callers still hold the state
    /// lock, so saves land in mutation order.
    async fn persist(&self, state: &StoreState) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let persistence = Arc::clone(persistence);
        let snapshot = Snapshot::capture(&state.rooms, &state.tokens);
        match tokio::task::spawn_blocking(move || persistence.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => warn!(%error, "failed to save room snapshot"),
            Err(error) => warn!(%error, "room snapshot task failed"),
        }
    }
}

/// Shortens a token for log lines.
pub(crate) fn short(token: &str) -> &str {
    let end = token
        .char_indices()
        .nth(TOKEN_PREFIX.len() + 8)
        .map_or(token.len(), |(index, _)| index);
    &token[..end]
}
