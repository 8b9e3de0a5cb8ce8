//! Datagram relay: registration, fan-out and room teardown.
//!
//! The engine processes one datagram at a time. Authorization failures are
//! dropped without a reply since the channel has no error path back to the
//! sender, and a failed send to one member never stops delivery to the rest.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{net::UdpSocket, select};
use tracing::{debug, info, warn};

use crate::{
    envelope::{MAX_DATAGRAM_SIZE, ROOM_CLOSED, Relayed, Request},
    store::{Departure, RoomStore, short},
};

pub struct RelayEngine {
    socket: UdpSocket,
    store: Arc<RoomStore>,
}

impl RelayEngine {
    pub fn new(socket: UdpSocket, store: Arc<RoomStore>) -> Self {
        Self { socket, store }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("relay shutting down");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, from)) => self.handle_datagram(&buf[..len], from).await,
                    // ICMP errors from earlier sends surface here on some
                    // platforms; they concern one peer, not the loop.
                    Err(err) => warn!(error = ?err, "failed to receive datagram"),
                },
            }
        }

        Ok(())
    }

    /// Decodes one datagram and dispatches it.
    pub async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        if datagram.is_empty() {
            return;
        }
        debug!(%from, size = datagram.len(), "datagram received");

        match Request::decode(datagram) {
            Ok(Request::Register { token, .. }) => {
                self.register(&token, from).await;
            }
            Ok(Request::Leave { room_name, token }) => {
                self.leave(&room_name, &token).await;
            }
            Ok(Request::Chat(envelope)) => {
                self.relay(&envelope.room_name, &envelope.token, &envelope.body)
                    .await;
            }
            Err(err) => debug!(%from, error = %err, "dropping malformed datagram"),
        }
    }

    /// Binds the sender's observed address to `token`. Unknown tokens are
    /// dropped.
    pub async fn register(&self, token: &str, address: SocketAddr) -> bool {
        let registered = self.store.register_address(token, address).await;
        if registered {
            info!(token = short(token), %address, "address registered");
        } else {
            warn!(token = short(token), %address, "registration for unknown token dropped");
        }
        registered
    }

    /// Removes `token` from `room_name`. A departing host closes the room:
    /// every other registered member gets a raw close notice.
    pub async fn leave(&self, room_name: &str, token: &str) -> Departure {
        let departure = self.store.leave_room(room_name, token).await;
        if let Departure::RoomClosed {
            room_name, members, ..
        } = &departure
        {
            let mut notified = 0;
            for member in members {
                let Some(address) = member.address.as_ref().and_then(|addr| addr.resolve()) else {
                    warn!(room = %room_name, username = %member.username, "no address registered, skipping close notice");
                    continue;
                };
                match self.socket.send_to(ROOM_CLOSED.as_bytes(), address).await {
                    Ok(_) => notified += 1,
                    Err(err) => {
                        warn!(room = %room_name, username = %member.username, %address, error = ?err, "failed to send close notice")
                    }
                }
            }
            info!(room = %room_name, notified, "room closed");
        }
        departure
    }

    /// Forwards `body` to every other registered member of `room_name`.
    /// Returns how many members it was sent to.
    pub async fn relay(&self, room_name: &str, token: &str, body: &str) -> usize {
        let targets = match self.store.relay_targets(room_name, token).await {
            Ok(targets) => targets,
            Err(reason) => {
                debug!(room = room_name, token = short(token), %reason, "relay rejected");
                return 0;
            }
        };

        let payload = match Relayed::new(targets.sender.as_str(), body).encode() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(room = room_name, sender = %targets.sender, error = %err, "relayed message does not fit a datagram");
                return 0;
            }
        };

        let mut delivered = 0;
        for (username, address) in &targets.recipients {
            let Some(address) = address.resolve() else {
                warn!(room = room_name, %username, ?address, "unusable address, skipping");
                continue;
            };
            match self.socket.send_to(&payload, address).await {
                Ok(_) => delivered += 1,
                Err(err) => warn!(room = room_name, %username, %address, error = ?err, "failed to relay message"),
            }
        }

        debug!(
            room = room_name,
            sender = %targets.sender,
            delivered,
            unregistered = targets.unregistered,
            "message relayed"
        );
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeMap, time::Duration};

    use time::OffsetDateTime;
    use tokio::time::timeout;

    use super::*;
    use crate::{
        envelope::{Envelope, LEAVE, Notice, REGISTER},
        snapshot::Snapshot,
        store::{PeerAddr, Room, TokenRecord},
    };

    async fn engine() -> RelayEngine {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        RelayEngine::new(socket, Arc::new(RoomStore::new()))
    }

    /// One room, "alpha", whose first member is the host.
    async fn engine_with_members(members: &[(&str, &str, Option<PeerAddr>)]) -> RelayEngine {
        let mut tokens = BTreeMap::new();
        for (index, (token, username, address)) in members.iter().enumerate() {
            tokens.insert(
                token.to_string(),
                TokenRecord {
                    username: username.to_string(),
                    room_name: "alpha".to_string(),
                    is_host: index == 0,
                    address: address.clone(),
                },
            );
        }
        let room = Room {
            host_token: members[0].0.to_string(),
            members: members.iter().map(|(token, ..)| token.to_string()).collect(),
            created_at: OffsetDateTime::now_utc(),
        };
        let snapshot = Snapshot {
            rooms: BTreeMap::from([("alpha".to_string(), room)]),
            tokens,
            saved_at: None,
        };

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        RelayEngine::new(socket, Arc::new(RoomStore::from_snapshot(snapshot)))
    }

    async fn peer() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    async fn recv_notice(socket: &UdpSocket) -> Option<Notice> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let (len, _) = timeout(Duration::from_millis(200), socket.recv_from(&mut buf))
            .await
            .ok()?
            .ok()?;
        Some(Notice::decode(&buf[..len]).expect("decodable notice"))
    }

    #[tokio::test]
    async fn register_datagram_binds_observed_address() {
        let engine = engine().await;
        let token = engine.store.create_room("alpha", "alice", None).await.unwrap();
        let from: SocketAddr = "127.0.0.1:45000".parse().unwrap();

        let datagram = Envelope::new("alpha", token.as_str(), REGISTER).encode().unwrap();
        engine.handle_datagram(&datagram, from).await;

        let record = engine.store.token(&token).await.unwrap();
        assert_eq!(record.address.and_then(|a| a.resolve()), Some(from));
    }

    #[tokio::test]
    async fn relay_skips_sender_and_unregistered_members() {
        let engine = engine().await;
        let store = &engine.store;
        let alice = store.create_room("alpha", "alice", None).await.unwrap();
        let bob = store.join_room("alpha", "bob", None).await.unwrap();
        store.join_room("alpha", "carol", None).await.unwrap();

        let bob_socket = peer().await;
        engine.register(&bob, bob_socket.local_addr().unwrap()).await;

        assert_eq!(engine.relay("alpha", &alice, "hi").await, 1);
        assert_eq!(
            recv_notice(&bob_socket).await,
            Some(Notice::Chat(Relayed::new("alice", "hi")))
        );
    }

    #[tokio::test]
    async fn relay_with_foreign_token_is_dropped() {
        let engine = engine().await;
        let store = &engine.store;
        store.create_room("alpha", "alice", None).await.unwrap();
        let bob = store.join_room("alpha", "bob", None).await.unwrap();
        let mallory = store.create_room("beta", "mallory", None).await.unwrap();

        let bob_socket = peer().await;
        engine.register(&bob, bob_socket.local_addr().unwrap()).await;
        let before = store.snapshot().await;

        assert_eq!(engine.relay("alpha", &mallory, "sneaky").await, 0);
        assert_eq!(recv_notice(&bob_socket).await, None);

        let after = store.snapshot().await;
        assert_eq!(before.rooms, after.rooms);
        assert_eq!(before.tokens, after.tokens);
    }

    #[tokio::test]
    async fn host_leave_notifies_each_other_member_once() {
        let engine = engine().await;
        let store = &engine.store;
        let host = store.create_room("alpha", "alice", None).await.unwrap();
        let a = store.join_room("alpha", "bob", None).await.unwrap();
        let b = store.join_room("alpha", "carol", None).await.unwrap();

        let host_socket = peer().await;
        let a_socket = peer().await;
        let b_socket = peer().await;
        engine.register(&host, host_socket.local_addr().unwrap()).await;
        engine.register(&a, a_socket.local_addr().unwrap()).await;
        engine.register(&b, b_socket.local_addr().unwrap()).await;

        let datagram = Envelope::new("alpha", host.as_str(), LEAVE).encode().unwrap();
        engine
            .handle_datagram(&datagram, host_socket.local_addr().unwrap())
            .await;

        for socket in [&a_socket, &b_socket] {
            assert_eq!(recv_notice(socket).await, Some(Notice::RoomClosed));
            assert_eq!(recv_notice(socket).await, None);
        }
        assert_eq!(recv_notice(&host_socket).await, None);

        assert!(store.room("alpha").await.is_none());
        for token in [&host, &a, &b] {
            assert!(store.token(token).await.is_none());
        }
    }

    #[tokio::test]
    async fn member_leave_keeps_room_and_is_idempotent() {
        let engine = engine().await;
        let store = &engine.store;
        let host = store.create_room("alpha", "alice", None).await.unwrap();
        let bob = store.join_room("alpha", "bob", None).await.unwrap();

        let host_socket = peer().await;
        engine.register(&host, host_socket.local_addr().unwrap()).await;

        assert!(matches!(
            engine.leave("alpha", &bob).await,
            Departure::Left { .. }
        ));
        assert_eq!(engine.leave("alpha", &bob).await, Departure::Unknown);
        assert_eq!(recv_notice(&host_socket).await, None);

        let room = store.room("alpha").await.unwrap();
        assert_eq!(room.members, vec![host.clone()]);
        assert!(store.token(&host).await.unwrap().is_host);
    }

    #[tokio::test]
    async fn malformed_datagrams_change_nothing() {
        let engine = engine().await;
        engine.store.create_room("alpha", "alice", None).await.unwrap();
        let from: SocketAddr = "127.0.0.1:45001".parse().unwrap();

        engine.handle_datagram(b"\x00\xffjunk", from).await;
        engine.handle_datagram(&[], from).await;

        assert_eq!(engine.store.room_count().await, 1);
        assert_eq!(engine.store.token_count().await, 1);
    }

    #[tokio::test]
    async fn host_leave_skips_unregistered_members() {
        let host_socket = peer().await;
        let carol_socket = peer().await;
        let engine = engine_with_members(&[
            ("token_host", "alice", Some(host_socket.local_addr().unwrap().into())),
            ("token_bob", "bob", None),
            ("token_carol", "carol", Some(carol_socket.local_addr().unwrap().into())),
        ])
        .await;

        let departure = engine.leave("alpha", "token_host").await;
        let Departure::RoomClosed { members, .. } = departure else {
            panic!("host departure should close the room");
        };
        assert_eq!(members.len(), 2);

        assert_eq!(recv_notice(&carol_socket).await, Some(Notice::RoomClosed));
        assert_eq!(recv_notice(&carol_socket).await, None);
        assert_eq!(recv_notice(&host_socket).await, None);
        assert_eq!(engine.store.token_count().await, 0);
    }

    #[tokio::test]
    async fn broken_recipients_do_not_stop_the_fan_out() {
        let carol_socket = peer().await;
        // The relay socket is IPv4, so sending to an IPv6 peer fails.
        let unreachable: SocketAddr = "[::1]:9".parse().unwrap();
        let engine = engine_with_members(&[
            ("token_host", "alice", None),
            ("token_bob", "bob", Some(PeerAddr::Pair("not an ip".into(), 9000))),
            ("token_dave", "dave", Some(unreachable.into())),
            ("token_carol", "carol", Some(carol_socket.local_addr().unwrap().into())),
        ])
        .await;

        assert_eq!(engine.relay("alpha", "token_host", "hi").await, 1);
        assert_eq!(
            recv_notice(&carol_socket).await,
            Some(Notice::Chat(Relayed::new("alice", "hi")))
        );
    }
}
