use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use room_relay::{
    client::{ChatSession, request_token},
    envelope::{Notice, Relayed},
    handshake::Operation,
    server::Server,
    snapshot::{JsonFile, Persistence},
    store::RoomStore,
};
use tokio::{sync::oneshot, task::JoinHandle, time::timeout};

const RECV_TIMEOUT: Duration = Duration::from_millis(500);
const QUIET_PERIOD: Duration = Duration::from_millis(150);

struct TestServer {
    handshake: SocketAddr,
    relay: SocketAddr,
    store: Arc<RoomStore>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl TestServer {
    async fn start(store: RoomStore) -> Result<Self> {
        let loopback: SocketAddr = "127.0.0.1:0".parse()?;
        let server = Server::bind(loopback, loopback, Arc::new(store)).await?;
        let handshake = server.handshake_addr()?;
        let relay = server.relay_addr()?;
        let store = server.store();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = server.run_until(shutdown).await;
        });

        Ok(Self {
            handshake,
            relay,
            store,
            shutdown,
            task,
        })
    }

    async fn enter(&self, operation: Operation, room: &str, username: &str) -> Result<ChatSession> {
        let token = request_token(self.handshake, operation, room, username)
            .await?
            .expect("handshake should be granted");
        let session = ChatSession::connect(self.relay, room, token).await?;
        session.register().await?;
        Ok(session)
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

async fn next_notice(session: &ChatSession) -> Result<Notice> {
    Ok(timeout(RECV_TIMEOUT, session.recv()).await??)
}

async fn stays_quiet(session: &ChatSession) -> bool {
    timeout(QUIET_PERIOD, session.recv()).await.is_err()
}

/// Registration is fire-and-forget; give the relay a moment to apply it.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn alice_and_bob_chat_through_the_relay() -> Result<()> {
    let server = TestServer::start(RoomStore::new()).await?;

    let alice = server.enter(Operation::CreateRoom, "alpha", "alice").await?;
    let bob = server.enter(Operation::JoinRoom, "alpha", "bob").await?;
    settle().await;

    alice.send("hi").await?;
    assert_eq!(
        next_notice(&bob).await?,
        Notice::Chat(Relayed::new("alice", "hi"))
    );
    assert!(stays_quiet(&alice).await, "sender must not get its own message");

    bob.send("hello alice").await?;
    assert_eq!(
        next_notice(&alice).await?,
        Notice::Chat(Relayed::new("bob", "hello alice"))
    );

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn refused_handshakes_return_no_token() -> Result<()> {
    let server = TestServer::start(RoomStore::new()).await?;

    let missing = request_token(server.handshake, Operation::JoinRoom, "nowhere", "bob").await?;
    assert_eq!(missing, None);

    request_token(server.handshake, Operation::CreateRoom, "alpha", "alice")
        .await?
        .expect("first create");
    let duplicate = request_token(server.handshake, Operation::CreateRoom, "alpha", "eve").await?;
    assert_eq!(duplicate, None);
    assert_eq!(server.store.token_count().await, 1);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn rejoining_by_name_reuses_the_token() -> Result<()> {
    let server = TestServer::start(RoomStore::new()).await?;

    request_token(server.handshake, Operation::CreateRoom, "alpha", "alice").await?;
    let first = request_token(server.handshake, Operation::JoinRoom, "alpha", "bob").await?;
    let second = request_token(server.handshake, Operation::JoinRoom, "alpha", "bob").await?;
    assert!(first.is_some());
    assert_eq!(first, second);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn unregistered_members_receive_nothing() -> Result<()> {
    let server = TestServer::start(RoomStore::new()).await?;

    let alice = server.enter(Operation::CreateRoom, "alpha", "alice").await?;
    let bob = server.enter(Operation::JoinRoom, "alpha", "bob").await?;
    // Carol joins but never registers her socket.
    let carol_token = request_token(server.handshake, Operation::JoinRoom, "alpha", "carol")
        .await?
        .expect("carol joins");
    let carol = ChatSession::connect(server.relay, "alpha", carol_token).await?;
    settle().await;

    alice.send("anyone there?").await?;
    assert_eq!(
        next_notice(&bob).await?,
        Notice::Chat(Relayed::new("alice", "anyone there?"))
    );
    assert!(stays_quiet(&carol).await);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn host_leaving_closes_the_room_for_everyone() -> Result<()> {
    let server = TestServer::start(RoomStore::new()).await?;

    let host = server.enter(Operation::CreateRoom, "alpha", "alice").await?;
    let bob = server.enter(Operation::JoinRoom, "alpha", "bob").await?;
    let carol = server.enter(Operation::JoinRoom, "alpha", "carol").await?;
    settle().await;

    host.leave().await?;
    assert_eq!(next_notice(&bob).await?, Notice::RoomClosed);
    assert_eq!(next_notice(&carol).await?, Notice::RoomClosed);
    assert!(stays_quiet(&bob).await);
    assert!(stays_quiet(&host).await);

    assert_eq!(server.store.room_count().await, 0);
    assert_eq!(server.store.token_count().await, 0);

    // The room name is free again.
    let reopened = request_token(server.handshake, Operation::CreateRoom, "alpha", "bob").await?;
    assert!(reopened.is_some());

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn member_leaving_keeps_the_room_open() -> Result<()> {
    let server = TestServer::start(RoomStore::new()).await?;

    let host = server.enter(Operation::CreateRoom, "alpha", "alice").await?;
    let bob = server.enter(Operation::JoinRoom, "alpha", "bob").await?;
    let carol = server.enter(Operation::JoinRoom, "alpha", "carol").await?;
    settle().await;

    bob.leave().await?;
    settle().await;

    host.send("still here").await?;
    assert_eq!(
        next_notice(&carol).await?,
        Notice::Chat(Relayed::new("alice", "still here"))
    );
    assert!(stays_quiet(&bob).await);

    let room = server.store.room("alpha").await.expect("room survives");
    assert_eq!(room.members.len(), 2);

    server.stop().await;
    Ok(())
}

#[tokio::test]
async fn mutations_are_snapshotted_and_reloaded() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("rooms.json");

    let server = TestServer::start(RoomStore::with_persistence(JsonFile::new(&path))).await?;
    let _alice = server.enter(Operation::CreateRoom, "alpha", "alice").await?;
    let _bob = server.enter(Operation::JoinRoom, "alpha", "bob").await?;
    settle().await;
    let live = server.store.snapshot().await;
    server.stop().await;

    let saved = JsonFile::new(&path).load()?.expect("snapshot written");
    assert_eq!(saved.rooms, live.rooms);
    assert_eq!(saved.tokens, live.tokens);
    assert!(saved.saved_at.is_some());

    let reloaded = RoomStore::load(JsonFile::new(&path));
    assert_eq!(reloaded.room("alpha").await, live.rooms.get("alpha").cloned());
    Ok(())
}
