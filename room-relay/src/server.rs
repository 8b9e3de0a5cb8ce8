use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, UdpSocket},
    select,
    sync::watch,
};
use tracing::{debug, info, warn};

use crate::{
    handshake::{self, Operation, Outcome},
    relay::RelayEngine,
    store::{RoomStore, short},
};

/// Handshake acceptor plus relay loop, sharing one store.
pub struct Server {
    listener: TcpListener,
    relay: RelayEngine,
    store: Arc<RoomStore>,
    read_timeout: Option<Duration>,
}

impl Server {
    pub fn new(listener: TcpListener, socket: UdpSocket, store: Arc<RoomStore>) -> Self {
        Self {
            listener,
            relay: RelayEngine::new(socket, Arc::clone(&store)),
            store,
            read_timeout: None,
        }
    }

    pub async fn bind(
        handshake_addr: SocketAddr,
        relay_addr: SocketAddr,
        store: Arc<RoomStore>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(handshake_addr)
            .await
            .with_context(|| format!("failed to bind handshake listener on {handshake_addr}"))?;
        let socket = UdpSocket::bind(relay_addr)
            .await
            .with_context(|| format!("failed to bind relay socket on {relay_addr}"))?;
        Ok(Self::new(listener, socket, store))
    }

    /// Bounds how long a handshake connection may stay silent before its
    /// request arrives.
    pub fn with_read_timeout(mut self, read_timeout: Option<Duration>) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn handshake_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn relay_addr(&self) -> std::io::Result<SocketAddr> {
        self.relay.local_addr()
    }

    pub fn store(&self) -> Arc<RoomStore> {
        Arc::clone(&self.store)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            relay,
            store,
            read_timeout,
        } = self;
        let (stop_tx, stop_rx) = watch::channel(false);

        let relay_task = tokio::spawn(relay.run_until(stopped(stop_rx.clone())));
        let accept_task = tokio::spawn(accept_loop(listener, store, read_timeout, stop_rx));

        shutdown.await;
        info!("server shutting down");
        let _ = stop_tx.send(true);

        accept_task.await.context("handshake acceptor panicked")?;
        relay_task.await.context("relay loop panicked")??;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn stopped(mut stop: watch::Receiver<bool>) {
    // A dropped sender also means stop.
    let _ = stop.wait_for(|stop| *stop).await;
}

async fn accept_loop(
    listener: TcpListener,
    store: Arc<RoomStore>,
    read_timeout: Option<Duration>,
    stop: watch::Receiver<bool>,
) {
    let shutdown = stopped(stop);
    tokio::pin!(shutdown);

    loop {
        select! {
            _ = &mut shutdown => break,
            accept_result = listener.accept() => {
                handle_accept_result(accept_result, &store, read_timeout);
            }
        }
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    store: &Arc<RoomStore>,
    read_timeout: Option<Duration>,
) {
    match result {
        Ok((stream, peer)) => spawn_handshake(stream, peer, store, read_timeout),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_handshake(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: &Arc<RoomStore>,
    read_timeout: Option<Duration>,
) {
    let store = Arc::clone(store);
    tokio::spawn(async move {
        debug!(%peer, "handshake connection opened");
        match handshake::serve(&mut stream, &store, read_timeout).await {
            Ok(outcome) => log_outcome(peer, &outcome),
            Err(err) => warn!(%peer, error = %err, "handshake aborted"),
        }
        // One request per connection, whatever the result.
        if let Err(err) = stream.shutdown().await {
            debug!(%peer, error = ?err, "failed to shut down handshake stream");
        }
    });
}

fn log_outcome(peer: SocketAddr, outcome: &Outcome) {
    let action = match outcome.operation {
        Operation::CreateRoom => "create",
        Operation::JoinRoom => "join",
    };
    match &outcome.token {
        Some(token) => info!(
            %peer,
            action,
            room = %outcome.room_name,
            username = %outcome.username,
            token = short(token),
            "handshake granted"
        ),
        None => info!(
            %peer,
            action,
            room = %outcome.room_name,
            username = %outcome.username,
            "handshake refused"
        ),
    }
}
