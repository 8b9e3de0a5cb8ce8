use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpStream, UdpSocket},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    envelope::{Envelope, LEAVE, MAX_DATAGRAM_SIZE, Notice, REGISTER},
    error::{HandshakeError, SessionError},
    handshake::{self, Operation},
};

/// Connects to the handshake server, performs one exchange and disconnects.
/// Returns `None` when the server refused the request.
pub async fn request_token(
    server: SocketAddr,
    operation: Operation,
    room_name: &str,
    username: &str,
) -> Result<Option<String>, HandshakeError> {
    let mut stream = TcpStream::connect(server).await?;
    let result = handshake::request(&mut stream, operation, room_name, username).await;
    if let Err(err) = stream.shutdown().await {
        debug!(error = ?err, "failed to shut down handshake stream");
    }
    result
}

/// A member's view of the relay channel for one room.
pub struct ChatSession {
    socket: UdpSocket,
    server: SocketAddr,
    room_name: String,
    token: String,
}

impl ChatSession {
    /// Binds an ephemeral local socket for talking to the relay at `server`.
    pub async fn connect(
        server: SocketAddr,
        room_name: impl Into<String>,
        token: impl Into<String>,
    ) -> Result<Self, SessionError> {
        let local: SocketAddr = match server {
            SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
            SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(local).await?;
        Ok(Self {
            socket,
            server,
            room_name: room_name.into(),
            token: token.into(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn room_name(&self) -> &str {
        &self.room_name
    }

    /// Asks the relay to deliver this room's traffic to our socket.
    pub async fn register(&self) -> Result<(), SessionError> {
        self.send_body(REGISTER).await
    }

    /// Sends a chat message. Messages that would not fit in one datagram are
    /// refused here, before anything is sent.
    pub async fn send(&self, body: &str) -> Result<(), SessionError> {
        self.send_body(body).await
    }

    /// Tells the relay we are gone. A host leaving closes the room.
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.send_body(LEAVE).await
    }

    /// Waits for the next notice from the relay, skipping anything that does
    /// not decode.
    pub async fn recv(&self) -> Result<Notice, SessionError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match Notice::decode(&buf[..len]) {
                Ok(notice) => return Ok(notice),
                Err(err) => debug!(%from, error = %err, "ignoring malformed datagram"),
            }
        }
    }

    async fn send_body(&self, body: &str) -> Result<(), SessionError> {
        let datagram = Envelope::new(self.room_name.as_str(), self.token.as_str(), body).encode()?;
        self.socket.send_to(&datagram, self.server).await?;
        Ok(())
    }
}

/// Runs the interactive chat: handshake, register, then multiplex stdin and
/// relay traffic until the user quits or the room closes.
pub async fn run(args: ClientArgs, operation: Operation) -> Result<()> {
    let handshake_addr = args.handshake_addr();
    let token = request_token(handshake_addr, operation, &args.room, &args.username)
        .await
        .with_context(|| format!("handshake with {handshake_addr} failed"))?;

    let Some(token) = token else {
        let reason = match operation {
            Operation::CreateRoom => format!("room '{}' already exists", args.room),
            Operation::JoinRoom => format!("room '{}' does not exist", args.room),
        };
        write_stderr(&format!("!!! {reason}")).await?;
        return Ok(());
    };
    info!(room = %args.room, "token obtained");

    let session = ChatSession::connect(args.relay_addr(), args.room.as_str(), token).await?;
    session.register().await?;
    write_stdout(&format!(
        "*** {} room '{}' as {}",
        match operation {
            Operation::CreateRoom => "created",
            Operation::JoinRoom => "joined",
        },
        args.room,
        args.username
    ))
    .await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    let room_closed = run_client_loop(&session, &mut stdin, &mut input).await?;
    if !room_closed {
        if let Err(err) = session.leave().await {
            warn!(error = %err, "failed to send leave notice");
        }
    }

    Ok(())
}

/// Returns `true` when the loop ended because the host closed the room.
async fn run_client_loop(
    session: &ChatSession,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<bool> {
    loop {
        select! {
            notice = session.recv() => {
                if handle_notice(notice, session.room_name()).await? {
                    return Ok(true);
                }
            }
            bytes_read = stdin.read_line(input) => {
                let keep_going = handle_stdin_input(bytes_read, input, session).await?;
                input.clear();
                if !keep_going {
                    return Ok(false);
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                handle_ctrl_c(ctrl_c);
                return Ok(false);
            }
        }
    }
}

async fn handle_notice(notice: Result<Notice, SessionError>, room_name: &str) -> Result<bool> {
    match notice? {
        Notice::Chat(relayed) => {
            write_stdout(&format!("<{}> {}", relayed.sender, relayed.body)).await?;
            Ok(false)
        }
        Notice::RoomClosed => {
            write_stdout(&format!("*** the host closed room '{room_name}'")).await?;
            Ok(true)
        }
    }
}

async fn handle_stdin_input(
    bytes_read: io::Result<usize>,
    input: &str,
    session: &ChatSession,
) -> Result<bool> {
    let bytes_read = bytes_read?;
    if bytes_read == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }

    if is_quit_command(text) {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    match session.send(text).await {
        Ok(()) => {}
        Err(SessionError::Envelope(err)) => write_stderr(&format!("!!! {err}")).await?,
        Err(err) => return Err(err.into()),
    }
    Ok(true)
}

fn is_quit_command(text: &str) -> bool {
    ["/quit", "quit", "exit", "q"]
        .iter()
        .any(|word| text.trim().eq_ignore_ascii_case(word))
}

fn handle_ctrl_c(result: io::Result<()>) {
    if let Err(error) = result {
        warn!(?error, "ctrl-c handler failed");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
