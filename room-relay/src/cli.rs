use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    time::Duration,
};

use clap::{Args, Parser, Subcommand};

use crate::snapshot::DEFAULT_SNAPSHOT_FILE;

pub const DEFAULT_HANDSHAKE_PORT: u16 = 9090;
pub const DEFAULT_RELAY_PORT: u16 = 9091;
const DEFAULT_HOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the handshake server and the message relay.
    Server(ServerArgs),
    /// Create a room and chat in it as the host.
    Create(ClientArgs),
    /// Join an existing room and chat in it.
    Join(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address both listeners bind to.
    #[arg(long, default_value_t = DEFAULT_HOST)]
    pub host: IpAddr,

    /// TCP port for the create/join handshake. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_PORT)]
    pub handshake_port: u16,

    /// UDP port for the message relay. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_RELAY_PORT)]
    pub relay_port: u16,

    /// File the room store is saved to after every change and loaded from
    /// at startup.
    #[arg(long, default_value = DEFAULT_SNAPSHOT_FILE, conflicts_with = "no_snapshot")]
    pub snapshot: PathBuf,

    /// Keep the room store in memory only.
    #[arg(long)]
    pub no_snapshot: bool,

    /// Close handshake connections that send nothing for this many seconds.
    /// Waits indefinitely when unset.
    #[arg(long, value_name = "SECS")]
    pub handshake_timeout: Option<u64>,
}

impl ServerArgs {
    pub fn handshake_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.handshake_port)
    }

    pub fn relay_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.relay_port)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.handshake_timeout.map(Duration::from_secs)
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Room to create or join.
    #[arg(long, value_parser = non_blank)]
    pub room: String,

    /// Name shown to the other members.
    #[arg(long, value_parser = non_blank)]
    pub username: String,

    /// Address of the server.
    #[arg(long, default_value_t = DEFAULT_HOST)]
    pub server: IpAddr,

    #[arg(long, default_value_t = DEFAULT_HANDSHAKE_PORT)]
    pub handshake_port: u16,

    #[arg(long, default_value_t = DEFAULT_RELAY_PORT)]
    pub relay_port: u16,
}

impl ClientArgs {
    pub fn handshake_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.handshake_port)
    }

    pub fn relay_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server, self.relay_port)
    }
}

fn non_blank(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("must not be empty or only whitespace".to_string());
    }
    Ok(trimmed.to_string())
}
