use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use room_relay::{
    cli::{Cli, Command, ServerArgs},
    client,
    handshake::Operation,
    server::Server,
    snapshot::JsonFile,
    store::RoomStore,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => run_server(args).await?,
        Command::Create(args) => client::run(args, Operation::CreateRoom).await?,
        Command::Join(args) => client::run(args, Operation::JoinRoom).await?,
    }

    Ok(())
}

async fn run_server(args: ServerArgs) -> Result<()> {
    let store = if args.no_snapshot {
        RoomStore::new()
    } else {
        RoomStore::load(JsonFile::new(&args.snapshot))
    };

    let server = Server::bind(args.handshake_addr(), args.relay_addr(), Arc::new(store))
        .await?
        .with_read_timeout(args.read_timeout());
    info!("handshake listening on {}", server.handshake_addr()?);
    info!("relay listening on {}", server.relay_addr()?);

    if let Err(err) = server.run_until_ctrl_c().await {
        warn!("server exited with error: {err:?}");
        return Err(err);
    }
    Ok(())
}
