//! Thin driver: bind a TCP listener and serve WebSocket echo connections.

use std::net::SocketAddr;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wsframe::{Config, Server, DEFAULT_ARENA_CAPACITY, DEFAULT_WRITE_BUFFER_SIZE};

#[derive(Debug, Parser)]
#[command(name = "wsframe-server", about = "WebSocket echo server", version)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:3000")]
    listen: SocketAddr,

    /// Payload arena capacity per connection, in bytes
    #[arg(long, default_value_t = DEFAULT_ARENA_CAPACITY)]
    arena_capacity: usize,

    /// Writer buffer size per connection, in bytes
    #[arg(long, default_value_t = DEFAULT_WRITE_BUFFER_SIZE)]
    writer_buffer_size: usize,
}

#[tokio::main]
async fn main() -> wsframe::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = Config::builder()
        .arena_capacity(args.arena_capacity)
        .writer_buffer_size(args.writer_buffer_size)
        .build();

    let listener = TcpListener::bind(args.listen).await?;
    info!(addr = %args.listen, "listening");

    Server::new(config).serve(listener).await
}
