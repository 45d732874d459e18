//! Chat server binary
//!
//! Usage:
//!   chatline                              # listen on 0.0.0.0:15000
//!   chatline --bind-addr 127.0.0.1:9000   # listen elsewhere
//!   chatline --no-queue                   # run without the durable queue
//!   RUST_LOG=chatline=debug chatline      # verbose logging

use chatline::{ChatServer, ServerConfig};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();
    init_tracing(config.json_logs);

    info!("chatline v{} starting", env!("CARGO_PKG_VERSION"));

    let server = ChatServer::bind(config).await?;
    info!("listening on {}", server.local_addr());

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
    }

    server.shutdown().await;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chatline=info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
