//! cowrite-server — hosts collaborative script sessions over WebSocket.
//!
//! Usage: `cowrite-server [BIND_ADDR]`. Without an argument the address comes
//! from `COWRITE_BIND`, falling back to `127.0.0.1:9090`. Log verbosity is
//! controlled by `RUST_LOG` (default `info`).

use log::{error, info};

use cowrite_collab::server::{ServerConfig, SyncServer};

fn bind_addr() -> String {
    std::env::args()
        .nth(1)
        .or_else(|| std::env::var("COWRITE_BIND").ok())
        .unwrap_or_else(|| ServerConfig::default().bind_addr)
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig {
        bind_addr: bind_addr(),
        ..ServerConfig::default()
    };
    info!("Starting cowrite server on {}...", config.bind_addr);

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        error!("Server stopped: {e}");
        std::process::exit(1);
    }
}
