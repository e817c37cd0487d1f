//! Topichub server binary
//!
//! Reads an optional JSON config path from the first argument, brings the
//! engine up, and serves the HTTP/WebSocket surface until terminated.

use std::sync::Arc;

use topichub::server;
use topichub::{EngineConfig, SyncCoordinator};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            let text = std::fs::read_to_string(&path)?;
            serde_json::from_str(&text)?
        }
        None => EngineConfig::default(),
    };
    let port: u16 = std::env::var("TOPICHUB_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8081);

    let engine = SyncCoordinator::start(&config).await?;

    let shutdown_engine = Arc::clone(&engine);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Shutting down, flushing pending saves");
            shutdown_engine.shutdown().await;
            std::process::exit(0);
        }
    });

    server::serve(engine, port).await;
    Ok(())
}
