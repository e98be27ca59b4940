//! Citeloom server daemon.
//!
//! Starts the engine with a SQLite metadata store (when configured) and the
//! in-process backends, then serves the HTTP API. Real extractor and model
//! provider integrations plug in through the engine builder; this binary
//! wires the offline stand-ins so the full pipeline is exercisable locally.

use std::net::SocketAddr;
use std::sync::Arc;

use citeloom::config::EngineConfig;
use citeloom::engine::Engine;
use citeloom::server;
use citeloom::stores::SqliteMetaStore;
use citeloom::telemetry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing();
    let config = EngineConfig::from_env();

    let mut builder = Engine::builder(config.clone());
    if let Some(db_name) = &config.sqlite_db_name {
        let url = format!("sqlite://{db_name}");
        info!(%url, "using sqlite metadata store");
        builder = builder.meta(Arc::new(SqliteMetaStore::connect(&url).await?));
    }
    let engine = Arc::new(builder.start().await?);

    let addr: SocketAddr = std::env::var("CITELOOM_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8080".to_string())
        .parse()?;

    let serving = {
        let engine = engine.clone();
        tokio::spawn(async move { server::serve(engine, addr).await })
    };

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    engine.shutdown().await;
    serving.abort();
    Ok(())
}
