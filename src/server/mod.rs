//! HTTP surface: submission, status, SSE progress streaming, and query.

mod routes;
mod sse;

pub use routes::router;

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use crate::engine::Engine;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Bind and serve until the task is dropped or the process exits.
pub async fn serve(engine: Arc<Engine>, addr: SocketAddr) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "http server listening");
    axum::serve(listener, router(engine)).await
}
