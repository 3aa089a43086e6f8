pub mod a2a;
pub mod discovery;
pub mod runtime;
pub mod web;

use std::net::{Ipv4Addr, SocketAddr};

use axum::Router;
use tokio::net::TcpListener;

use crate::error::ServerError;

pub use a2a::{AgentCard, build_a2a_app, build_a2a_app_with_url};
pub use discovery::{DiscoveredAgent, discover_agents};
pub use runtime::{AgentRuntime, Session};
pub use web::build_web_app;

/// Binds `0.0.0.0:port` and serves `router` until Ctrl-C.
pub async fn serve(router: Router, port: u16) -> Result<(), ServerError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}
