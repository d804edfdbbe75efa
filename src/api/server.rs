use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use super::handlers::{
    add_peer, count, exists, health, home, info, insert, remove, remove_peer, AppState,
};

/// Build the application router
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Liveness
        .route("/", get(home))
        .route("/health", get(health))
        // Membership operations
        .route("/v1/insert", post(insert))
        .route("/v1/exists", get(exists))
        .route("/v1/remove", post(remove))
        .route("/v1/count", get(count))
        // Cluster management
        .route("/v1/add_peer", post(add_peer))
        .route("/v1/remove_peer", post(remove_peer))
        .route("/v1/info", get(info))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server until ctrl-c, then stop the raft worker.
pub async fn run_server(
    port: u16,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = build_router(Arc::clone(&state));

    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;
    tracing::info!("Starting quotient server on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    tracing::info!("quotient server stopped");
    Ok(())
}

async fn shutdown_signal(state: Arc<AppState>) {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");

    tracing::info!("Shutdown signal received, stopping raft worker...");
    state.raft.shutdown();
}
