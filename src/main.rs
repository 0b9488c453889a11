use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::{Router, routing::get};
use axum_tws::WebSocketUpgrade;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pixel_canvas::constants::{CANVAS_HEIGHT, CANVAS_WIDTH, LISTEN_ADDR, routes};
use pixel_canvas::registry::ClientId;
use pixel_canvas::socket::handle_socket;
use pixel_canvas::state::AppState;

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let client_id = ClientId::new();
    info!(%client_id, "New WebSocket connection attempt");
    ws.on_upgrade(move |socket| handle_socket(socket, state, client_id))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or("info,pixel_canvas=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting pixel canvas server");

    let listener = tokio::net::TcpListener::bind(LISTEN_ADDR)
        .await
        .map_err(|e| {
            error!("Failed to bind to address {}: {}", LISTEN_ADDR, e);
            e
        })
        .with_context(|| format!("binding {}", LISTEN_ADDR))?;

    let app_state = Arc::new(AppState::new(CANVAS_WIDTH, CANVAS_HEIGHT));
    info!("Canvas {}x{} initialized", CANVAS_WIDTH, CANVAS_HEIGHT);

    let app = Router::new()
        .route(routes::ROOT, get(ws_handler))
        .route(routes::WS, get(ws_handler))
        .with_state(app_state);

    info!("Server running at ws://{}", LISTEN_ADDR);

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    warn!("Server shutting down");

    server_result.context("server error")
}
