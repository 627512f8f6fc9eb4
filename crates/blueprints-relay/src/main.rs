//! Blueprints relay server binary.

use std::sync::Arc;

use blueprints_relay::{AppState, RelayConfig, app};
use tracing::info;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blueprints_relay=info,tower_http=info".into()),
        )
        .init();

    let config = RelayConfig::from_env();
    let addr = config.addr;
    let state = Arc::new(AppState::new(config));

    info!("Blueprints relay listening on {}", addr);
    info!("STOMP endpoint: ws://{}/ws-blueprints/websocket", addr);
    info!("Socket.IO endpoint: ws://{}/socket.io/?EIO=4&transport=websocket", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
    axum::serve(listener, app(state)).await.unwrap();
}
