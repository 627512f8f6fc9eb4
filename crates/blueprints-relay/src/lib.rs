//! Blueprints development relay.
//!
//! Relays freshly drawn points between peers of the same blueprint. Speaks
//! both live protocols of the collaboration client so either adapter can be
//! exercised without the production brokers:
//!
//! - STOMP 1.2 over WebSocket at `/ws-blueprints` (and the SockJS raw
//!   endpoint `/ws-blueprints/websocket`)
//! - Socket.IO v5 / Engine.IO v4 over WebSocket at `/socket.io/`
//!
//! Both endpoints share one [`Hub`](hub::Hub), so peers on different
//! protocols see each other's points. Nothing is stored.

pub mod hub;
pub mod socketio;
pub mod stomp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::hub::Hub;

/// Environment variable overriding the listen address.
pub const ADDR_ENV: &str = "BLUEPRINTS_RELAY_ADDR";

/// Relay settings.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub addr: SocketAddr,
    /// STOMP heart-beat offered in both directions.
    pub heartbeat: Duration,
    /// Engine.IO ping interval.
    pub ping_interval: Duration,
    /// Engine.IO pong grace period.
    pub ping_timeout: Duration,
    /// STOMP destination accepting drawn points.
    pub draw_destination: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], 3030)),
            heartbeat: Duration::from_millis(10_000),
            ping_interval: Duration::from_millis(25_000),
            ping_timeout: Duration::from_millis(20_000),
            draw_destination: "/app/draw".to_string(),
        }
    }
}

impl RelayConfig {
    /// Defaults with the listen address taken from [`ADDR_ENV`] when set.
    pub fn from_env() -> Self {
        Self::with_addr(std::env::var(ADDR_ENV).ok().as_deref())
    }

    fn with_addr(addr: Option<&str>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = addr {
            match raw.parse() {
                Ok(addr) => config.addr = addr,
                Err(e) => warn!("Ignoring {}={}: {}", ADDR_ENV, raw, e),
            }
        }
        config
    }
}

/// Shared application state
pub struct AppState {
    pub hub: Hub,
    pub config: RelayConfig,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        Self {
            hub: Hub::new(),
            config,
        }
    }
}

/// The relay's HTTP surface.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/ws-blueprints", get(stomp::ws_handler))
        .route("/ws-blueprints/websocket", get(stomp::ws_handler))
        .route("/socket.io", get(socketio::ws_handler))
        .route("/socket.io/", get(socketio::ws_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Index page
async fn index() -> &'static str {
    "Blueprints Relay - STOMP at /ws-blueprints, Socket.IO at /socket.io/"
}

/// Health check
async fn health() -> &'static str {
    "ok"
}
