//! Client configuration.

use std::time::Duration;

use crate::model::Surface;
use crate::transport::TransportKind;

/// Default storage API base.
pub const DEFAULT_API_BASE: &str = "http://localhost:8080";
/// Default Socket.IO server base.
pub const DEFAULT_IO_BASE: &str = "http://localhost:3001";
/// Delay before a dropped transport reconnects.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(2000);
/// Heart-beat interval requested in each direction.
pub const DEFAULT_HEARTBEAT: Duration = Duration::from_millis(10_000);

/// Settings for the STOMP adapter.
#[derive(Debug, Clone)]
pub struct StompConfig {
    pub base_url: String,
    /// SockJS endpoint registered by the broker.
    pub handshake_path: String,
    /// Application destination for freshly drawn points.
    pub draw_destination: String,
    pub reconnect_delay: Duration,
    pub heartbeat_outgoing: Duration,
    pub heartbeat_incoming: Duration,
}

impl Default for StompConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_BASE.to_string(),
            handshake_path: "/ws-blueprints".to_string(),
            draw_destination: "/app/draw".to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            heartbeat_outgoing: DEFAULT_HEARTBEAT,
            heartbeat_incoming: DEFAULT_HEARTBEAT,
        }
    }
}

/// Settings for the Socket.IO adapter.
#[derive(Debug, Clone)]
pub struct SocketIoConfig {
    pub base_url: String,
    pub path: String,
    pub reconnect_delay: Duration,
}

impl Default for SocketIoConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_IO_BASE.to_string(),
            path: "/socket.io/".to_string(),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

/// Everything the collaboration client needs to reach its collaborators.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub api_base: String,
    pub stomp: StompConfig,
    pub socketio: SocketIoConfig,
    pub surface: Surface,
    /// Transport selected when the manager starts.
    pub transport: TransportKind,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            stomp: StompConfig::default(),
            socketio: SocketIoConfig::default(),
            surface: Surface::default(),
            transport: TransportKind::SocketIo,
            request_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Point both the storage API and the STOMP broker at `base`.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        self.stomp.base_url = base.clone();
        self.api_base = base;
        self
    }
}
