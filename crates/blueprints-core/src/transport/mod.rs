//! Real-time transports.
//!
//! Both adapters satisfy the same [`Transport`] contract so the collaboration
//! manager can swap them at runtime. Each adapter runs its socket on a
//! background thread; connection events are drained with
//! [`Transport::poll_events`] on the owning thread, while inbound updates are
//! handed to the callback registered in [`Transport::join_channel`].

mod link;
pub mod socketio;
pub mod stomp;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use url::Url;

use crate::config::SyncConfig;
use crate::message::{PointPublish, UpdateMessage};
use crate::model::ChannelId;

pub use socketio::SocketIoTransport;
pub use stomp::StompTransport;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error("Not connected")]
    NotConnected,
    #[error("Send failed: {0}")]
    Send(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Which wire protocol carries live updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Topic/subscribe messaging (STOMP).
    Stomp,
    /// Room/event emission (Socket.IO).
    SocketIo,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Stomp => f.write_str("stomp"),
            TransportKind::SocketIo => f.write_str("socketio"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stomp" => Ok(TransportKind::Stomp),
            "socketio" | "socket.io" | "io" => Ok(TransportKind::SocketIo),
            other => Err(TransportError::Protocol(format!("unknown transport `{other}`"))),
        }
    }
}

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Lifecycle events reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The session is usable; channels may be joined.
    Connected,
    /// The link dropped. Adapters with reconnect will try again.
    Disconnected { reason: String },
    Error { message: String },
}

/// Receives live updates for a joined channel.
///
/// Adapters invoke it from their worker thread.
pub type UpdateCallback = Box<dyn FnMut(UpdateMessage) + Send>;

/// Handle to a joined channel.
///
/// Calling [`Subscription::unsubscribe`], or dropping the handle, stops
/// delivery and releases the channel-level resource.
pub struct Subscription {
    channel: ChannelId,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(channel: ChannelId, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            channel,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            log::debug!("Leaving channel {}", self.channel);
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

/// The capability set every real-time transport provides.
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    /// Start connecting. Idempotent. Readiness is signalled later by
    /// [`TransportEvent::Connected`], never by this call returning.
    fn connect(&mut self) -> Result<(), TransportError>;

    /// Tear down the connection and every subscription. Safe to call when
    /// never connected.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Begin receiving updates for `channel`.
    fn join_channel(
        &mut self,
        channel: &ChannelId,
        on_update: UpdateCallback,
    ) -> Result<Subscription, TransportError>;

    /// Best-effort, at-most-once publication of a new point.
    fn publish_point(
        &mut self,
        channel: &ChannelId,
        payload: &PointPublish,
    ) -> Result<(), TransportError>;

    /// Drain pending lifecycle events (non-blocking).
    fn poll_events(&mut self) -> Vec<TransportEvent>;
}

/// Creates transports by kind.
pub trait TransportFactory {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport>;
}

/// Factory for the real network adapters.
pub struct NetworkTransports {
    config: SyncConfig,
}

impl NetworkTransports {
    pub fn new(config: SyncConfig) -> Self {
        Self { config }
    }
}

impl TransportFactory for NetworkTransports {
    fn create(&self, kind: TransportKind) -> Box<dyn Transport> {
        match kind {
            TransportKind::Stomp => Box::new(StompTransport::new(self.config.stomp.clone())),
            TransportKind::SocketIo => {
                Box::new(SocketIoTransport::new(self.config.socketio.clone()))
            }
        }
    }
}

/// Build a WebSocket URL from an HTTP(S) or WS(S) base and a path.
pub(crate) fn websocket_url(base: &str, path: &str) -> Result<Url, TransportError> {
    let mut url = Url::parse(base.trim_end_matches('/'))
        .map_err(|e| TransportError::InvalidUrl(format!("{base}: {e}")))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme `{other}`"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| TransportError::InvalidUrl(format!("cannot use scheme {scheme}")))?;

    let (path, query) = match path.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path, None),
    };
    let joined = format!(
        "{}/{}",
        url.path().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    url.set_path(&joined);
    url.set_query(query);
    Ok(url)
}
