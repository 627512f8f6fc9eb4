//! Blueprints Core Library
//!
//! Transport-agnostic synchronization core for collaborative blueprint
//! editing: the live update contract, the STOMP and Socket.IO adapters, the
//! storage client and the collaboration manager that ties them together.

pub mod collaboration;
pub mod config;
pub mod message;
pub mod model;
pub mod snapshot;
pub mod store;
pub mod transport;

pub use collaboration::{CollaborationManager, SessionState, SyncError, SyncEvent};
pub use config::SyncConfig;
pub use message::{MalformedUpdate, PointPublish, UpdateKind, UpdateMessage};
pub use model::{AuthorBlueprints, Blueprint, BlueprintKey, ChannelId, Point, Surface};
pub use snapshot::SnapshotLoader;
pub use store::{BlueprintStore, FetchError, FetchResult, HttpStore, MemoryStore};
pub use transport::{
    ConnectionState, NetworkTransports, SocketIoTransport, StompTransport, Subscription, Transport,
    TransportError, TransportEvent, TransportFactory, TransportKind,
};
