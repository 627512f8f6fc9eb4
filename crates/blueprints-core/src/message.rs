//! Live update contract shared by both transports.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::{BlueprintKey, Point};

/// An inbound update could not be turned into an [`UpdateMessage`].
#[derive(Debug, Error)]
pub enum MalformedUpdate {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("update carries neither `points` nor `point`")]
    Empty,
}

/// Payload of a live update as it travels on the wire.
#[derive(Debug, Deserialize)]
struct WireUpdate {
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    points: Option<Vec<Point>>,
    #[serde(default)]
    point: Option<Point>,
}

/// What a live update asks the receiver to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    /// Replace the local sequence with this one.
    Replace(Vec<Point>),
    /// Append a single point.
    Append(Point),
}

/// A live delta delivered by the active transport.
///
/// `author` and `name` are optional because the room-based transport only
/// guarantees the points themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateMessage {
    pub author: Option<String>,
    pub name: Option<String>,
    pub kind: UpdateKind,
}

impl UpdateMessage {
    pub fn replace(key: &BlueprintKey, points: Vec<Point>) -> Self {
        Self {
            author: Some(key.author.clone()),
            name: Some(key.name.clone()),
            kind: UpdateKind::Replace(points),
        }
    }

    pub fn append(key: &BlueprintKey, point: Point) -> Self {
        Self {
            author: Some(key.author.clone()),
            name: Some(key.name.clone()),
            kind: UpdateKind::Append(point),
        }
    }

    /// Parse a JSON text frame.
    pub fn from_json(text: &str) -> Result<Self, MalformedUpdate> {
        let wire: WireUpdate = serde_json::from_str(text)?;
        Self::from_wire(wire)
    }

    /// Convert an already structured payload.
    pub fn from_value(value: Value) -> Result<Self, MalformedUpdate> {
        let wire: WireUpdate = serde_json::from_value(value)?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: WireUpdate) -> Result<Self, MalformedUpdate> {
        let kind = match (wire.points, wire.point) {
            (Some(points), _) => UpdateKind::Replace(points),
            (None, Some(point)) => UpdateKind::Append(point),
            (None, None) => return Err(MalformedUpdate::Empty),
        };
        Ok(Self {
            author: wire.author,
            name: wire.name,
            kind,
        })
    }

    /// Whether the update addresses the given blueprint. Missing fields match.
    pub fn addresses(&self, key: &BlueprintKey) -> bool {
        self.author.as_deref().is_none_or(|a| a == key.author)
            && self.name.as_deref().is_none_or(|n| n == key.name)
    }
}

/// A freshly drawn point as published to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PointPublish {
    pub author: String,
    pub name: String,
    pub point: Point,
}

impl PointPublish {
    pub fn new(key: &BlueprintKey, point: Point) -> Self {
        Self {
            author: key.author.clone(),
            name: key.name.clone(),
            point,
        }
    }

    pub fn key(&self) -> BlueprintKey {
        BlueprintKey::new(self.author.clone(), self.name.clone())
    }
}
