//! Blueprint data model.
//!
//! A blueprint is an author-owned, named sequence of points. Point order is
//! stroke order and is preserved through every transport and through storage.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A pixel coordinate on the drawing surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: u32,
    pub y: u32,
}

impl Point {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Dimensions of the drawing surface that bound local points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Surface {
    pub width: u32,
    pub height: u32,
}

impl Surface {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether the point lies on the surface.
    pub fn contains(&self, point: Point) -> bool {
        point.x < self.width && point.y < self.height
    }
}

impl Default for Surface {
    fn default() -> Self {
        Self::new(600, 400)
    }
}

/// Identity of a blueprint: the (author, name) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlueprintKey {
    pub author: String,
    pub name: String,
}

impl BlueprintKey {
    pub fn new(author: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            author: author.into(),
            name: name.into(),
        }
    }

    /// The collaboration channel shared by every peer editing this blueprint.
    pub fn channel(&self) -> ChannelId {
        ChannelId(format!("blueprints.{}.{}", self.author, self.name))
    }
}

impl fmt::Display for BlueprintKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.author, self.name)
    }
}

/// Logical collaboration channel, `blueprints.<author>.<name>`.
///
/// Both transports address a blueprint with the same identifier: STOMP
/// prefixes it with `/topic/`, Socket.IO uses it verbatim as a room name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// STOMP topic destination for this channel.
    pub fn topic(&self) -> String {
        format!("/topic/{}", self.0)
    }

    /// Recover a channel id from a STOMP topic destination.
    pub fn from_topic(destination: &str) -> Option<Self> {
        destination
            .strip_prefix("/topic/")
            .filter(|rest| !rest.is_empty())
            .map(|rest| Self(rest.to_string()))
    }
}

impl From<&str> for ChannelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A stored blueprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blueprint {
    pub author: String,
    pub name: String,
    #[serde(default)]
    pub points: Vec<Point>,
}

impl Blueprint {
    pub fn new(key: &BlueprintKey, points: Vec<Point>) -> Self {
        Self {
            author: key.author.clone(),
            name: key.name.clone(),
            points,
        }
    }

    pub fn key(&self) -> BlueprintKey {
        BlueprintKey::new(self.author.clone(), self.name.clone())
    }
}

/// All blueprints of one author, as returned by the list endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorBlueprints {
    #[serde(default)]
    pub blueprints: Vec<Blueprint>,
    #[serde(rename = "totalPoints", default)]
    pub total_points: u64,
}
