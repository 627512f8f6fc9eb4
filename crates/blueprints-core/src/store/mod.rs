//! Storage API client abstraction.
//!
//! Blueprints live in a remote request/response service. The collaboration
//! core only consumes it, through [`BlueprintStore`].

mod http;
mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use crate::model::{AuthorBlueprints, Blueprint, BlueprintKey, Point};

/// Storage errors.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("Blueprint not found: {0}")]
    NotFound(String),
    #[error("Blueprint already exists: {0}")]
    Conflict(String),
    #[error("Request failed: {0}")]
    Request(String),
    #[error("Invalid response body: {0}")]
    Decode(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
}

/// Result type for storage operations.
pub type FetchResult<T> = Result<T, FetchError>;

/// The blueprint storage service.
///
/// Calls block; the collaboration manager runs them on worker threads.
pub trait BlueprintStore: Send + Sync {
    /// All blueprints of an author with their total point count.
    fn list_by_author(&self, author: &str) -> FetchResult<AuthorBlueprints>;

    fn get(&self, key: &BlueprintKey) -> FetchResult<Blueprint>;

    fn create(&self, blueprint: &Blueprint) -> FetchResult<Blueprint>;

    /// Replace the whole point sequence.
    fn replace_points(&self, key: &BlueprintKey, points: &[Point]) -> FetchResult<Blueprint>;

    /// Append one point at the end of the sequence.
    fn append_point(&self, key: &BlueprintKey, point: Point) -> FetchResult<Blueprint>;

    fn delete(&self, key: &BlueprintKey) -> FetchResult<()>;
}

/// Decode a response body that may be wrapped as `{data: …}`.
pub fn decode_envelope<T: DeserializeOwned>(body: &str) -> FetchResult<T> {
    let value: Value =
        serde_json::from_str(body).map_err(|e| FetchError::Decode(e.to_string()))?;
    let inner = match value {
        Value::Object(mut map) if map.get("data").is_some_and(|d| !d.is_null()) => {
            map.remove("data").unwrap_or(Value::Null)
        }
        other => other,
    };
    serde_json::from_value(inner).map_err(|e| FetchError::Decode(e.to_string()))
}
