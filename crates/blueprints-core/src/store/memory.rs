//! In-memory blueprint store.

use super::{BlueprintStore, FetchError, FetchResult};
use crate::model::{AuthorBlueprints, Blueprint, BlueprintKey, Point};
use std::collections::BTreeMap;
use std::sync::RwLock;

/// In-memory store for tests and offline use.
#[derive(Default)]
pub struct MemoryStore {
    blueprints: RwLock<BTreeMap<BlueprintKey, Vec<Point>>>,
}

fn lock_error(e: impl std::fmt::Display) -> FetchError {
    FetchError::Request(format!("Lock error: {}", e))
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with blueprints.
    pub fn with_blueprints(blueprints: impl IntoIterator<Item = Blueprint>) -> Self {
        let map = blueprints
            .into_iter()
            .map(|bp| (bp.key(), bp.points))
            .collect();
        Self {
            blueprints: RwLock::new(map),
        }
    }

    fn update(
        &self,
        key: &BlueprintKey,
        f: impl FnOnce(&mut Vec<Point>),
    ) -> FetchResult<Blueprint> {
        let mut blueprints = self.blueprints.write().map_err(lock_error)?;
        let points = blueprints
            .get_mut(key)
            .ok_or_else(|| FetchError::NotFound(key.to_string()))?;
        f(points);
        Ok(Blueprint::new(key, points.clone()))
    }
}

impl BlueprintStore for MemoryStore {
    fn list_by_author(&self, author: &str) -> FetchResult<AuthorBlueprints> {
        let blueprints = self.blueprints.read().map_err(lock_error)?;
        let owned: Vec<Blueprint> = blueprints
            .iter()
            .filter(|(key, _)| key.author == author)
            .map(|(key, points)| Blueprint::new(key, points.clone()))
            .collect();
        let total_points = owned.iter().map(|bp| bp.points.len() as u64).sum();
        Ok(AuthorBlueprints {
            blueprints: owned,
            total_points,
        })
    }

    fn get(&self, key: &BlueprintKey) -> FetchResult<Blueprint> {
        let blueprints = self.blueprints.read().map_err(lock_error)?;
        blueprints
            .get(key)
            .map(|points| Blueprint::new(key, points.clone()))
            .ok_or_else(|| FetchError::NotFound(key.to_string()))
    }

    fn create(&self, blueprint: &Blueprint) -> FetchResult<Blueprint> {
        let key = blueprint.key();
        let mut blueprints = self.blueprints.write().map_err(lock_error)?;
        if blueprints.contains_key(&key) {
            return Err(FetchError::Conflict(key.to_string()));
        }
        blueprints.insert(key, blueprint.points.clone());
        Ok(blueprint.clone())
    }

    fn replace_points(&self, key: &BlueprintKey, points: &[Point]) -> FetchResult<Blueprint> {
        self.update(key, |stored| *stored = points.to_vec())
    }

    fn append_point(&self, key: &BlueprintKey, point: Point) -> FetchResult<Blueprint> {
        self.update(key, |stored| stored.push(point))
    }

    fn delete(&self, key: &BlueprintKey) -> FetchResult<()> {
        let mut blueprints = self.blueprints.write().map_err(lock_error)?;
        blueprints
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| FetchError::NotFound(key.to_string()))
    }
}
