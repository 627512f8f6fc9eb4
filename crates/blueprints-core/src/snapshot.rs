//! One-shot baseline fetch for a freshly opened blueprint.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use crate::model::{Blueprint, BlueprintKey};
use crate::store::{BlueprintStore, FetchError, FetchResult};

/// Fetches the authoritative point sequence of a blueprint.
#[derive(Clone)]
pub struct SnapshotLoader {
    store: Arc<dyn BlueprintStore>,
}

impl SnapshotLoader {
    pub fn new(store: Arc<dyn BlueprintStore>) -> Self {
        Self { store }
    }

    /// Fetch the blueprint, blocking the calling thread.
    pub fn load(&self, key: &BlueprintKey) -> FetchResult<Blueprint> {
        log::debug!("Loading snapshot of {key}");
        self.store.get(key)
    }

    /// Fetch on a worker thread and hand the outcome to `deliver`.
    ///
    /// The caller tags `deliver` with whatever it needs to recognise a stale
    /// completion; the loader never cancels a fetch once started.
    pub fn spawn<F>(&self, key: BlueprintKey, deliver: F)
    where
        F: FnOnce(FetchResult<Blueprint>) + Send + 'static,
    {
        self.dispatch(key, deliver, |job| {
            thread::Builder::new()
                .name("snapshot-loader".into())
                .spawn(job)
                .map(drop)
        });
    }

    /// Run the fetch through `start`. If `start` fails, `deliver` still
    /// receives the failure.
    fn dispatch<F, S>(&self, key: BlueprintKey, deliver: F, start: S)
    where
        F: FnOnce(FetchResult<Blueprint>) + Send + 'static,
        S: FnOnce(Box<dyn FnOnce() + Send>) -> io::Result<()>,
    {
        let slot = Arc::new(Mutex::new(Some(deliver)));
        let worker_slot = Arc::clone(&slot);
        let loader = self.clone();
        let job = Box::new(move || {
            let result = loader.load(&key);
            if let Some(deliver) = take(&worker_slot) {
                deliver(result);
            }
        });
        if let Err(e) = start(job) {
            log::error!("Failed to spawn snapshot loader: {e}");
            if let Some(deliver) = take(&slot) {
                deliver(Err(FetchError::Request(format!(
                    "snapshot loader not started: {e}"
                ))));
            }
        }
    }
}

fn take<F>(slot: &Mutex<Option<F>>) -> Option<F> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Point;
    use crate::store::MemoryStore;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn test_load_existing() {
        let key = BlueprintKey::new("ana", "p1");
        let store = MemoryStore::with_blueprints([Blueprint::new(&key, vec![Point::new(1, 1)])]);
        let loader = SnapshotLoader::new(Arc::new(store));
        assert_eq!(loader.load(&key).unwrap().points, vec![Point::new(1, 1)]);
    }

    #[test]
    fn test_spawn_delivers_failure() {
        let loader = SnapshotLoader::new(Arc::new(MemoryStore::new()));
        let (tx, rx) = mpsc::channel();
        loader.spawn(BlueprintKey::new("ana", "missing"), move |result| {
            let _ = tx.send(result);
        });
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(matches!(result, Err(FetchError::NotFound(_))));
    }

    #[test]
    fn test_unstartable_worker_still_delivers() {
        let key = BlueprintKey::new("ana", "p1");
        let store = MemoryStore::with_blueprints([Blueprint::new(&key, vec![])]);
        let loader = SnapshotLoader::new(Arc::new(store));
        let (tx, rx) = mpsc::channel();
        loader.dispatch(
            key,
            move |result| {
                let _ = tx.send(result);
            },
            |_job| Err(io::Error::other("no threads left")),
        );
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(FetchError::Request(ref m)) if m.contains("no threads left")));
    }
}
