//! Request/response bookkeeping for live data polling

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_stream::wrappers::WatchStream;
use tracing::trace;

use crate::fetch::{BatchData, Key};

/// Marker value sent on the update channel after each batch of results lands
#[derive(Debug, Clone, Default)]
pub struct OnDataUpdate;

/// Per-key fetch status
#[derive(Debug, Clone, Copy)]
enum KeyStatus {
    /// A request covering this key is in flight
    Requested(Instant),
    /// The key was last fetched at the given instant
    Fetched(Instant),
}

#[derive(Default)]
struct ManagerState {
    statuses: HashMap<Key, KeyStatus>,
    cache: HashMap<Key, Value>,
}

/// Bookkeeping collaborator for [`LiveDataThread`](`crate::thread::LiveDataThread`)
///
/// The manager decides which observed keys are due for a refetch, records
/// which keys have a request in flight, and stores the latest fetched value
/// per key. Consumers read results through [`get`](`LiveDataManager::get`)
/// and learn about new results through [`on_update`](`LiveDataManager::on_update`).
///
/// The manager is a cheap cloneable handle over shared state, so it can be
/// handed both to the polling thread and to any number of readers.
#[derive(Clone)]
pub struct LiveDataManager {
    state: Arc<Mutex<ManagerState>>,
    update_tx: watch::Sender<OnDataUpdate>,
}

impl Default for LiveDataManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveDataManager {
    /// Create a new empty manager
    pub fn new() -> Self {
        let (update_tx, _) = watch::channel(OnDataUpdate);
        LiveDataManager {
            state: Arc::new(Mutex::new(ManagerState::default())),
            update_tx,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        // the lock is never held across an await point, recover on poison
        self.state.lock().unwrap_or_else(|err| err.into_inner())
    }

    /// Latest cached value for a key
    ///
    /// Returns `Value::Null` for keys that were fetched with an empty result
    /// and `None` for keys that have never been fetched.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().cache.get(key).cloned()
    }

    /// Subscribe to update notifications
    ///
    /// Returns a receiver that gets notified after each batch of results lands.
    pub fn on_update(&self) -> watch::Receiver<OnDataUpdate> {
        self.update_tx.subscribe()
    }

    /// Stream of update notifications
    pub fn updates(&self) -> WatchStream<OnDataUpdate> {
        WatchStream::new(self.update_tx.subscribe())
    }

    /// Select which of the observed keys are due for a refetch
    ///
    /// Keys with a request in flight are skipped. A key is due if it has
    /// never been fetched or if its last fetch is older than `interval`.
    /// Never-fetched keys come first, then stalest first, capped at
    /// `batch_size`.
    pub(crate) fn determine_keys_to_fetch(
        &self,
        observed: &[Key],
        interval: Duration,
        batch_size: usize,
    ) -> Vec<Key> {
        let state = self.lock();
        let now = Instant::now();

        let mut due: Vec<(Option<Instant>, Key)> = Vec::new();
        for key in observed {
            match state.statuses.get(key) {
                Some(KeyStatus::Requested(_)) => {}
                Some(KeyStatus::Fetched(at)) => {
                    if now.duration_since(*at) >= interval {
                        due.push((Some(*at), key.clone()));
                    }
                }
                None => due.push((None, key.clone())),
            }
        }

        // None sorts before Some, so never-fetched keys go first
        due.sort_by_key(|(at, _)| *at);
        due.truncate(batch_size);
        due.into_iter().map(|(_, key)| key).collect()
    }

    /// Record that a request covering the given keys is in flight
    pub(crate) fn mark_keys_requested(&self, keys: &[Key]) {
        let mut state = self.lock();
        let now = Instant::now();
        for key in keys {
            state
                .statuses
                .insert(key.clone(), KeyStatus::Requested(now));
        }
    }

    /// Clear the in-flight marker for the given keys
    ///
    /// Only `Requested` entries are cleared. A key that already holds a
    /// fetch timestamp keeps it.
    pub(crate) fn unmark_keys_requested(&self, keys: &[Key]) {
        let mut state = self.lock();
        for key in keys {
            if let Some(KeyStatus::Requested(_)) = state.statuses.get(key) {
                state.statuses.remove(key);
            }
        }
    }

    /// Store a batch of results and stamp the keys as fetched
    ///
    /// Keys absent from `data` are cached as `Value::Null` so they still
    /// count as fetched and are not retried before the next interval.
    pub(crate) fn update_fetched_keys(&self, keys: &[Key], mut data: BatchData) {
        {
            let mut state = self.lock();
            let now = Instant::now();
            for key in keys {
                state.statuses.insert(key.clone(), KeyStatus::Fetched(now));
                let value = data.remove(key).unwrap_or(Value::Null);
                state.cache.insert(key.clone(), value);
            }
            trace!(keys = keys.len(), "stored fetched batch");
        }
        let _ = self.update_tx.send(OnDataUpdate);
    }
}
