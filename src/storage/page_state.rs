use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{read_json, write_json, Clock, KeyValueStore, StorageError, SystemClock};
use crate::config::StorageConfig;

/// Written into every page snapshot.
pub const PAGE_STATE_VERSION: &str = "1.0";

/// Key segment between the store prefix and the page name.
pub const PAGE_STATE_KEY: &str = "page_state_";

/// What one page looked like when it was last left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub timestamp: i64,
    pub page: String,
    pub state: Value,
    pub version: String,
}

/// Per-page snapshots in the durable store, under `<prefix>page_state_<page>`.
///
/// Snapshots older than the configured expiry (default 24 h) are treated as
/// gone: `load` drops them and `cleanup_expired` scans them out. Storage
/// failures are logged and turned into `false`/`None`/`0`.
pub struct PageStateStore {
    store: Arc<dyn KeyValueStore>,
    key_prefix: String,
    max_age: Duration,
    clock: Arc<dyn Clock>,
    current_page: Mutex<Option<String>>,
}

impl PageStateStore {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            key_prefix: format!("{}{PAGE_STATE_KEY}", config.key_prefix),
            max_age: config.page_state_expiry(),
            clock: Arc::new(SystemClock),
            current_page: Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn key(&self, page: &str) -> String {
        format!("{}{page}", self.key_prefix)
    }

    pub fn current_page(&self) -> Option<String> {
        self.current_page
            .lock()
            .expect("current page mutex poisoned")
            .clone()
    }

    /// Switch to `page`, saving `outgoing_state` for the page being left.
    ///
    /// Returns the saved state of `page`, if a live snapshot exists.
    pub fn set_current_page(&self, page: &str, outgoing_state: &Value) -> Option<Value> {
        let previous = self
            .current_page
            .lock()
            .expect("current page mutex poisoned")
            .replace(page.to_string());

        if let Some(previous) = previous.filter(|previous| previous != page) {
            self.save(&previous, outgoing_state);
        }
        self.load(page)
    }

    /// Save `state` for the current page; false when no page is current.
    pub fn save_current(&self, state: &Value) -> bool {
        match self.current_page() {
            Some(page) => self.save(&page, state),
            None => false,
        }
    }

    pub fn save(&self, page: &str, state: &Value) -> bool {
        let snapshot = PageSnapshot {
            timestamp: self.clock.now_ms(),
            page: page.to_string(),
            state: state.clone(),
            version: PAGE_STATE_VERSION.to_string(),
        };
        match write_json(self.store.as_ref(), &self.key(page), &snapshot) {
            Ok(()) => {
                tracing::debug!(page, "page state saved");
                true
            }
            Err(error) => {
                tracing::error!(page, "failed to save page state: {error}");
                false
            }
        }
    }

    /// Saved state of `page`. An expired snapshot is removed and reads as `None`.
    pub fn load(&self, page: &str) -> Option<Value> {
        let key = self.key(page);
        let snapshot = match read_json::<PageSnapshot>(self.store.as_ref(), &key) {
            Ok(snapshot) => snapshot?,
            Err(error) => {
                tracing::error!(page, "failed to load page state: {error}");
                return None;
            }
        };

        if self.is_expired(snapshot.timestamp) {
            if let Err(error) = self.store.remove(&key) {
                tracing::warn!(page, "failed to remove expired page state: {error}");
            }
            tracing::info!(page, "expired page state dropped");
            return None;
        }
        Some(snapshot.state)
    }

    /// Remove every expired or unreadable snapshot; returns how many went.
    pub fn cleanup_expired(&self) -> usize {
        let stale = self.matching_keys().map(|keys| {
            keys.into_iter()
                .filter(|key| {
                    match read_json::<PageSnapshot>(self.store.as_ref(), key) {
                        Ok(Some(snapshot)) => self.is_expired(snapshot.timestamp),
                        Ok(None) => false,
                        Err(_) => true,
                    }
                })
                .collect::<Vec<_>>()
        });
        let removed = self.remove_all(stale);
        if removed > 0 {
            tracing::info!(removed, "expired page states cleaned up");
        }
        removed
    }

    /// Remove every snapshot; returns how many went.
    pub fn clear_all(&self) -> usize {
        let removed = self.remove_all(self.matching_keys());
        tracing::info!(removed, "all page states cleared");
        removed
    }

    fn is_expired(&self, timestamp: i64) -> bool {
        let max_age_ms = i64::try_from(self.max_age.as_millis()).unwrap_or(i64::MAX);
        self.clock.now_ms().saturating_sub(timestamp) > max_age_ms
    }

    fn matching_keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter(|key| key.starts_with(&self.key_prefix))
            .collect())
    }

    fn remove_all(&self, keys: Result<Vec<String>, StorageError>) -> usize {
        let keys = match keys {
            Ok(keys) => keys,
            Err(error) => {
                tracing::error!("failed to scan page states: {error}");
                return 0;
            }
        };
        keys.iter()
            .filter(|key| match self.store.remove(key) {
                Ok(()) => true,
                Err(error) => {
                    tracing::warn!(key = %key, "failed to remove page state: {error}");
                    false
                }
            })
            .count()
    }
}
