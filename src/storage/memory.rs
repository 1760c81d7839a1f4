use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

use super::{KeyValueStore, StorageError, StorageEvent};

const CHANGE_FEED_CAPACITY: usize = 256;

struct Shared {
    entries: Mutex<HashMap<String, String>>,
    quota_bytes: Option<usize>,
    changes: broadcast::Sender<StorageEvent>,
}

/// Session-scoped store.
///
/// Handles from [`attach_context`](Self::attach_context) share the data but
/// write under their own context id, the way several pages of one browsing
/// session share `sessionStorage`.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    context_id: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Store that refuses writes once keys plus values exceed `quota_bytes`.
    pub fn with_quota(quota_bytes: usize) -> Self {
        Self::build(Some(quota_bytes))
    }

    fn build(quota_bytes: Option<usize>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                entries: Mutex::new(HashMap::new()),
                quota_bytes,
                changes,
            }),
            context_id: Uuid::new_v4().to_string(),
        }
    }

    /// Another handle on the same data, writing as a different page.
    pub fn attach_context(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            context_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn used_bytes(&self) -> usize {
        let guard = self.shared.entries.lock().expect("memory store mutex poisoned");
        used_bytes(&guard)
    }

    fn announce(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        // no receivers is fine
        let _ = self.shared.changes.send(StorageEvent {
            key: key.to_string(),
            old_value,
            new_value,
            source_context: self.context_id.clone(),
        });
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn used_bytes(entries: &HashMap<String, String>) -> usize {
    entries.iter().map(|(key, value)| key.len() + value.len()).sum()
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let guard = self.shared.entries.lock().expect("memory store mutex poisoned");
        Ok(guard.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let old_value = {
            let mut guard = self.shared.entries.lock().expect("memory store mutex poisoned");
            if let Some(limit) = self.shared.quota_bytes {
                let current = used_bytes(&guard);
                let replaced = guard.get(key).map_or(0, |old| key.len() + old.len());
                let needed = current - replaced + key.len() + value.len();
                if needed > limit {
                    return Err(StorageError::QuotaExceeded { needed, limit });
                }
            }
            guard.insert(key.to_string(), value.to_string())
        };
        self.announce(key, old_value, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        let old_value = {
            let mut guard = self.shared.entries.lock().expect("memory store mutex poisoned");
            guard.remove(key)
        };
        if old_value.is_some() {
            self.announce(key, old_value, None);
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        let guard = self.shared.entries.lock().expect("memory store mutex poisoned");
        let mut keys: Vec<String> = guard.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn context_id(&self) -> &str {
        &self.context_id
    }

    fn watch(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        Some(self.shared.changes.subscribe())
    }
}
