//! Key-value persistence and the helpers built on it.
//!
//! - `KeyValueStore`: string-keyed, string-valued, synchronous storage
//! - `MemoryStore`: session-scoped store shared by every page of a session
//! - `SqliteStore`: durable store that survives restarts
//! - `FileCache`: size-capped cache of uploaded file payloads with expiry
//! - `PageBridge`: cross-page shared mapping on top of the session store
//! - `PageStateStore`: per-page snapshots that expire after a day

mod clock;
mod file_cache;
mod memory;
mod page_bridge;
mod page_state;
mod sqlite;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

use crate::db::DbError;

pub use clock::{Clock, SystemClock};
pub use file_cache::{CachedFileInfo, FileCache, StorageUsage, FILE_FORMAT_VERSION};
pub use memory::MemoryStore;
pub use page_bridge::{Page, PageBridge, PAGE_DATA_KEY};
pub use page_state::{PageSnapshot, PageStateStore, PAGE_STATE_KEY, PAGE_STATE_VERSION};
pub use sqlite::SqliteStore;

pub const DEFAULT_CONTEXT: &str = "default";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage quota exceeded: {needed} bytes needed, {limit} allowed")]
    QuotaExceeded { needed: usize, limit: usize },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A change made through one store handle, observable from the others.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageEvent {
    pub key: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source_context: String,
}

pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&self, key: &str) -> Result<(), StorageError>;
    fn keys(&self) -> Result<Vec<String>, StorageError>;

    /// Identifies the page context this handle writes on behalf of.
    fn context_id(&self) -> &str {
        DEFAULT_CONTEXT
    }

    /// Change feed, if the store supports one.
    fn watch(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        None
    }
}

pub fn read_json<T: DeserializeOwned>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<Option<T>, StorageError> {
    match store.get(key)? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub fn write_json<T: Serialize + ?Sized>(
    store: &dyn KeyValueStore,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let raw = serde_json::to_string(value)?;
    store.set(key, &raw)
}
