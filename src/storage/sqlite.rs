use std::path::Path;
use std::sync::Arc;

use chrono::Utc;

use super::{KeyValueStore, StorageError};
use crate::db::queries::{self, KvRow};
use crate::db::Database;

/// Durable store backed by a SQLite file.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        Ok(Self {
            db: Arc::new(Database::open(path)?),
        })
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        Ok(Self {
            db: Arc::new(Database::open_in_memory()?),
        })
    }

    /// Sum of the stored value sizes in bytes.
    pub fn total_bytes(&self) -> Result<u64, StorageError> {
        let total = queries::total_size(&self.db)?;
        Ok(total.max(0) as u64)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(queries::get_value(&self.db, key)?)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        queries::upsert_entry(
            &self.db,
            &KvRow {
                key: key.to_string(),
                value: value.to_string(),
                size_bytes: value.len() as i64,
                updated_at: Utc::now().to_rfc3339(),
            },
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        queries::delete_entry(&self.db, key)?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        Ok(queries::list_keys(&self.db)?)
    }
}
