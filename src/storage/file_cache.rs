use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{read_json, write_json, Clock, KeyValueStore, StorageError, SystemClock};
use crate::config::StorageConfig;

/// Written into every payload envelope.
pub const FILE_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Serialize)]
struct EnvelopeRef<'a> {
    data: &'a Value,
    timestamp: i64,
    version: &'static str,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: Value,
    #[allow(dead_code)]
    timestamp: i64,
    #[allow(dead_code)]
    version: String,
}

/// Index entry for one cached payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedFileInfo {
    pub id: String,
    pub timestamp: i64,
    pub size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUsage {
    pub file_count: usize,
    pub total_bytes: usize,
    pub max_bytes: usize,
    pub percentage: f64,
}

/// Size-capped cache of file payloads in the durable store.
///
/// Payloads live under `<prefix>file_<id>`; `<prefix>file_list` indexes them.
/// Every operation is best effort: storage failures are logged and turned
/// into `false`/`None`/`0`.
pub struct FileCache {
    store: Arc<dyn KeyValueStore>,
    prefix: String,
    max_payload_bytes: usize,
    clock: Arc<dyn Clock>,
}

impl FileCache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &StorageConfig) -> Self {
        Self {
            store,
            prefix: config.key_prefix.clone(),
            max_payload_bytes: config.max_payload_bytes,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    fn payload_key(&self, id: &str) -> String {
        format!("{}file_{id}", self.prefix)
    }

    fn index_key(&self) -> String {
        format!("{}file_list", self.prefix)
    }

    /// Cache `payload` under `id`. Returns false when the serialized envelope
    /// exceeds the ceiling or the store refuses the write.
    pub fn put(&self, id: &str, payload: &Value) -> bool {
        match self.try_put(id, payload) {
            Ok(stored) => stored,
            Err(error) => {
                tracing::error!(file_id = id, "failed to cache file data: {error}");
                false
            }
        }
    }

    fn try_put(&self, id: &str, payload: &Value) -> Result<bool, StorageError> {
        let timestamp = self.clock.now_ms();
        let serialized = serde_json::to_string(&EnvelopeRef {
            data: payload,
            timestamp,
            version: FILE_FORMAT_VERSION,
        })?;

        if serialized.len() > self.max_payload_bytes {
            tracing::warn!(
                file_id = id,
                size = serialized.len(),
                limit = self.max_payload_bytes,
                "file data too large for local cache"
            );
            return Ok(false);
        }

        let mut index = self.read_index();
        let key = self.payload_key(id);
        let previous = self.store.get(&key)?;
        self.store.set(&key, &serialized)?;

        let info = CachedFileInfo {
            id: id.to_string(),
            timestamp,
            size: serialized.len(),
        };
        match index.iter_mut().find(|entry| entry.id == id) {
            Some(entry) => *entry = info,
            None => index.push(info),
        }

        if let Err(error) = self.write_index(&index) {
            // keep payloads and index in step
            let restored = match previous {
                Some(previous) => self.store.set(&key, &previous),
                None => self.store.remove(&key),
            };
            if let Err(restore_error) = restored {
                tracing::warn!(file_id = id, "failed to roll back cached payload: {restore_error}");
            }
            return Err(error);
        }

        tracing::debug!(file_id = id, size = serialized.len(), "file data cached");
        Ok(true)
    }

    pub fn get(&self, id: &str) -> Option<Value> {
        let result: Result<Option<Envelope>, StorageError> =
            read_json(self.store.as_ref(), &self.payload_key(id));
        match result {
            Ok(envelope) => envelope.map(|envelope| envelope.data),
            Err(error) => {
                tracing::error!(file_id = id, "failed to read cached file data: {error}");
                None
            }
        }
    }

    /// Remove the payload and its index entry.
    pub fn delete(&self, id: &str) -> bool {
        let result = self.store.remove(&self.payload_key(id)).and_then(|()| {
            let mut index = self.read_index();
            index.retain(|entry| entry.id != id);
            self.write_index(&index)
        });
        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(file_id = id, "failed to delete cached file data: {error}");
                false
            }
        }
    }

    /// Every indexed record, in insertion order.
    pub fn list(&self) -> Vec<CachedFileInfo> {
        self.read_index()
    }

    /// Remove every record older than `max_age`; returns how many went.
    ///
    /// A record whose payload could not be removed stays indexed so a later
    /// sweep retries it. Nothing counts as removed unless the index rewrite
    /// succeeds.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let now = self.clock.now_ms();
        let max_age_ms = i64::try_from(max_age.as_millis()).unwrap_or(i64::MAX);

        let (expired, mut retained): (Vec<_>, Vec<_>) = self
            .read_index()
            .into_iter()
            .partition(|entry| now.saturating_sub(entry.timestamp) > max_age_ms);

        if expired.is_empty() {
            return 0;
        }

        let mut removed = 0;
        for entry in expired {
            match self.store.remove(&self.payload_key(&entry.id)) {
                Ok(()) => removed += 1,
                Err(error) => {
                    tracing::warn!(file_id = %entry.id, "failed to remove expired file data: {error}");
                    retained.push(entry);
                }
            }
        }

        if removed == 0 {
            return 0;
        }

        if let Err(error) = self.write_index(&retained) {
            // the stale entries stay expired, so the next sweep drops them
            tracing::error!("failed to rewrite file index after sweep: {error}");
            return 0;
        }

        tracing::info!(removed, retained = retained.len(), "expired file data swept");
        removed
    }

    pub fn usage(&self) -> Option<StorageUsage> {
        let index = match read_json::<Vec<CachedFileInfo>>(self.store.as_ref(), &self.index_key()) {
            Ok(index) => index.unwrap_or_default(),
            Err(error) => {
                tracing::error!("failed to read storage usage: {error}");
                return None;
            }
        };

        let total_bytes: usize = index.iter().map(|entry| entry.size).sum();
        let percentage = total_bytes as f64 / self.max_payload_bytes as f64 * 100.0;
        Some(StorageUsage {
            file_count: index.len(),
            total_bytes,
            max_bytes: self.max_payload_bytes,
            percentage: (percentage * 100.0).round() / 100.0,
        })
    }

    /// A corrupt or unreadable index reads as empty.
    fn read_index(&self) -> Vec<CachedFileInfo> {
        match read_json::<Vec<CachedFileInfo>>(self.store.as_ref(), &self.index_key()) {
            Ok(index) => index.unwrap_or_default(),
            Err(error) => {
                tracing::warn!("file index unreadable, treating as empty: {error}");
                Vec::new()
            }
        }
    }

    fn write_index(&self, index: &[CachedFileInfo]) -> Result<(), StorageError> {
        write_json(self.store.as_ref(), &self.index_key(), index)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStore;
    use crate::testing::{FailingStore, ManualClock};

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;

    fn cache_on(store: Arc<dyn KeyValueStore>, clock: Arc<ManualClock>) -> FileCache {
        FileCache::new(store, &StorageConfig::default()).with_clock(clock)
    }

    #[test]
    fn put_then_get_round_trips_payload() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone(), Arc::new(ManualClock::new(1_000)));
        let payload = json!({
            "columns": ["x", "y"],
            "rows": [[1, 2.5], [2, null]],
            "meta": {"name": "sample.csv"}
        });

        assert!(cache.put("f1", &payload));
        assert_eq!(cache.get("f1"), Some(payload));

        let raw = store.get("daplot_file_f1").unwrap().unwrap();
        let envelope: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(envelope["version"], "1.0");
        assert_eq!(envelope["timestamp"], 1_000);
        assert_eq!(
            cache.list(),
            vec![CachedFileInfo {
                id: "f1".to_string(),
                timestamp: 1_000,
                size: raw.len()
            }]
        );
    }

    #[test]
    fn overwriting_updates_index_in_place() {
        let clock = Arc::new(ManualClock::new(1_000));
        let cache = cache_on(Arc::new(MemoryStore::new()), clock.clone());

        assert!(cache.put("f1", &json!([1])));
        assert!(cache.put("f2", &json!([2])));
        clock.advance(500);
        assert!(cache.put("f1", &json!([1, 1])));

        let index = cache.list();
        assert_eq!(index.len(), 2);
        assert_eq!(index[0].id, "f1");
        assert_eq!(index[0].timestamp, 1_500);
        assert_eq!(cache.get("f1"), Some(json!([1, 1])));
    }

    #[test]
    fn delete_removes_payload_and_index_entry() {
        let store = Arc::new(MemoryStore::new());
        let cache = cache_on(store.clone(), Arc::new(ManualClock::new(0)));
        cache.put("f1", &json!({"a": 1}));
        cache.put("f2", &json!({"b": 2}));

        assert!(cache.delete("f1"));
        assert_eq!(cache.get("f1"), None);
        assert!(cache.list().iter().all(|entry| entry.id != "f1"));
        assert_eq!(store.get("daplot_file_f1").unwrap(), None);
        assert_eq!(cache.get("f2"), Some(json!({"b": 2})));
    }

    #[test]
    fn oversized_payload_is_rejected_without_writes() {
        let store = Arc::new(MemoryStore::new());
        let config = StorageConfig {
            max_payload_bytes: 64,
            ..StorageConfig::default()
        };
        let cache = FileCache::new(store.clone(), &config);

        assert!(!cache.put("big", &json!("x".repeat(200))));
        assert!(store.keys().unwrap().is_empty());
        assert_eq!(cache.get("big"), None);
    }

    #[test]
    fn oversized_replacement_keeps_previous_payload() {
        let config = StorageConfig {
            max_payload_bytes: 80,
            ..StorageConfig::default()
        };
        let cache = FileCache::new(Arc::new(MemoryStore::new()), &config);

        assert!(cache.put("f1", &json!("small")));
        assert!(!cache.put("f1", &json!("x".repeat(200))));
        assert_eq!(cache.get("f1"), Some(json!("small")));
    }

    #[test]
    fn sweep_removes_exactly_the_expired_records() {
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_on(Arc::new(MemoryStore::new()), clock.clone());

        cache.put("old", &json!(1));
        clock.advance(3 * DAY_MS);
        cache.put("boundary", &json!(2));
        clock.advance(DAY_MS);
        cache.put("fresh", &json!(3));
        clock.advance(4 * DAY_MS);

        // ages: old = 8d, boundary = 5d exactly, fresh = 4d
        let removed = cache.sweep(Duration::from_millis((5 * DAY_MS) as u64));
        assert_eq!(removed, 1);
        assert_eq!(cache.get("old"), None);
        assert_eq!(cache.get("boundary"), Some(json!(2)));
        assert_eq!(cache.get("fresh"), Some(json!(3)));
        let ids: Vec<_> = cache.list().into_iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec!["boundary", "fresh"]);
    }

    #[test]
    fn sweep_with_nothing_expired_is_a_no_op() {
        let cache = cache_on(Arc::new(MemoryStore::new()), Arc::new(ManualClock::new(10)));
        cache.put("f1", &json!(1));
        assert_eq!(cache.sweep(Duration::from_secs(60)), 0);
        assert_eq!(cache.list().len(), 1);
    }

    #[test]
    fn usage_reports_totals_against_ceiling() {
        let config = StorageConfig {
            max_payload_bytes: 1_000,
            ..StorageConfig::default()
        };
        let cache = FileCache::new(Arc::new(MemoryStore::new()), &config);
        cache.put("f1", &json!({"a": 1}));
        cache.put("f2", &json!({"b": 2}));

        let usage = cache.usage().expect("usage available");
        let total: usize = cache.list().iter().map(|entry| entry.size).sum();
        assert_eq!(usage.file_count, 2);
        assert_eq!(usage.total_bytes, total);
        assert_eq!(usage.max_bytes, 1_000);
        assert!((usage.percentage - total as f64 / 10.0).abs() < 0.01);
    }

    #[test]
    fn index_write_failure_rolls_back_payload() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(FailingStore::new(inner.clone()));
        store.fail_writes_to("daplot_file_list");
        let cache = FileCache::new(store.clone(), &StorageConfig::default());

        assert!(!cache.put("f1", &json!({"a": 1})));
        assert_eq!(inner.get("daplot_file_f1").unwrap(), None);
        assert!(cache.list().is_empty());
    }

    #[test]
    fn storage_failures_become_negative_results() {
        let store = Arc::new(FailingStore::new(Arc::new(MemoryStore::new())));
        store.fail_everything();
        let cache = FileCache::new(store, &StorageConfig::default());

        assert!(!cache.put("f1", &json!(1)));
        assert_eq!(cache.get("f1"), None);
        assert!(!cache.delete("f1"));
        assert_eq!(cache.usage(), None);
        assert_eq!(cache.sweep(Duration::ZERO), 0);
    }

    #[test]
    fn sweep_keeps_records_whose_payload_removal_failed() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(FailingStore::new(inner.clone()));
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_on(store.clone(), clock.clone());
        assert!(cache.put("old", &json!([1])));
        assert!(cache.put("gone", &json!([2])));
        store.fail_removes_of("daplot_file_old");

        clock.advance(10_000);
        assert_eq!(cache.sweep(Duration::from_secs(1)), 1);
        assert_eq!(inner.get("daplot_file_gone").unwrap(), None);
        assert!(inner.get("daplot_file_old").unwrap().is_some());
        let ids: Vec<String> = cache.list().into_iter().map(|entry| entry.id).collect();
        assert_eq!(ids, vec!["old".to_string()]);

        // once the store recovers the leftover record is swept
        store.allow_removes_of("daplot_file_old");
        assert_eq!(cache.sweep(Duration::from_secs(1)), 1);
        assert_eq!(inner.get("daplot_file_old").unwrap(), None);
        assert!(cache.list().is_empty());
    }

    #[test]
    fn sweep_counts_nothing_when_index_rewrite_fails() {
        let inner = Arc::new(MemoryStore::new());
        let store = Arc::new(FailingStore::new(inner.clone()));
        let clock = Arc::new(ManualClock::new(0));
        let cache = cache_on(store.clone(), clock.clone());
        assert!(cache.put("old", &json!([1])));
        store.fail_writes_to("daplot_file_list");

        clock.advance(10_000);
        assert_eq!(cache.sweep(Duration::from_secs(1)), 0);
        assert_eq!(inner.get("daplot_file_old").unwrap(), None);
        assert_eq!(cache.get("old"), None);
    }

    #[test]
    fn corrupt_payload_reads_as_missing() {
        let store = Arc::new(MemoryStore::new());
        store.set("daplot_file_bad", "{truncated").unwrap();
        let cache = FileCache::new(store, &StorageConfig::default());
        assert_eq!(cache.get("bad"), None);
    }
}
