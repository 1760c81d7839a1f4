//! Shared fixtures for unit and cross-module tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::host::MemoryHost;
use crate::loader::{LoadError, ScriptFetcher};
use crate::storage::{Clock, KeyValueStore, MemoryStore, StorageError, StorageEvent};
use crate::AppContext;

/// Clock that only moves when told to.
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn advance(&self, ms: i64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// Store wrapper that fails selected writes, or everything.
pub struct FailingStore {
    inner: Arc<dyn KeyValueStore>,
    failing_writes: Mutex<HashSet<String>>,
    failing_removes: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
}

impl FailingStore {
    pub fn new(inner: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner,
            failing_writes: Mutex::new(HashSet::new()),
            failing_removes: Mutex::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
        }
    }

    pub fn fail_writes_to(&self, key: &str) {
        self.failing_writes.lock().unwrap().insert(key.to_string());
    }

    pub fn fail_removes_of(&self, key: &str) {
        self.failing_removes.lock().unwrap().insert(key.to_string());
    }

    pub fn allow_removes_of(&self, key: &str) {
        self.failing_removes.lock().unwrap().remove(key);
    }

    pub fn fail_everything(&self) {
        self.fail_all.store(true, Ordering::SeqCst);
    }

    fn check(&self, key: Option<&str>) -> Result<(), StorageError> {
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("store offline".to_string()));
        }
        if let Some(key) = key {
            if self.failing_writes.lock().unwrap().contains(key) {
                return Err(StorageError::QuotaExceeded {
                    needed: usize::MAX,
                    limit: 0,
                });
            }
        }
        Ok(())
    }
}

impl KeyValueStore for FailingStore {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.check(None)?;
        self.inner.get(key)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.check(Some(key))?;
        self.inner.set(key, value)
    }

    fn remove(&self, key: &str) -> Result<(), StorageError> {
        self.check(None)?;
        if self.failing_removes.lock().unwrap().contains(key) {
            return Err(StorageError::Unavailable(format!("cannot remove {key}")));
        }
        self.inner.remove(key)
    }

    fn keys(&self) -> Result<Vec<String>, StorageError> {
        self.check(None)?;
        self.inner.keys()
    }

    fn context_id(&self) -> &str {
        self.inner.context_id()
    }

    fn watch(&self) -> Option<broadcast::Receiver<StorageEvent>> {
        self.inner.watch()
    }
}

/// Fetcher that serves every script instantly.
pub struct InstantFetcher;

#[async_trait]
impl ScriptFetcher for InstantFetcher {
    async fn fetch(&self, _src: &str) -> Result<(), LoadError> {
        Ok(())
    }
}

/// Handles on everything a context was built from.
pub struct TestRig {
    pub context: AppContext,
    pub host: Arc<MemoryHost>,
    pub durable: Arc<MemoryStore>,
    pub session: Arc<MemoryStore>,
}

/// A context over in-memory stores, on a page at `url`.
pub fn test_rig(url: &str) -> TestRig {
    let durable = Arc::new(MemoryStore::new());
    let session = Arc::new(MemoryStore::new());
    test_rig_over(url, durable, session)
}

pub fn test_rig_over(url: &str, durable: Arc<MemoryStore>, session: Arc<MemoryStore>) -> TestRig {
    let host = Arc::new(MemoryHost::new(url));
    let mut config = AppConfig::default();
    config.api.retries = 0;
    config.api.retry_delay_ms = 0;
    let context = AppContext::with_fetcher(
        config,
        durable.clone(),
        session.clone(),
        host.clone(),
        Arc::new(InstantFetcher),
    )
    .expect("test context should build");
    TestRig {
        context,
        host,
        durable,
        session,
    }
}
