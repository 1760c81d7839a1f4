use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};

use serde_json::{Map, Value};

use super::defaults::{default_chart_config, default_settings, default_state};
use crate::bus::{panic_message, ListenerId};
use crate::config::AppConfig;
use crate::host::PageHost;
use crate::storage::{read_json, write_json, KeyValueStore};
use crate::AppError;

/// Subscribing under this key observes every update as whole-state snapshots.
pub const WILDCARD: &str = "*";

/// Durable store key (after the prefix) for the persisted subset.
pub const STATE_STORAGE_KEY: &str = "app_state";

/// Fields that survive a restart.
pub const PERSISTED_KEYS: [&str; 4] = ["currentFileId", "filters", "chartConfig", "settings"];

type StateCallback = Arc<dyn Fn(&Value, &Value) + Send + Sync>;

#[derive(Clone)]
struct Subscriber {
    id: ListenerId,
    callback: StateCallback,
}

type SubscriberMap = HashMap<String, Vec<Subscriber>>;

/// Handle returned by [`AppState::subscribe`].
pub struct StateSubscription {
    subscribers: Weak<Mutex<SubscriberMap>>,
    key: String,
    id: ListenerId,
}

impl StateSubscription {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns false if the subscription was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(subscribers) = self.subscribers.upgrade() else {
            return false;
        };
        let mut guard = subscribers.lock().expect("state subscribers mutex poisoned");
        let Some(list) = guard.get_mut(&self.key) else {
            return false;
        };
        let before = list.len();
        list.retain(|subscriber| subscriber.id != self.id);
        let removed = list.len() != before;
        if list.is_empty() {
            guard.remove(&self.key);
        }
        removed
    }
}

/// Observable state container.
///
/// The lock is released before subscribers run, so a subscriber may read or
/// update the state again.
pub struct AppState {
    state: Mutex<Map<String, Value>>,
    subscribers: Arc<Mutex<SubscriberMap>>,
    store: Arc<dyn KeyValueStore>,
    host: Arc<dyn PageHost>,
    storage_key: String,
    defaults: Map<String, Value>,
}

impl AppState {
    /// Build the container from defaults overlaid with the persisted subset.
    pub fn new(store: Arc<dyn KeyValueStore>, host: Arc<dyn PageHost>, config: &AppConfig) -> Self {
        let defaults = default_state(&config.api.base_url);
        let storage_key = format!("{}{STATE_STORAGE_KEY}", config.storage.key_prefix);
        let mut state = defaults.clone();
        restore_persisted(store.as_ref(), &storage_key, &config.api.base_url, &mut state);

        Self {
            state: Mutex::new(state),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            store,
            host,
            storage_key,
            defaults,
        }
    }

    /// Observe one key (`(new, old)`) or [`WILDCARD`] (`(new_state, old_state)`).
    pub fn subscribe<F>(&self, key: &str, callback: F) -> StateSubscription
    where
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.subscribers
            .lock()
            .expect("state subscribers mutex poisoned")
            .entry(key.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });

        StateSubscription {
            subscribers: Arc::downgrade(&self.subscribers),
            key: key.to_string(),
            id,
        }
    }

    pub fn subscriber_count(&self, key: &str) -> usize {
        self.subscribers
            .lock()
            .expect("state subscribers mutex poisoned")
            .get(key)
            .map_or(0, Vec::len)
    }

    /// Merge `partial` into the state, notify, then persist.
    ///
    /// An object over an object merges one level deep; anything else,
    /// including arrays and `null`, replaces the previous value.
    /// Keyed subscribers fire in sorted key order (`serde_json::Map` is
    /// ordered by key), not in the order the keys were inserted.
    pub fn update(&self, partial: Map<String, Value>) {
        self.commit(partial, true);
    }

    pub fn update_value(&self, partial: Value) -> Result<(), AppError> {
        match partial {
            Value::Object(partial) => {
                self.update(partial);
                Ok(())
            }
            other => Err(AppError::Validation(format!(
                "state update must be an object, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.state
            .lock()
            .expect("state mutex poisoned")
            .get(key)
            .cloned()
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.state.lock().expect("state mutex poisoned").clone()
    }

    /// With keys: `filters` becomes `{}`, `chartConfig` its default shape and
    /// anything else `null`, notifying subscribers as an update does.
    /// Without: drop the persisted copy, restore defaults and reload the page.
    pub fn reset(&self, keys: Option<&[&str]>) {
        match keys {
            Some(keys) => {
                let mut updates = Map::new();
                for key in keys {
                    let value = match *key {
                        "filters" => Value::Object(Map::new()),
                        "chartConfig" => default_chart_config(),
                        _ => Value::Null,
                    };
                    updates.insert((*key).to_string(), value);
                }
                self.commit(updates, false);
            }
            None => {
                if let Err(error) = self.store.remove(&self.storage_key) {
                    tracing::warn!("failed to remove persisted state: {error}");
                }
                *self.state.lock().expect("state mutex poisoned") = self.defaults.clone();
                tracing::info!("application state reset");
                self.host.reload();
            }
        }
    }

    fn commit(&self, partial: Map<String, Value>, merge: bool) {
        let (old_state, new_state) = {
            let mut state = self.state.lock().expect("state mutex poisoned");
            let old_state = state.clone();
            for (key, value) in &partial {
                let merged = match (state.get(key), value) {
                    (Some(Value::Object(current)), Value::Object(incoming)) if merge => {
                        let mut combined = current.clone();
                        combined.extend(incoming.clone());
                        Value::Object(combined)
                    }
                    _ => value.clone(),
                };
                state.insert(key.clone(), merged);
            }
            (old_state, state.clone())
        };

        tracing::debug!(keys = ?partial.keys().collect::<Vec<_>>(), "state updated");

        for key in partial.keys() {
            let new_value = new_state.get(key).unwrap_or(&Value::Null);
            let old_value = old_state.get(key).unwrap_or(&Value::Null);
            self.notify(key, new_value, old_value);
        }

        let new_full = Value::Object(new_state);
        let old_full = Value::Object(old_state);
        self.notify(WILDCARD, &new_full, &old_full);

        if let Value::Object(state) = &new_full {
            self.persist(state);
        }
    }

    fn notify(&self, key: &str, new_value: &Value, old_value: &Value) {
        let snapshot: Vec<Subscriber> = {
            let guard = self.subscribers.lock().expect("state subscribers mutex poisoned");
            match guard.get(key) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        for subscriber in snapshot {
            let callback = subscriber.callback.clone();
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(new_value, old_value))) {
                tracing::error!(
                    key,
                    subscriber = ?subscriber.id,
                    "state subscriber panicked: {}",
                    panic_message(panic.as_ref())
                );
            }
        }
    }

    fn persist(&self, state: &Map<String, Value>) {
        let durable: Map<String, Value> = PERSISTED_KEYS
            .iter()
            .map(|key| {
                (
                    (*key).to_string(),
                    state.get(*key).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();
        if let Err(error) = write_json(self.store.as_ref(), &self.storage_key, &durable) {
            tracing::warn!("failed to save state to storage: {error}");
        }
    }
}

fn restore_persisted(
    store: &dyn KeyValueStore,
    storage_key: &str,
    api_base_url: &str,
    state: &mut Map<String, Value>,
) {
    let saved = match read_json::<Map<String, Value>>(store, storage_key) {
        Ok(Some(saved)) => saved,
        Ok(None) => return,
        Err(error) => {
            tracing::warn!("failed to load state from storage: {error}");
            return;
        }
    };

    state.insert(
        "currentFileId".to_string(),
        saved.get("currentFileId").cloned().unwrap_or(Value::Null),
    );
    state.insert(
        "filters".to_string(),
        present(&saved, "filters").unwrap_or_else(|| Value::Object(Map::new())),
    );
    state.insert(
        "chartConfig".to_string(),
        present(&saved, "chartConfig").unwrap_or_else(default_chart_config),
    );

    let mut settings = match default_settings(api_base_url) {
        Value::Object(settings) => settings,
        _ => Map::new(),
    };
    if let Some(Value::Object(saved_settings)) = saved.get("settings") {
        settings.extend(saved_settings.clone());
    }
    state.insert("settings".to_string(), Value::Object(settings));
}

/// A stored field counts as missing when absent or `null`.
fn present(saved: &Map<String, Value>, key: &str) -> Option<Value> {
    saved.get(key).filter(|value| !value.is_null()).cloned()
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
