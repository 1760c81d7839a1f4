use std::sync::{Arc, Mutex, Weak};

use reqwest::Url;
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::{read_json, write_json, KeyValueStore, StorageError, StorageEvent};
use crate::bus::event_types::{EVENT_PAGE_DATA_UPDATED, EVENT_SHARED_DATA_CHANGED};
use crate::bus::EventBus;
use crate::host::PageHost;
use crate::AppError;

/// Session key (after the prefix) holding the shared mapping.
pub const PAGE_DATA_KEY: &str = "page_data";

/// Pages reachable through [`PageBridge::navigate_to_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Page {
    Visualization,
    Prediction,
    DataEdit,
}

impl Page {
    pub fn path(self) -> &'static str {
        match self {
            Page::Visualization => "/visualization.html",
            Page::Prediction => "/prediction.html",
            Page::DataEdit => "/data_integrated.html",
        }
    }
}

/// Cross-page channel over the session store.
///
/// Pages of one session exchange a single JSON object. Writes made by another
/// page context arrive as [`StorageEvent`]s and are re-published on the bus as
/// `bridge.page_data_updated`.
pub struct PageBridge {
    store: Arc<dyn KeyValueStore>,
    bus: EventBus,
    host: Arc<dyn PageHost>,
    storage_key: String,
    api_base_url: Mutex<String>,
}

impl PageBridge {
    /// Build the bridge and seed the shared mapping from the page's query string.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        bus: EventBus,
        host: Arc<dyn PageHost>,
        key_prefix: &str,
        api_base_url: &str,
    ) -> Self {
        let bridge = Self {
            store,
            bus,
            host,
            storage_key: format!("{key_prefix}{PAGE_DATA_KEY}"),
            api_base_url: Mutex::new(api_base_url.to_string()),
        };
        bridge.restore_from_url();
        bridge
    }

    pub fn storage_key(&self) -> &str {
        &self.storage_key
    }

    /// The whole shared mapping; unreadable storage reads as empty.
    pub fn get_shared(&self) -> Map<String, Value> {
        match read_json::<Map<String, Value>>(self.store.as_ref(), &self.storage_key) {
            Ok(data) => data.unwrap_or_default(),
            Err(error) => {
                tracing::error!("failed to read shared page data: {error}");
                Map::new()
            }
        }
    }

    pub fn get_shared_value(&self, key: &str) -> Option<Value> {
        self.get_shared().remove(key)
    }

    pub fn set_shared(&self, key: &str, value: Value) -> bool {
        let mut data = self.get_shared();
        data.insert(key.to_string(), value.clone());
        if let Err(error) = self.write(&data) {
            tracing::error!(key, "failed to write shared page data: {error}");
            return false;
        }

        self.bus
            .publish(EVENT_SHARED_DATA_CHANGED, json!({ "key": key, "value": value }));
        true
    }

    /// Drop one key, or the whole mapping when `key` is `None`.
    pub fn clear_shared(&self, key: Option<&str>) -> bool {
        let result = match key {
            Some(key) => {
                let mut data = self.get_shared();
                data.remove(key);
                self.write(&data)
            }
            None => self.store.remove(&self.storage_key),
        };
        match result {
            Ok(()) => true,
            Err(error) => {
                tracing::error!(?key, "failed to clear shared page data: {error}");
                false
            }
        }
    }

    /// Store `data` in the shared mapping and send the host to `url`.
    ///
    /// `url` is resolved against the current page. String, number and boolean
    /// values are also mirrored into the query string so a fresh session can
    /// recover them. Returns the URL navigated to.
    pub fn navigate_to(&self, url: &str, data: &Map<String, Value>) -> Result<String, AppError> {
        let current = self.host.current_url();
        let base = Url::parse(&current).map_err(|error| {
            AppError::Validation(format!("invalid current page url '{current}': {error}"))
        })?;
        let mut target = base
            .join(url)
            .map_err(|error| AppError::Validation(format!("invalid target url '{url}': {error}")))?;

        for (key, value) in data {
            self.set_shared(key, value.clone());
        }

        let mirrored: Vec<(&String, String)> = data
            .iter()
            .filter_map(|(key, value)| query_value(value).map(|value| (key, value)))
            .collect();
        if !mirrored.is_empty() {
            let mut pairs: Vec<(String, String)> = target
                .query_pairs()
                .filter(|(key, _)| !mirrored.iter().any(|(mirrored, _)| mirrored.as_str() == &**key))
                .map(|(key, value)| (key.into_owned(), value.into_owned()))
                .collect();
            pairs.extend(
                mirrored
                    .into_iter()
                    .map(|(key, value)| (key.clone(), value)),
            );
            target.query_pairs_mut().clear().extend_pairs(pairs);
        }

        let target = target.to_string();
        tracing::debug!(url = %target, keys = data.len(), "navigating with shared data");
        self.host.navigate(&target);
        Ok(target)
    }

    pub fn navigate_to_page(&self, page: Page, file_id: &str) -> Result<String, AppError> {
        let mut data = Map::new();
        data.insert("currentFileId".to_string(), Value::String(file_id.to_string()));
        data.insert("source".to_string(), Value::String("navigation".to_string()));
        self.navigate_to(page.path(), &data)
    }

    /// Re-publish changes to the shared mapping made by other page contexts.
    /// Returns true when an update was published.
    pub fn handle_storage_event(&self, event: &StorageEvent) -> bool {
        if event.key != self.storage_key || event.source_context == self.store.context_id() {
            return false;
        }

        let data = match event.new_value.as_deref() {
            Some(raw) => match serde_json::from_str::<Value>(raw) {
                Ok(data) => data,
                Err(error) => {
                    tracing::error!("failed to parse shared page data update: {error}");
                    return false;
                }
            },
            None => Value::Object(Map::new()),
        };

        self.bus.publish(EVENT_PAGE_DATA_UPDATED, data);
        true
    }

    /// Drive [`handle_storage_event`](Self::handle_storage_event) from a
    /// store change feed until the feed closes or the bridge is dropped.
    pub fn spawn_storage_listener(
        self: &Arc<Self>,
        mut rx: broadcast::Receiver<StorageEvent>,
    ) -> JoinHandle<()> {
        let bridge: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let Some(bridge) = bridge.upgrade() else {
                            break;
                        };
                        bridge.handle_storage_event(&event);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("page bridge lagged, dropped {n} storage events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// `<base>/api/<endpoint>`.
    pub fn api_url(&self, endpoint: &str) -> String {
        let base = self.api_base_url.lock().expect("api base url mutex poisoned");
        let base = base.trim_end_matches('/');
        if endpoint.starts_with('/') {
            format!("{base}/api{endpoint}")
        } else {
            format!("{base}/api/{endpoint}")
        }
    }

    pub fn api_base_url(&self) -> String {
        self.api_base_url
            .lock()
            .expect("api base url mutex poisoned")
            .clone()
    }

    pub fn set_api_base_url(&self, url: &str) -> bool {
        *self.api_base_url.lock().expect("api base url mutex poisoned") = url.to_string();
        self.set_shared("apiBaseUrl", Value::String(url.to_string()))
    }

    fn restore_from_url(&self) {
        let current = self.host.current_url();
        let url = match Url::parse(&current) {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!("cannot read query of '{current}': {error}");
                return;
            }
        };

        let mut data = self.get_shared();
        for (key, value) in url.query_pairs() {
            data.insert(key.into_owned(), Value::String(value.into_owned()));
        }
        if data.is_empty() {
            return;
        }
        if let Err(error) = self.write(&data) {
            tracing::error!("failed to seed shared page data from url: {error}");
        }
    }

    fn write(&self, data: &Map<String, Value>) -> Result<(), StorageError> {
        write_json(self.store.as_ref(), &self.storage_key, data)
    }
}

fn query_value(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        Value::Bool(flag) => Some(flag.to_string()),
        _ => None,
    }
}
