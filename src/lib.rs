//! Client-side glue for the daplot data visualization app.
//!
//! The pieces the pages share, with browser primitives behind traits so the
//! whole layer runs and tests natively:
//! - `bus`: publish/subscribe with namespaces, one-shot and async listeners
//! - `state`: the observable application state and its durable subset
//! - `storage`: key-value stores, the file payload cache and the page bridge
//! - `api`: backend HTTP client with retries, timeouts and interceptors
//! - `loader`: local-first, CDN-fallback script loading
//! - `host`: the page hosting all of the above
//!
//! [`AppContext`] constructs and wires everything for one page.

pub mod api;
pub mod bus;
pub mod config;
pub mod db;
pub mod host;
pub mod loader;
pub mod state;
pub mod storage;

#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;

use api::{ApiClient, ApiError};
use bus::EventBus;
use config::{AppConfig, ConfigError};
use host::PageHost;
use loader::{HttpScriptFetcher, LibLoader, LoadError, ScriptFetcher};
use state::AppState;
use storage::{
    FileCache, KeyValueStore, MemoryStore, PageBridge, PageStateStore, SqliteStore, StorageError,
};

// ---------------------------------------------------------------------------
// Shared error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Network(#[from] ApiError),
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("{0}")]
    Load(#[from] LoadError),
}

impl Serialize for AppError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

// ---------------------------------------------------------------------------
// Composition root
// ---------------------------------------------------------------------------

/// Everything one page needs, wired together.
pub struct AppContext {
    pub config: AppConfig,
    pub bus: EventBus,
    pub state: Arc<AppState>,
    pub files: FileCache,
    pub page_states: PageStateStore,
    pub bridge: Arc<PageBridge>,
    pub api: Arc<ApiClient>,
    pub loader: LibLoader,
    pub host: Arc<dyn PageHost>,
    session: Arc<dyn KeyValueStore>,
}

impl AppContext {
    /// Wire the components over the given stores, fetching scripts over HTTP.
    pub fn new(
        config: AppConfig,
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        host: Arc<dyn PageHost>,
    ) -> Result<Self, AppError> {
        let fetcher = Arc::new(HttpScriptFetcher::new(&config.loader)?);
        Self::with_fetcher(config, durable, session, host, fetcher)
    }

    pub fn with_fetcher(
        config: AppConfig,
        durable: Arc<dyn KeyValueStore>,
        session: Arc<dyn KeyValueStore>,
        host: Arc<dyn PageHost>,
        fetcher: Arc<dyn ScriptFetcher>,
    ) -> Result<Self, AppError> {
        config.validate()?;

        let bus = EventBus::new();
        let state = Arc::new(AppState::new(durable.clone(), host.clone(), &config));

        // a user-chosen backend in the persisted settings wins over the config
        let api_base_url = state
            .get("settings")
            .and_then(|settings| settings.get("apiBaseUrl").and_then(Value::as_str).map(str::to_string))
            .filter(|url| reqwest::Url::parse(url).is_ok())
            .unwrap_or_else(|| config.api.base_url.clone());

        let mut api_config = config.api.clone();
        api_config.base_url = api_base_url.clone();
        let api = Arc::new(ApiClient::new(&api_config)?.with_default_interceptors());

        let files = FileCache::new(durable.clone(), &config.storage);
        let page_states = PageStateStore::new(durable, &config.storage);
        page_states.cleanup_expired();
        let bridge = Arc::new(PageBridge::new(
            session.clone(),
            bus.clone(),
            host.clone(),
            &config.storage.key_prefix,
            &api_base_url,
        ));
        let loader = LibLoader::new(fetcher, host.clone(), bus.clone(), &config.loader);

        tracing::info!(api_base_url = %api_base_url, "application context ready");
        Ok(Self {
            config,
            bus,
            state,
            files,
            page_states,
            bridge,
            api,
            loader,
            host,
            session,
        })
    }

    /// Durable SQLite store in the data directory plus a fresh session store.
    pub fn open(host: Arc<dyn PageHost>) -> Result<Self, AppError> {
        let mut bootstrap = AppConfig::default();
        bootstrap.apply_env_overrides()?;
        let path = bootstrap.storage.durable_store_path()?;
        let durable: Arc<dyn KeyValueStore> = Arc::new(SqliteStore::open(&path)?);

        let config = config::load_config(durable.as_ref())?;
        tracing::info!(path = %path.display(), "durable store opened");
        Self::new(config, durable, Arc::new(MemoryStore::new()), host)
    }

    /// Re-publish shared-data writes from other pages on the bus.
    ///
    /// Needs a tokio runtime; `None` when the session store has no change feed.
    pub fn listen_for_page_updates(&self) -> Option<JoinHandle<()>> {
        let feed = self.session.watch()?;
        Some(self.bridge.spawn_storage_listener(feed))
    }

    /// Housekeeping when the page goes away: drop expired file payloads and
    /// page snapshots. Returns how many records went.
    pub fn on_page_unload(&self) -> usize {
        self.files.sweep(self.config.storage.cache_expiry()) + self.page_states.cleanup_expired()
    }
}

/// Install the `tracing` subscriber; `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("daplot_lib=debug,info")),
        )
        .try_init();
}
