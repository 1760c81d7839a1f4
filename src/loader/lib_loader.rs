use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde_json::json;

use super::{LoadError, ScriptFetcher};
use crate::bus::event_types::{EVENT_LIBRARY_FAILED, EVENT_LIBRARY_LOADED};
use crate::bus::EventBus;
use crate::config::LoaderConfig;
use crate::host::PageHost;

type LoadFuture = Shared<BoxFuture<'static, Result<String, LoadError>>>;

/// An external script with a bundled copy and CDN mirrors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySpec {
    pub name: String,
    pub local_path: String,
    pub cdn_urls: Vec<String>,
}

impl LibrarySpec {
    /// Local copy first, then the CDNs in order.
    pub fn sources(&self) -> Vec<String> {
        std::iter::once(self.local_path.clone())
            .chain(self.cdn_urls.iter().cloned())
            .collect()
    }
}

/// The charting library.
pub fn plotly() -> LibrarySpec {
    LibrarySpec {
        name: "plotly".to_string(),
        local_path: "/assets/libs/plotly.min.js".to_string(),
        cdn_urls: vec![
            "https://cdn.plot.ly/plotly-3.1.0.min.js".to_string(),
            "https://unpkg.com/plotly.js@2.26.0/dist/plotly.min.js".to_string(),
            "https://cdnjs.cloudflare.com/ajax/libs/plotly.js/2.26.0/plotly.min.js".to_string(),
            "https://cdn.jsdelivr.net/npm/plotly.js@2.26.0/dist/plotly.min.js".to_string(),
        ],
    }
}

/// Pages that render charts need the charting library up front.
pub fn page_needs_charts(url: &str) -> bool {
    let path = match reqwest::Url::parse(url) {
        Ok(parsed) => parsed.path().to_string(),
        Err(_) => url.to_string(),
    };
    path.contains("visualization") || path.contains("prediction")
}

struct LoaderInner {
    fetcher: Arc<dyn ScriptFetcher>,
    host: Arc<dyn PageHost>,
    bus: EventBus,
    loaded: DashMap<String, String>,
    in_flight: DashMap<String, LoadFuture>,
    script_timeout: Duration,
    fallback_delay: Duration,
}

/// Loads each library at most once; concurrent callers share one attempt.
#[derive(Clone)]
pub struct LibLoader {
    inner: Arc<LoaderInner>,
}

impl LibLoader {
    pub fn new(
        fetcher: Arc<dyn ScriptFetcher>,
        host: Arc<dyn PageHost>,
        bus: EventBus,
        config: &LoaderConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                fetcher,
                host,
                bus,
                loaded: DashMap::new(),
                in_flight: DashMap::new(),
                script_timeout: Duration::from_millis(config.script_timeout_ms),
                fallback_delay: Duration::from_millis(config.fallback_delay_ms),
            }),
        }
    }

    pub fn is_loaded(&self, library: &str) -> bool {
        self.inner.loaded.contains_key(library)
    }

    /// Source the library was loaded from.
    pub fn loaded_source(&self, library: &str) -> Option<String> {
        self.inner
            .loaded
            .get(library)
            .map(|source| source.value().clone())
    }

    /// Load `spec`, returning the source that worked.
    ///
    /// A failed load leaves nothing behind, so a later call tries again.
    pub async fn load(&self, spec: &LibrarySpec) -> Result<String, LoadError> {
        if let Some(source) = self.loaded_source(&spec.name) {
            return Ok(source);
        }

        let attempt = match self.inner.in_flight.entry(spec.name.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let inner = self.inner.clone();
                let spec = spec.clone();
                let attempt = async move {
                    let result = inner.load_from_sources(&spec).await;
                    inner.in_flight.remove(&spec.name);
                    result
                }
                .boxed()
                .shared();
                entry.insert(attempt.clone());
                attempt
            }
        };

        attempt.await
    }

    /// Load the charting library when the host page renders charts.
    pub async fn load_for_current_page(&self) -> Option<Result<String, LoadError>> {
        if !page_needs_charts(&self.inner.host.current_url()) {
            return None;
        }
        Some(self.load(&plotly()).await)
    }
}

impl LoaderInner {
    async fn load_from_sources(&self, spec: &LibrarySpec) -> Result<String, LoadError> {
        // a concurrent attempt may have finished before this one was registered
        if let Some(source) = self.loaded.get(&spec.name).map(|source| source.value().clone()) {
            return Ok(source);
        }

        let sources = spec.sources();
        let cdn_count = spec.cdn_urls.len();
        let mut attempts = Vec::with_capacity(sources.len());
        self.host.show_status(&format!("Loading {}...", spec.name));

        for (index, src) in sources.iter().enumerate() {
            if index > 0 {
                self.host
                    .show_status(&format!("Trying CDN {index}/{cdn_count}..."));
            }

            match self.fetch_with_timeout(src).await {
                Ok(()) => {
                    self.loaded.insert(spec.name.clone(), src.clone());
                    self.host.clear_status();
                    tracing::info!(library = %spec.name, src = %src, "library loaded");
                    self.bus.publish(
                        EVENT_LIBRARY_LOADED,
                        json!({ "library": spec.name, "source": src }),
                    );
                    return Ok(src.clone());
                }
                Err(error) => {
                    tracing::warn!(library = %spec.name, "{error}");
                    attempts.push(error.to_string());
                }
            }

            let is_cdn = index > 0;
            let is_last = index + 1 == sources.len();
            if is_cdn && !is_last && !self.fallback_delay.is_zero() {
                tokio::time::sleep(self.fallback_delay).await;
            }
        }

        let error = LoadError::AllSourcesFailed {
            library: spec.name.clone(),
            attempts,
        };
        tracing::error!(library = %spec.name, "{error}");
        self.host.show_error(&format!(
            "Failed to load {}. Check the network connection and reload the page.",
            spec.name
        ));
        self.bus.publish(
            EVENT_LIBRARY_FAILED,
            json!({ "library": spec.name, "error": error.to_string() }),
        );
        Err(error)
    }

    async fn fetch_with_timeout(&self, src: &str) -> Result<(), LoadError> {
        match tokio::time::timeout(self.script_timeout, self.fetcher.fetch(src)).await {
            Ok(result) => result,
            Err(_) => Err(LoadError::Timeout {
                src: src.to_string(),
                timeout_ms: self.script_timeout.as_millis() as u64,
            }),
        }
    }
}
