//! Shared fixtures for the page-flow integration tests.

pub mod scripted_fetcher;

use std::sync::Arc;

use daplot_lib::config::AppConfig;
use daplot_lib::host::MemoryHost;
use daplot_lib::storage::MemoryStore;
use daplot_lib::AppContext;

pub use scripted_fetcher::ScriptedFetcher;

/// One page's context plus the handles the assertions need.
pub struct OpenPage {
    pub context: AppContext,
    pub host: Arc<MemoryHost>,
    pub fetcher: Arc<ScriptedFetcher>,
}

/// Open a page at `url` over shared stores, with fast retries and loader delays.
pub fn open_page(
    url: &str,
    durable: Arc<MemoryStore>,
    session: Arc<MemoryStore>,
    fetcher: ScriptedFetcher,
) -> OpenPage {
    let host = Arc::new(MemoryHost::new(url));
    let fetcher = Arc::new(fetcher);
    let mut config = AppConfig::default();
    config.api.retries = 1;
    config.api.retry_delay_ms = 0;
    config.loader.fallback_delay_ms = 0;
    let context = AppContext::with_fetcher(config, durable, session, host.clone(), fetcher.clone())
        .expect("page context should build");
    OpenPage {
        context,
        host,
        fetcher,
    }
}
