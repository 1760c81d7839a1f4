//! Local-first, CDN-fallback loading of external scripts.

mod fetcher;
mod lib_loader;

pub use fetcher::{HttpScriptFetcher, ScriptFetcher};
pub use lib_loader::{page_needs_charts, plotly, LibLoader, LibrarySpec};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("failed to load {src}: {reason}")]
    Source { src: String, reason: String },
    #[error("loading {src} timed out after {timeout_ms} ms")]
    Timeout { src: String, timeout_ms: u64 },
    #[error("invalid script url: {0}")]
    InvalidUrl(String),
    #[error("all sources for {library} failed: {}", .attempts.join("; "))]
    AllSourcesFailed {
        library: String,
        attempts: Vec<String>,
    },
}
