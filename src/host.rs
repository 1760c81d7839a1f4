//! The page hosting the glue layer: its URL, navigation, reloads and the
//! status/error banners the loader draws.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub trait PageHost: Send + Sync {
    /// Absolute URL of the current page, query string included.
    fn current_url(&self) -> String;
    fn navigate(&self, url: &str);
    fn reload(&self);
    fn show_status(&self, message: &str);
    fn clear_status(&self);
    /// Render a blocking error banner.
    fn show_error(&self, message: &str);
}

/// In-process host that records what was asked of it.
///
/// Used for headless runs and tests; navigation updates `current_url`.
pub struct MemoryHost {
    url: Mutex<String>,
    navigations: Mutex<Vec<String>>,
    reloads: AtomicUsize,
    status: Mutex<Option<String>>,
    status_history: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl MemoryHost {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Mutex::new(url.into()),
            navigations: Mutex::new(Vec::new()),
            reloads: AtomicUsize::new(0),
            status: Mutex::new(None),
            status_history: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn navigations(&self) -> Vec<String> {
        self.navigations.lock().expect("host mutex poisoned").clone()
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> Option<String> {
        self.status.lock().expect("host mutex poisoned").clone()
    }

    pub fn status_history(&self) -> Vec<String> {
        self.status_history.lock().expect("host mutex poisoned").clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("host mutex poisoned").clone()
    }
}

impl Default for MemoryHost {
    fn default() -> Self {
        Self::new("http://localhost:8000/index.html")
    }
}

impl PageHost for MemoryHost {
    fn current_url(&self) -> String {
        self.url.lock().expect("host mutex poisoned").clone()
    }

    fn navigate(&self, url: &str) {
        tracing::info!("navigating to {url}");
        *self.url.lock().expect("host mutex poisoned") = url.to_string();
        self.navigations
            .lock()
            .expect("host mutex poisoned")
            .push(url.to_string());
    }

    fn reload(&self) {
        tracing::info!("page reload requested");
        self.reloads.fetch_add(1, Ordering::SeqCst);
    }

    fn show_status(&self, message: &str) {
        *self.status.lock().expect("host mutex poisoned") = Some(message.to_string());
        self.status_history
            .lock()
            .expect("host mutex poisoned")
            .push(message.to_string());
    }

    fn clear_status(&self) {
        *self.status.lock().expect("host mutex poisoned") = None;
    }

    fn show_error(&self, message: &str) {
        tracing::error!("{message}");
        self.errors
            .lock()
            .expect("host mutex poisoned")
            .push(message.to_string());
    }
}
