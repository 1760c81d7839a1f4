//! Script fetcher whose failures are set up front.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use daplot_lib::loader::{LoadError, ScriptFetcher};

/// Records every attempted source; sources marked broken fail.
#[derive(Default)]
pub struct ScriptedFetcher {
    broken: HashSet<String>,
    attempts: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_broken(mut self, src: &str) -> Self {
        self.broken.insert(src.to_string());
        self
    }

    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl ScriptFetcher for ScriptedFetcher {
    async fn fetch(&self, src: &str) -> Result<(), LoadError> {
        self.attempts.lock().unwrap().push(src.to_string());
        if self.broken.contains(src) {
            return Err(LoadError::Source {
                src: src.to_string(),
                reason: "HTTP 404".to_string(),
            });
        }
        Ok(())
    }
}
