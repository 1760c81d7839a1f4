use async_trait::async_trait;
use reqwest::Url;

use super::LoadError;
use crate::config::LoaderConfig;

/// Retrieves one script. `Ok` means the script is available to the page.
#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    async fn fetch(&self, src: &str) -> Result<(), LoadError>;
}

/// Fetches scripts over HTTP; relative paths resolve against the asset origin.
pub struct HttpScriptFetcher {
    client: reqwest::Client,
    asset_base_url: Url,
}

impl HttpScriptFetcher {
    pub fn new(config: &LoaderConfig) -> Result<Self, LoadError> {
        let asset_base_url = Url::parse(config.asset_base_url.trim()).map_err(|error| {
            LoadError::InvalidUrl(format!("{}: {error}", config.asset_base_url))
        })?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|error| LoadError::Source {
                src: asset_base_url.to_string(),
                reason: error.to_string(),
            })?;
        Ok(Self {
            client,
            asset_base_url,
        })
    }

    pub fn resolve(&self, src: &str) -> Result<Url, LoadError> {
        self.asset_base_url
            .join(src)
            .map_err(|error| LoadError::InvalidUrl(format!("{src}: {error}")))
    }
}

#[async_trait]
impl ScriptFetcher for HttpScriptFetcher {
    async fn fetch(&self, src: &str) -> Result<(), LoadError> {
        let url = self.resolve(src)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|error| LoadError::Source {
                src: src.to_string(),
                reason: error.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::Source {
                src: src.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }

        // The script only counts as loaded once its body arrived.
        let body = response.bytes().await.map_err(|error| LoadError::Source {
            src: src.to_string(),
            reason: error.to_string(),
        })?;
        tracing::debug!(src, bytes = body.len(), "script fetched");
        Ok(())
    }
}
