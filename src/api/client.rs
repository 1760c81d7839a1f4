use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Method, Url};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use super::error::ApiError;
use super::interceptors::{
    CacheBuster, FnInterceptor, RequestInterceptor, RequestLogger, ResponseInterceptor,
    ResponseLogger,
};
use super::types::{ApiResponse, RequestBody, RequestConfig, RequestOptions, ResponseData};
use crate::config::ApiConfig;

/// HTTP client for the backend: per-attempt timeouts, fixed-delay retries and
/// interceptor chains.
pub struct ApiClient {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    upload_timeout: Duration,
    download_timeout: Duration,
    retries: u32,
    retry_delay: Duration,
    request_interceptors: RwLock<Vec<Arc<dyn RequestInterceptor>>>,
    response_interceptors: RwLock<Vec<Arc<dyn ResponseInterceptor>>>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, ApiError> {
        let base_url = config.base_url.trim();
        Url::parse(base_url)
            .map_err(|error| ApiError::InvalidUrl(format!("{base_url}: {error}")))?;

        Ok(Self {
            client: reqwest::Client::builder()
                .build()
                .map_err(|error| ApiError::Transport(error.to_string()))?,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout: Duration::from_millis(config.timeout_ms),
            upload_timeout: Duration::from_millis(config.upload_timeout_ms),
            download_timeout: Duration::from_millis(config.download_timeout_ms),
            retries: config.retries,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            request_interceptors: RwLock::new(Vec::new()),
            response_interceptors: RwLock::new(Vec::new()),
        })
    }

    /// Install GET cache busting plus request/response logging.
    pub fn with_default_interceptors(self) -> Self {
        self.add_request_interceptor(CacheBuster);
        self.add_request_interceptor(RequestLogger);
        self.add_response_interceptor(ResponseLogger);
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn add_request_interceptor(&self, interceptor: impl RequestInterceptor + 'static) {
        self.request_interceptors
            .write()
            .expect("request interceptors lock poisoned")
            .push(Arc::new(interceptor));
    }

    pub fn add_response_interceptor(&self, interceptor: impl ResponseInterceptor + 'static) {
        self.response_interceptors
            .write()
            .expect("response interceptors lock poisoned")
            .push(Arc::new(interceptor));
    }

    /// Closure form of [`add_request_interceptor`](Self::add_request_interceptor).
    pub fn on_request<F, Fut>(&self, callback: F)
    where
        F: Fn(RequestConfig) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RequestConfig, ApiError>> + Send + 'static,
    {
        self.add_request_interceptor(FnInterceptor::<F, RequestConfig>::new(callback));
    }

    /// Closure form of [`add_response_interceptor`](Self::add_response_interceptor).
    pub fn on_response<F, Fut>(&self, callback: F)
    where
        F: Fn(ApiResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ApiResponse, ApiError>> + Send + 'static,
    {
        self.add_response_interceptor(FnInterceptor::<F, ApiResponse>::new(callback));
    }

    /// Absolute URLs pass through; anything else is appended to the base URL.
    pub fn build_url(&self, url: &str) -> String {
        if url.starts_with("http://") || url.starts_with("https://") {
            return url.to_string();
        }
        if url.starts_with('/') {
            format!("{}{url}", self.base_url)
        } else {
            format!("{}/{url}", self.base_url)
        }
    }

    pub async fn get(&self, url: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request(Method::GET, url, RequestBody::Empty, options).await
    }

    pub async fn post(
        &self,
        url: &str,
        data: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::POST, url, RequestBody::Json(data), options)
            .await
    }

    pub async fn put(
        &self,
        url: &str,
        data: Value,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        self.request(Method::PUT, url, RequestBody::Json(data), options)
            .await
    }

    pub async fn delete(&self, url: &str, options: RequestOptions) -> Result<ApiResponse, ApiError> {
        self.request(Method::DELETE, url, RequestBody::Empty, options)
            .await
    }

    /// POST `bytes` as the `file` part of a multipart form, with extra text
    /// fields alongside.
    pub async fn upload(
        &self,
        url: &str,
        file_name: &str,
        bytes: Vec<u8>,
        fields: &[(&str, &str)],
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let options = RequestOptions {
            timeout: options.timeout.or(Some(self.upload_timeout)),
            ..options
        };
        let body = RequestBody::Multipart {
            file_name: file_name.to_string(),
            bytes,
            fields: fields
                .iter()
                .map(|(name, value)| ((*name).to_string(), (*value).to_string()))
                .collect(),
        };
        self.request(Method::POST, url, body, options).await
    }

    /// Stream the body of a GET to `destination`; returns the bytes written.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
        options: RequestOptions,
    ) -> Result<u64, ApiError> {
        let options = RequestOptions {
            timeout: options.timeout.or(Some(self.download_timeout)),
            ..options
        };
        let config = self
            .prepare(Method::GET, url, RequestBody::Empty, options)
            .await?;
        let response = self.send_with_retry(&config).await?;
        let metadata = response_metadata(&response, ResponseData::Empty);

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        // the body lands in a sibling file and replaces `destination` only once complete
        let partial = partial_path(destination);
        let written = match stream_to_file(response, &partial).await {
            Ok(written) => written,
            Err(error) => {
                if let Err(cleanup) = tokio::fs::remove_file(&partial).await {
                    tracing::warn!(path = %partial.display(), "failed to remove partial download: {cleanup}");
                }
                return Err(error);
            }
        };
        tokio::fs::rename(&partial, destination).await?;

        self.apply_response_interceptors(metadata).await?;
        tracing::debug!(url = %config.url, bytes = written, path = %destination.display(), "download finished");
        Ok(written)
    }

    pub async fn request(
        &self,
        method: Method,
        url: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<ApiResponse, ApiError> {
        let config = self.prepare(method, url, body, options).await?;
        let response = self.send_with_retry(&config).await?;
        let response = decode_response(response).await?;
        self.apply_response_interceptors(response).await
    }

    async fn prepare(
        &self,
        method: Method,
        url: &str,
        body: RequestBody,
        options: RequestOptions,
    ) -> Result<RequestConfig, ApiError> {
        let config = RequestConfig {
            method,
            url: self.build_url(url),
            headers: options.headers,
            query: options.query,
            body,
            timeout: options.timeout.unwrap_or(self.timeout),
            retries: options.retries.unwrap_or(self.retries),
            retry_delay: options.retry_delay.unwrap_or(self.retry_delay),
        };

        let config = self.apply_request_interceptors(config).await?;
        Url::parse(&config.url)
            .map_err(|error| ApiError::InvalidUrl(format!("{}: {error}", config.url)))?;
        Ok(config)
    }

    async fn apply_request_interceptors(
        &self,
        mut config: RequestConfig,
    ) -> Result<RequestConfig, ApiError> {
        let chain: Vec<Arc<dyn RequestInterceptor>> = self
            .request_interceptors
            .read()
            .expect("request interceptors lock poisoned")
            .clone();
        for interceptor in chain {
            config = interceptor.intercept(config).await?;
        }
        Ok(config)
    }

    async fn apply_response_interceptors(
        &self,
        mut response: ApiResponse,
    ) -> Result<ApiResponse, ApiError> {
        let chain: Vec<Arc<dyn ResponseInterceptor>> = self
            .response_interceptors
            .read()
            .expect("response interceptors lock poisoned")
            .clone();
        for interceptor in chain {
            response = interceptor.intercept(response).await?;
        }
        Ok(response)
    }

    /// Up to `retries + 1` attempts with a fixed delay between them; the last
    /// error wins.
    async fn send_with_retry(&self, config: &RequestConfig) -> Result<reqwest::Response, ApiError> {
        let mut attempt: u32 = 0;
        loop {
            match self.send_once(config).await {
                Ok(response) => return Ok(response),
                Err(error) if attempt >= config.retries => {
                    tracing::error!(
                        method = %config.method,
                        url = %config.url,
                        attempts = attempt + 1,
                        "request failed: {error}"
                    );
                    return Err(error);
                }
                Err(error) => {
                    attempt += 1;
                    tracing::warn!(
                        method = %config.method,
                        url = %config.url,
                        "request failed, retrying ({attempt}/{}): {error}",
                        config.retries
                    );
                    if !config.retry_delay.is_zero() {
                        tokio::time::sleep(config.retry_delay).await;
                    }
                }
            }
        }
    }

    async fn send_once(&self, config: &RequestConfig) -> Result<reqwest::Response, ApiError> {
        let mut builder = self
            .client
            .request(config.method.clone(), &config.url)
            .timeout(config.timeout);
        for (name, value) in &config.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !config.query.is_empty() {
            builder = builder.query(&config.query);
        }
        builder = match &config.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Multipart {
                file_name,
                bytes,
                fields,
            } => {
                let mut form = Form::new().part(
                    "file",
                    Part::bytes(bytes.clone()).file_name(file_name.clone()),
                );
                for (name, value) in fields {
                    form = form.text(name.clone(), value.clone());
                }
                builder.multipart(form)
            }
        };

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status {
                status: status.as_u16(),
                status_text: status.canonical_reason().unwrap_or_default().to_string(),
            });
        }
        Ok(response)
    }
}

fn response_metadata(response: &reqwest::Response, data: ResponseData) -> ApiResponse {
    let status = response.status();
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect();
    ApiResponse {
        data,
        status: status.as_u16(),
        status_text: status.canonical_reason().unwrap_or_default().to_string(),
        headers,
    }
}

async fn decode_response(response: reqwest::Response) -> Result<ApiResponse, ApiError> {
    let mut decoded = response_metadata(&response, ResponseData::Empty);
    let content_type = decoded
        .headers
        .get("content-type")
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default();

    decoded.data = if content_type.contains("application/json") {
        let body = response.bytes().await?;
        if body.is_empty() {
            ResponseData::Empty
        } else {
            ResponseData::Json(serde_json::from_slice(&body).map_err(|error| {
                ApiError::Decode(format!("failed to parse JSON response: {error}"))
            })?)
        }
    } else if content_type.contains("text/") {
        ResponseData::Text(response.text().await?)
    } else {
        let body = response.bytes().await?;
        if body.is_empty() {
            ResponseData::Empty
        } else {
            ResponseData::Bytes(body.to_vec())
        }
    };
    Ok(decoded)
}

fn partial_path(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}

async fn stream_to_file(response: reqwest::Response, path: &Path) -> Result<u64, ApiError> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written: u64 = 0;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}
