use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Method;

use super::error::ApiError;
use super::types::{ApiResponse, RequestConfig};

/// Query parameter carrying the cache-busting timestamp.
pub const CACHE_BUST_PARAM: &str = "_t";

/// Rewrites a request before it is sent. Runs once per call, before retries.
#[async_trait]
pub trait RequestInterceptor: Send + Sync {
    async fn intercept(&self, config: RequestConfig) -> Result<RequestConfig, ApiError>;
}

/// Rewrites a successful response before it is returned.
#[async_trait]
pub trait ResponseInterceptor: Send + Sync {
    async fn intercept(&self, response: ApiResponse) -> Result<ApiResponse, ApiError>;
}

/// Stamps GET requests with the current time so intermediaries cannot serve
/// a cached body.
#[derive(Debug, Default, Clone, Copy)]
pub struct CacheBuster;

#[async_trait]
impl RequestInterceptor for CacheBuster {
    async fn intercept(&self, mut config: RequestConfig) -> Result<RequestConfig, ApiError> {
        if config.method == Method::GET {
            config.set_query(CACHE_BUST_PARAM, Utc::now().timestamp_millis().to_string());
        }
        Ok(config)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RequestLogger;

#[async_trait]
impl RequestInterceptor for RequestLogger {
    async fn intercept(&self, config: RequestConfig) -> Result<RequestConfig, ApiError> {
        tracing::info!(method = %config.method, url = %config.url, "sending request");
        Ok(config)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ResponseLogger;

#[async_trait]
impl ResponseInterceptor for ResponseLogger {
    async fn intercept(&self, response: ApiResponse) -> Result<ApiResponse, ApiError> {
        tracing::info!(
            status = response.status,
            status_text = %response.status_text,
            "request completed"
        );
        Ok(response)
    }
}

/// Adapts an async closure into an interceptor.
pub(crate) struct FnInterceptor<F, T> {
    callback: F,
    _marker: PhantomData<fn(T) -> T>,
}

impl<F, T> FnInterceptor<F, T> {
    pub(crate) fn new(callback: F) -> Self {
        Self {
            callback,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<F, Fut> RequestInterceptor for FnInterceptor<F, RequestConfig>
where
    F: Fn(RequestConfig) -> Fut + Send + Sync,
    Fut: Future<Output = Result<RequestConfig, ApiError>> + Send,
{
    async fn intercept(&self, config: RequestConfig) -> Result<RequestConfig, ApiError> {
        (self.callback)(config).await
    }
}

#[async_trait]
impl<F, Fut> ResponseInterceptor for FnInterceptor<F, ApiResponse>
where
    F: Fn(ApiResponse) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ApiResponse, ApiError>> + Send,
{
    async fn intercept(&self, response: ApiResponse) -> Result<ApiResponse, ApiError> {
        (self.callback)(response).await
    }
}
