//! HTTP client for the daplot backend.

mod client;
mod error;
mod interceptors;
mod types;


pub use client::ApiClient;
pub use error::ApiError;
pub use interceptors::{
    CacheBuster, RequestInterceptor, RequestLogger, ResponseInterceptor, ResponseLogger,
    CACHE_BUST_PARAM,
};
pub use types::{ApiResponse, RequestBody, RequestConfig, RequestOptions, ResponseData};
