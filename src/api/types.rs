use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(Value),
    /// `multipart/form-data` with the payload under the `file` part.
    Multipart {
        file_name: String,
        bytes: Vec<u8>,
        fields: Vec<(String, String)>,
    },
}

/// Fully resolved request, as request interceptors see it.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestConfig {
    pub method: Method,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Duration,
    pub retries: u32,
    pub retry_delay: Duration,
}

impl RequestConfig {
    /// Set a query parameter, replacing earlier values of the same name.
    pub fn set_query(&mut self, name: &str, value: impl Into<String>) {
        self.query.retain(|(existing, _)| existing != name);
        self.query.push((name.to_string(), value.into()));
    }

    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Per-call overrides of the client defaults.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    pub headers: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub retry_delay: Option<Duration>,
}

impl RequestOptions {
    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

/// Body decoded by content type: JSON, `text/*`, or raw bytes otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
    /// Body not buffered (streamed downloads) or absent.
    Empty,
}

impl ResponseData {
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub data: ResponseData,
    pub status: u16,
    pub status_text: String,
    /// Header names are lower-case.
    pub headers: BTreeMap<String, String>,
}
