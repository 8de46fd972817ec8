use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Client;

use crate::error::{ErrorCode, RepoError, Result};

/// Response header advertising server-sent-event support for a key.
pub const SSE_SUPPORT_HEADER: &str = "x-sse-support";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::new(),
            body: Some(body.into()),
        }
    }

    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Response as the repository sees it. Header names are lowercased so
/// lookups are case-insensitive regardless of transport.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|v| v.as_str())
    }

    pub fn supports_sse(&self) -> bool {
        self.header(SSE_SUPPORT_HEADER) == Some("enabled")
    }
}

/// Replaceable HTTP primitive. The default is reqwest-backed; tests swap in
/// scripted transports via `set_polyfills`.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse>;
}

/// Default transport over a shared `reqwest::Client`.
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
        let mut builder = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };

        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(convert_error)?;

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), value.to_string());
            }
        }

        let body = response.text().await.map_err(|e| {
            RepoError::with_source(ErrorCode::InvalidResponse, "failed to read response body", e)
        })?;

        Ok(FetchResponse {
            status,
            headers,
            body,
        })
    }
}

fn convert_error(error: reqwest::Error) -> RepoError {
    if error.is_timeout() {
        RepoError::with_source(ErrorCode::NetworkTimeout, "request timed out", error)
    } else if error.is_connect() {
        RepoError::with_source(ErrorCode::NetworkError, "connection failed", error)
    } else {
        RepoError::with_source(ErrorCode::NetworkError, error.to_string(), error)
    }
}
