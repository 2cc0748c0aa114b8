//! HTTP transfer client contract and its reqwest-backed implementation.
//!
//! The engine only ever talks to [`HttpClient`]; dropping the future returned
//! by [`HttpClient::send`] (or the response body stream) aborts the request.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{header, redirect, Client};

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    /// Inclusive byte range; `None` end means "to the end of the resource".
    pub range: Option<(u64, Option<u64>)>,
    /// When false, 3xx responses are returned to the caller untouched.
    pub follow_redirects: bool,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            range: None,
            follow_redirects: false,
        }
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self {
            method: Method::Head,
            ..Self::get(url)
        }
    }

    pub fn with_range(mut self, start: u64, end: Option<u64>) -> Self {
        self.range = Some((start, end));
        self
    }

    pub fn following_redirects(mut self) -> Self {
        self.follow_redirects = true;
        self
    }

    pub fn range_header(&self) -> Option<String> {
        self.range.map(|(start, end)| match end {
            Some(end) => format!("bytes={}-{}", start, end),
            None => format!("bytes={}-", start),
        })
    }
}

pub type BodyStream = BoxStream<'static, Result<Bytes>>;

pub struct HttpResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub location: Option<String>,
    pub body: BodyStream,
}

impl HttpResponse {
    pub fn is_redirect(&self) -> bool {
        matches!(self.status, 301 | 302 | 307 | 308)
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, 200 | 206)
    }

    /// Total resource size advertised by a `Content-Range: bytes a-b/<total>` header.
    pub fn content_range_total(&self) -> Option<u64> {
        self.content_range.as_deref().and_then(parse_content_range_total)
    }
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("location", &self.location)
            .finish_non_exhaustive()
    }
}

pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.rsplit_once('/')?;
    total.trim().parse().ok()
}

#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Production client. Keeps two reqwest clients because segment workers
/// follow redirects themselves while the size probe lets reqwest do it.
pub struct ReqwestClient {
    direct: Client,
    following: Client,
}

impl ReqwestClient {
    pub fn new(config: &EngineConfig) -> Result<Self> {
        let build = |policy: redirect::Policy| {
            Client::builder()
                .user_agent(config.user_agent.clone())
                .connect_timeout(config.request_timeout)
                .redirect(policy)
                .build()
                .map_err(|e| EngineError::Http(e.to_string()))
        };

        Ok(Self {
            direct: build(redirect::Policy::none())?,
            following: build(redirect::Policy::limited(config.max_redirects))?,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let client = if request.follow_redirects {
            &self.following
        } else {
            &self.direct
        };

        let mut builder = match request.method {
            Method::Get => client.get(&request.url),
            Method::Head => client.head(&request.url),
        };
        if let Some(range) = request.range_header() {
            builder = builder.header(header::RANGE, range);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| EngineError::Http(e.to_string()))?;

        let header_str = |name: header::HeaderName| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        // Read Content-Length from the header: for HEAD responses the body size hint is zero.
        let content_length = header_str(header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok());
        let content_range = header_str(header::CONTENT_RANGE);
        let location = header_str(header::LOCATION);
        let status = response.status().as_u16();

        let body = response
            .bytes_stream()
            .map_err(|e| EngineError::Http(e.to_string()))
            .boxed();

        Ok(HttpResponse {
            status,
            content_length,
            content_range,
            location,
            body,
        })
    }
}
