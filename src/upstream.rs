//! Outbound request/response types and the transport seam.
//!
//! [`Transport`] is what [`crate::http_retry::fetch_with_retry`] talks to.
//! Production code uses [`HttpTransport`] (a pooled `reqwest::Client`);
//! tests swap in transports that fail on demand or serve canned bodies.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, TryStreamExt, stream};
use reqwest::{Client, Method, StatusCode, header::CONTENT_TYPE, header::HeaderMap};
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Streaming response body.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Failure below the HTTP layer: the request never produced a response,
/// or its body could not be read.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream request timed out")]
    Timeout,
    #[error("failed to connect to upstream: {0}")]
    Connect(String),
    #[error("failed to read upstream body: {0}")]
    Body(String),
    #[error("upstream request failed: {0}")]
    Other(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout
        } else if e.is_connect() {
            Self::Connect(e.to_string())
        } else if e.is_body() || e.is_decode() {
            Self::Body(e.to_string())
        } else {
            Self::Other(e.to_string())
        }
    }
}

/// A fully described outbound request. Cloneable so every retry attempt
/// sends identical parameters.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl UpstreamRequest {
    /// Plain GET with no extra headers.
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }
}

/// Response as seen by the proxy. `url` is the final URL after any
/// transport-level redirects.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub url: Url,
    pub body: ByteStream,
}

impl UpstreamResponse {
    /// Build a response around an in-memory body.
    pub fn buffered(status: StatusCode, url: Url, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self {
            status,
            headers,
            url,
            body: stream::once(async move { Ok(body) }).boxed(),
        }
    }

    /// The declared `Content-Type`, if it is valid UTF-8.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Error from [`collect_limited`].
#[derive(Debug, Error)]
pub enum CollectError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("body exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Drain a body stream into memory, refusing to grow past `limit` bytes.
///
/// `prefix` is a chunk already pulled off the stream (e.g. while sniffing).
pub async fn collect_limited(
    prefix: Option<Bytes>,
    mut body: ByteStream,
    limit: usize,
) -> Result<Bytes, CollectError> {
    let mut buf = BytesMut::new();
    if let Some(chunk) = prefix {
        buf.extend_from_slice(&chunk);
    }
    if buf.len() > limit {
        return Err(CollectError::TooLarge { limit });
    }

    while let Some(chunk) = body.next().await {
        let chunk = chunk?;
        if buf.len() + chunk.len() > limit {
            return Err(CollectError::TooLarge { limit });
        }
        buf.extend_from_slice(&chunk);
    }

    Ok(buf.freeze())
}

/// Something that can send an [`UpstreamRequest`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request. `timeout` bounds the wait for response headers;
    /// `None` means wait indefinitely.
    async fn send(
        &self,
        request: &UpstreamRequest,
        timeout: Option<Duration>,
    ) -> Result<UpstreamResponse, TransportError>;
}

/// [`Transport`] backed by a shared `reqwest::Client`.
///
/// Redirects are followed by the client, so one `send` is one logical fetch.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(
        &self,
        request: &UpstreamRequest,
        timeout: Option<Duration>,
    ) -> Result<UpstreamResponse, TransportError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        // Only the wait for headers is bounded; segment bodies may
        // legitimately take longer than the timeout to stream.
        let pending = builder.send();
        let response = match timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| TransportError::Timeout)??,
            None => pending.await?,
        };

        Ok(UpstreamResponse {
            status: response.status(),
            headers: response.headers().clone(),
            url: response.url().clone(),
            body: response.bytes_stream().map_err(TransportError::from).boxed(),
        })
    }
}
