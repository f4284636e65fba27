//! Upstream API abstraction for the storefront proxy
//!
//! Defines the `Upstream` trait that decouples the retry protocol from the
//! transport. `HttpUpstream` is the reqwest implementation; tests substitute
//! scripted implementations to observe exactly which calls the orchestrator
//! makes.

pub mod client;
pub mod headers;

pub use headers::{
    CONDITIONAL_REQUEST_HEADERS, FORWARDED_REQUEST_HEADERS, FORWARDED_RESPONSE_HEADERS,
    IDEMPOTENCY_KEY,
};
pub use client::HttpUpstream;

use bytes::{Bytes, BytesMut};
use common::Secret;
use futures_util::stream::{self, BoxStream, StreamExt, TryStreamExt};
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use session_auth::RefreshResult;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Response body as an unbuffered byte stream.
pub type BodyStream = BoxStream<'static, std::result::Result<Bytes, std::io::Error>>;

/// Transport-level failures. Upstream HTTP error statuses are not errors;
/// they come back as an [`UpstreamResponse`] and are passed through.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("upstream timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("invalid upstream request: {0}")]
    InvalidRequest(String),

    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
}

impl UpstreamError {
    /// Network-level failures the client sees as 502.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            Self::Unreachable(_) | Self::Timeout(_) | Self::InvalidResponse(_)
        )
    }

    /// Short label for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => "connection",
            Self::Timeout(_) => "timeout",
            Self::InvalidRequest(_) => "invalid_request",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }
}

/// Result alias for upstream operations.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// One outbound call, fully prepared except for the access token.
///
/// The body is buffered so the identical bytes can be replayed after a
/// refresh. `None` means no body is sent at all.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub refresh_token: Option<Secret<String>>,
    pub body: Option<Bytes>,
}

impl ForwardRequest {
    /// Select the allow-listed inbound headers for `method` and `url`.
    ///
    /// `extra` opts into headers from [`CONDITIONAL_REQUEST_HEADERS`]; any
    /// other name in it is ignored.
    pub fn new(
        method: Method,
        url: impl Into<String>,
        inbound: &HeaderMap,
        extra: &[&str],
    ) -> Self {
        Self {
            method,
            url: url.into(),
            headers: headers::select_request_headers(inbound, extra),
            refresh_token: None,
            body: None,
        }
    }

    pub fn with_refresh_token(mut self, token: Option<Secret<String>>) -> Self {
        self.refresh_token = token;
        self
    }

    /// Attach a body. Zero-length bodies are treated as no body.
    pub fn with_body(mut self, body: Option<Bytes>) -> Self {
        self.body = body.filter(|b| !b.is_empty());
        self
    }
}

/// Upstream reply with status, raw headers and an unbuffered body.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl UpstreamResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: BodyStream) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Response with a fixed body, used by tests and synthetic replies.
    pub fn from_bytes(status: StatusCode, headers: HeaderMap, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self::new(status, headers, stream::once(async move { Ok::<_, std::io::Error>(body) }).boxed())
    }

    /// Headers allowed to reach the browser.
    pub fn filtered_headers(&self) -> HeaderMap {
        headers::select_response_headers(&self.headers)
    }

    /// Buffer the whole body, failing once it exceeds `limit` bytes.
    pub async fn read_to_bytes(self, limit: usize) -> Result<Bytes> {
        let mut body = self.body;
        let mut buf = BytesMut::new();
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| UpstreamError::InvalidResponse(e.to_string()))?
        {
            if buf.len() + chunk.len() > limit {
                return Err(UpstreamError::InvalidResponse(format!(
                    "body exceeds {limit} bytes"
                )));
            }
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// The two calls the proxy makes against the upstream API.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility (`Arc<dyn Upstream>`).
pub trait Upstream: Send + Sync {
    /// Base URL every proxied path is appended to, without a trailing slash.
    fn base_url(&self) -> &str;

    /// Send `request`, authenticating with `access_token` when it is
    /// non-empty. Never retries.
    fn forward<'a>(
        &'a self,
        request: &'a ForwardRequest,
        access_token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse>> + Send + 'a>>;

    /// Exchange a refresh credential once. Every failure mode collapses to
    /// [`RefreshResult::empty`].
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshResult> + Send + 'a>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{CONTENT_TYPE, HeaderValue, SET_COOKIE};

    #[test]
    fn zero_length_body_is_no_body() {
        let request = ForwardRequest::new(
            Method::PATCH,
            "http://upstream/api/account/me",
            &HeaderMap::new(),
            &[],
        )
        .with_body(Some(Bytes::new()));
        assert!(request.body.is_none());
    }

    #[test]
    fn request_debug_hides_refresh_token() {
        let request = ForwardRequest::new(Method::GET, "http://upstream/api/cart", &HeaderMap::new(), &[])
            .with_refresh_token(Some(Secret::new("rt_secret".into())));
        let debug = format!("{request:?}");
        assert!(!debug.contains("rt_secret"), "got: {debug}");
    }

    #[test]
    fn filtered_headers_drop_set_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(SET_COOKIE, HeaderValue::from_static("session=upstream"));
        let response = UpstreamResponse::from_bytes(StatusCode::OK, headers, "{}");
        let filtered = response.filtered_headers();
        assert_eq!(filtered.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(filtered.get(SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn read_to_bytes_collects_chunks() {
        let chunks: Vec<std::result::Result<Bytes, std::io::Error>> =
            vec![Ok(Bytes::from_static(b"ab")), Ok(Bytes::from_static(b"cd"))];
        let response = UpstreamResponse::new(
            StatusCode::OK,
            HeaderMap::new(),
            stream::iter(chunks).boxed(),
        );
        assert_eq!(response.read_to_bytes(16).await.unwrap(), "abcd");
    }

    #[tokio::test]
    async fn read_to_bytes_enforces_limit() {
        let response = UpstreamResponse::from_bytes(StatusCode::OK, HeaderMap::new(), "0123456789");
        let err = response.read_to_bytes(4).await.unwrap_err();
        assert!(matches!(err, UpstreamError::InvalidResponse(_)));
        assert!(err.is_unreachable());
    }

    #[test]
    fn error_kinds_are_stable_labels() {
        assert_eq!(UpstreamError::Timeout(Duration::from_secs(1)).kind(), "timeout");
        assert_eq!(UpstreamError::Unreachable("refused".into()).kind(), "connection");
        assert!(!UpstreamError::InvalidRequest("bad header".into()).is_unreachable());
        assert_eq!(
            UpstreamError::Timeout(Duration::from_millis(1500)).to_string(),
            "upstream timed out after 1500ms"
        );
    }
}
