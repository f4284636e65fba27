//! Authenticated proxy orchestration
//!
//! Every protected route funnels through [`proxy_request`]:
//!
//! 1. read the credential pair off the request (401 if both halves missing)
//! 2. forward with the access token, possibly none
//! 3. on a 401 with a refresh token available, refresh exactly once
//! 4. on a successful refresh, replay the identical request once more
//! 5. stream the final upstream response back and write any rotated
//!    credentials into the browser's cookies
//!
//! Worst case is two forwards and one refresh per inbound request. Axum drops
//! the handler future when the client disconnects, which aborts whichever
//! upstream call is in flight.

use axum::body::Body;
use axum::extract::Request;
use axum::http::uri::Uri;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum_extra::extract::cookie::CookieJar;
use session_auth::{CookiePolicy, CredentialPair, RefreshResult};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use upstream::{ForwardRequest, Upstream, UpstreamError, UpstreamResponse};

use crate::error::{ApiError, Result};
use crate::metrics;

/// Response header echoing the id used in this request's logs.
pub const REQUEST_ID_HEADER: HeaderName = HeaderName::from_static("x-request-id");

/// Shared state passed to proxy handlers via the axum State extractor
#[derive(Clone)]
pub struct ProxyState {
    /// `None` when no upstream base URL is configured.
    pub upstream: Option<Arc<dyn Upstream>>,
    pub cookies: CookiePolicy,
    pub max_body_bytes: usize,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
}

impl ProxyState {
    pub fn upstream(&self) -> Result<&Arc<dyn Upstream>> {
        self.upstream.as_ref().ok_or(ApiError::Misconfigured)
    }
}

/// Where a route sends its request upstream and which optional headers it
/// forwards.
#[derive(Debug, Clone)]
pub struct ProxyTarget {
    path: String,
    forward_query: bool,
    extra_headers: &'static [&'static str],
}

impl ProxyTarget {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            forward_query: false,
            extra_headers: &[],
        }
    }

    /// Append the inbound query string to the upstream URL.
    pub fn with_query(mut self) -> Self {
        self.forward_query = true;
        self
    }

    pub fn with_headers(mut self, extra: &'static [&'static str]) -> Self {
        self.extra_headers = extra;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn url(&self, base: &str, uri: &Uri) -> String {
        match uri.query().filter(|q| self.forward_query && !q.is_empty()) {
            Some(query) => format!("{base}{}?{query}", self.path),
            None => format!("{base}{}", self.path),
        }
    }
}

/// Outcome of the retry protocol for one inbound request.
#[derive(Debug)]
pub struct Exchange {
    pub outcome: std::result::Result<UpstreamResponse, UpstreamError>,
    /// Set only when a refresh produced a new access token.
    pub rotation: Option<RefreshResult>,
    pub attempts: u8,
}

/// Generate a request id for logs and the `x-request-id` header.
pub fn new_request_id() -> String {
    format!("req_{}", uuid::Uuid::new_v4().as_simple())
}

/// Run the forward / refresh / replay protocol.
///
/// A second 401 (or any other status) after a successful refresh is final.
pub async fn run_exchange(
    upstream: &dyn Upstream,
    request: &ForwardRequest,
    credentials: &CredentialPair,
) -> Exchange {
    let first = match upstream.forward(request, credentials.access()).await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, method = %request.method, url = %request.url, retry = false, "upstream request failed");
            return Exchange {
                outcome: Err(e),
                rotation: None,
                attempts: 1,
            };
        }
    };

    let refresh_token = match credentials.refresh() {
        Some(token) if first.status == StatusCode::UNAUTHORIZED => token,
        _ => {
            return Exchange {
                outcome: Ok(first),
                rotation: None,
                attempts: 1,
            };
        }
    };

    info!(method = %request.method, url = %request.url, "upstream returned 401, refreshing credentials");
    let refreshed = upstream.refresh(refresh_token).await;
    let Some(new_access) = refreshed.new_access_token.clone() else {
        info!(method = %request.method, url = %request.url, "refresh failed, returning first 401");
        return Exchange {
            outcome: Ok(first),
            rotation: None,
            attempts: 1,
        };
    };
    drop(first);

    let second = upstream.forward(request, Some(&new_access)).await;
    match &second {
        Ok(response) => {
            debug!(status = response.status.as_u16(), retry = true, "upstream responded after refresh");
        }
        Err(e) => {
            warn!(error = %e, method = %request.method, url = %request.url, retry = true, "upstream request failed");
        }
    }

    Exchange {
        outcome: second,
        rotation: Some(refreshed),
        attempts: 2,
    }
}

/// Authenticated proxy entry point used by every protected route.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %target.path()))]
pub async fn proxy_request(
    state: &ProxyState,
    target: ProxyTarget,
    request: Request,
    request_id: String,
) -> Response {
    let method = request.method().clone();
    observe(state, &request_id, method, authenticated(state, &target, request)).await
}

/// Forward without credentials and without the refresh cycle, for public
/// endpoints such as login-id availability checks.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %target.path()))]
pub async fn passthrough(
    state: &ProxyState,
    target: ProxyTarget,
    request: Request,
    request_id: String,
) -> Response {
    let method = request.method().clone();
    observe(state, &request_id, method, anonymous(state, &target, request)).await
}

/// Answer a request whose route-level validation failed. A missing upstream
/// still wins over the validation error.
pub async fn reject(state: &ProxyState, error: ApiError, method: Method, request_id: String) -> Response {
    observe(state, &request_id, method, async {
        state.upstream()?;
        Err::<Response, _>(error)
    })
    .await
}

/// Count, time and tag one handled request.
pub(crate) async fn observe(
    state: &ProxyState,
    request_id: &str,
    method: Method,
    work: impl Future<Output = Result<Response>>,
) -> Response {
    let started = Instant::now();
    state.requests_total.fetch_add(1, Ordering::Relaxed);

    let mut response = match work.await {
        Ok(response) => response,
        Err(e) => {
            let status = e.status();
            if status.is_server_error() {
                error!(status = status.as_u16(), error = %e, "request failed");
            } else {
                debug!(status = status.as_u16(), error = %e, "request rejected");
            }
            e.into_response()
        }
    };

    if response.status().is_server_error() {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
    }
    metrics::record_request(
        response.status().as_u16(),
        method.as_str(),
        started.elapsed().as_secs_f64(),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

async fn authenticated(state: &ProxyState, target: &ProxyTarget, request: Request) -> Result<Response> {
    let upstream = state.upstream()?;
    let credentials = session_auth::extract(request.headers());
    if credentials.is_empty() {
        return Err(ApiError::Unauthorized);
    }

    let forward = buffer_request(state, upstream.base_url(), target, request)
        .await?
        .with_refresh_token(credentials.refresh_token.clone());
    let exchange = run_exchange(upstream.as_ref(), &forward, &credentials).await;
    Ok(render(exchange, &state.cookies))
}

async fn anonymous(state: &ProxyState, target: &ProxyTarget, request: Request) -> Result<Response> {
    let upstream = state.upstream()?;
    let forward = buffer_request(state, upstream.base_url(), target, request).await?;
    match upstream.forward(&forward, None).await {
        Ok(response) => Ok(stream_response(response)),
        Err(e) => {
            warn!(error = %e, method = %forward.method, url = %forward.url, retry = false, "upstream request failed");
            metrics::record_upstream_error(e.kind());
            Err(e.into())
        }
    }
}

/// Buffer the inbound body once so it can be replayed after a refresh.
async fn buffer_request(
    state: &ProxyState,
    base: &str,
    target: &ProxyTarget,
    request: Request,
) -> Result<ForwardRequest> {
    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, state.max_body_bytes)
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;

    Ok(ForwardRequest::new(
        parts.method,
        target.url(base, &parts.uri),
        &parts.headers,
        target.extra_headers,
    )
    .with_body(Some(bytes)))
}

/// Turn an exchange into the browser response, attaching rotation cookies
/// whenever the refresh succeeded, even if the replay then failed.
pub fn render(exchange: Exchange, policy: &CookiePolicy) -> Response {
    let jar = exchange
        .rotation
        .iter()
        .flat_map(|rotation| policy.rotation_cookies(rotation))
        .fold(CookieJar::default(), |jar, cookie| jar.add(cookie));

    let response = match exchange.outcome {
        Ok(upstream) => stream_response(upstream),
        Err(e) => {
            metrics::record_upstream_error(e.kind());
            ApiError::from(e).into_response()
        }
    };
    (jar, response).into_response()
}

/// Status, allow-listed headers and the unbuffered upstream body.
fn stream_response(upstream: UpstreamResponse) -> Response {
    let headers = upstream.filtered_headers();
    let mut response = Response::new(Body::from_stream(upstream.body));
    *response.status_mut() = upstream.status;
    *response.headers_mut() = headers;
    response
}
