//! Header allow-lists for both directions across the proxy boundary.
//!
//! Only the names listed here ever cross. Everything else, including the
//! browser's own cookies and any `set-cookie` the upstream emits, stays on
//! its side.

use common::Secret;
use reqwest::header::{AUTHORIZATION, COOKIE, HeaderMap, HeaderValue};
use session_auth::REFRESH_COOKIE;

use crate::{Result, UpstreamError};

/// Forwarded by order and payment routes.
pub const IDEMPOTENCY_KEY: &str = "idempotency-key";

/// Inbound headers always copied to the upstream request.
pub const FORWARDED_REQUEST_HEADERS: &[&str] = &["accept", "accept-language", "user-agent"];

/// Inbound headers a route may opt into.
pub const CONDITIONAL_REQUEST_HEADERS: &[&str] = &["content-type", IDEMPOTENCY_KEY];

/// Upstream response headers copied back to the browser.
pub const FORWARDED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "cache-control",
    "etag",
    "vary",
    "content-length",
    "content-disposition",
];

fn is_listed(list: &[&str], name: &str) -> bool {
    list.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Copy the allow-listed subset of `inbound`, plus any of `extra` that are
/// in [`CONDITIONAL_REQUEST_HEADERS`].
pub fn select_request_headers(inbound: &HeaderMap, extra: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        let opted_in = is_listed(CONDITIONAL_REQUEST_HEADERS, name_str) && is_listed(extra, name_str);
        if is_listed(FORWARDED_REQUEST_HEADERS, name_str) || opted_in {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Copy the allow-listed subset of an upstream response's headers.
pub fn select_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        if is_listed(FORWARDED_RESPONSE_HEADERS, name.as_str()) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Final outbound header set: the forwarded headers, a bearer token when
/// one is non-empty, and a cookie carrying only the refresh credential.
pub fn outbound_headers(
    forwarded: &HeaderMap,
    access_token: Option<&str>,
    refresh_token: Option<&Secret<String>>,
) -> Result<HeaderMap> {
    let mut headers = forwarded.clone();
    if let Some(token) = access_token.filter(|t| !t.is_empty()) {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| UpstreamError::InvalidRequest(format!("invalid access token: {e}")))?;
        headers.insert(AUTHORIZATION, value);
    }
    if let Some(refresh) = refresh_token {
        headers.insert(COOKIE, refresh_cookie_header(refresh.expose())?);
    }
    Ok(headers)
}

/// `refreshToken=<token>` as a header value.
pub fn refresh_cookie_header(token: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(&format!("{REFRESH_COOKIE}={token}"))
        .map_err(|e| UpstreamError::InvalidRequest(format!("invalid refresh token: {e}")))
}
