//! Credential extraction from inbound request headers.

use common::Secret;
use cookie::Cookie;
use http::header::{AUTHORIZATION, COOKIE};
use http::{HeaderMap, HeaderValue};

use crate::constants::{ACCESS_COOKIE, LEGACY_ACCESS_COOKIE, REFRESH_COOKIE};

/// The access/refresh pair a browser presents. Either half may be missing.
#[derive(Debug, Default, Clone)]
pub struct CredentialPair {
    pub access_token: Option<Secret<String>>,
    pub refresh_token: Option<Secret<String>>,
}

impl CredentialPair {
    pub fn new(access_token: Option<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.filter(|t| !t.is_empty()).map(Secret::new),
            refresh_token: refresh_token.filter(|t| !t.is_empty()).map(Secret::new),
        }
    }

    /// True when neither token is present; such requests never reach upstream.
    pub fn is_empty(&self) -> bool {
        self.access_token.is_none() && self.refresh_token.is_none()
    }

    pub fn access(&self) -> Option<&str> {
        self.access_token.as_ref().map(|t| t.expose().as_str())
    }

    pub fn refresh(&self) -> Option<&str> {
        self.refresh_token.as_ref().map(|t| t.expose().as_str())
    }
}

/// Read the credential pair off an inbound request.
///
/// The access token comes from `Authorization: Bearer`, then the access
/// cookie, then the legacy access cookie. The refresh token only ever comes
/// from its cookie. Cookie values are percent-decoded and the first
/// occurrence of a name wins. A decoded value that cannot be written back
/// into an upstream header (control characters) counts as absent.
pub fn extract(headers: &HeaderMap) -> CredentialPair {
    let mut from_cookie_access = None;
    let mut from_legacy_access = None;
    let mut refresh = None;

    for value in headers.get_all(COOKIE) {
        let Ok(raw) = value.to_str() else {
            continue;
        };
        for parsed in Cookie::split_parse_encoded(raw) {
            let Ok(cookie) = parsed else {
                continue;
            };
            let slot = match cookie.name() {
                ACCESS_COOKIE => &mut from_cookie_access,
                LEGACY_ACCESS_COOKIE => &mut from_legacy_access,
                REFRESH_COOKIE => &mut refresh,
                _ => continue,
            };
            if slot.is_none() && is_sendable(cookie.value()) {
                *slot = Some(cookie.value().to_string());
            }
        }
    }

    let access = bearer_token(headers)
        .or(from_cookie_access)
        .or(from_legacy_access);

    CredentialPair::new(access, refresh)
}

fn is_sendable(value: &str) -> bool {
    !value.is_empty() && HeaderValue::from_str(value).is_ok()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?.trim();
    let (scheme, token) = value.split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}
