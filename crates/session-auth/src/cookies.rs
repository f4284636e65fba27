//! Cookies that carry the credential pair back to the browser.

use cookie::{Cookie, SameSite};
use time::Duration;

use crate::constants::{
    ACCESS_COOKIE, DEFAULT_ACCESS_MAX_AGE_SECS, DEFAULT_REFRESH_MAX_AGE_SECS, REFRESH_COOKIE,
};
use crate::refresh::RefreshResult;

/// Attributes applied to every credential cookie the proxy writes.
///
/// Both cookies are `HttpOnly`, `SameSite=Lax` and scoped to `/`. The access
/// cookie must expire before the refresh cookie; config loading enforces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CookiePolicy {
    pub secure: bool,
    pub access_max_age: Duration,
    pub refresh_max_age: Duration,
}

impl Default for CookiePolicy {
    fn default() -> Self {
        Self {
            secure: false,
            access_max_age: Duration::seconds(DEFAULT_ACCESS_MAX_AGE_SECS),
            refresh_max_age: Duration::seconds(DEFAULT_REFRESH_MAX_AGE_SECS),
        }
    }
}

impl CookiePolicy {
    pub fn new(secure: bool, access_max_age_secs: i64, refresh_max_age_secs: i64) -> Self {
        Self {
            secure,
            access_max_age: Duration::seconds(access_max_age_secs),
            refresh_max_age: Duration::seconds(refresh_max_age_secs),
        }
    }

    pub fn access_cookie(&self, token: &str) -> Cookie<'static> {
        self.credential_cookie(ACCESS_COOKIE, token, self.access_max_age)
    }

    pub fn refresh_cookie(&self, token: &str) -> Cookie<'static> {
        self.credential_cookie(REFRESH_COOKIE, token, self.refresh_max_age)
    }

    /// Cookies to write after a refresh. Empty when nothing was issued.
    pub fn rotation_cookies(&self, result: &RefreshResult) -> Vec<Cookie<'static>> {
        let mut cookies = Vec::with_capacity(2);
        if let Some(refresh) = &result.rotated_refresh_token {
            cookies.push(self.refresh_cookie(refresh));
        }
        if let Some(access) = &result.new_access_token {
            cookies.push(self.access_cookie(access));
        }
        cookies
    }

    /// Removal cookies for logout.
    pub fn clear_cookies(&self) -> [Cookie<'static>; 2] {
        [clear_cookie(ACCESS_COOKIE), clear_cookie(REFRESH_COOKIE)]
    }

    fn credential_cookie(&self, name: &'static str, value: &str, max_age: Duration) -> Cookie<'static> {
        Cookie::build((name, value.to_string()))
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Lax)
            .path("/")
            .max_age(max_age)
            .build()
    }
}

fn clear_cookie(name: &'static str) -> Cookie<'static> {
    Cookie::build((name, ""))
        .path("/")
        .max_age(Duration::ZERO)
        .build()
}
