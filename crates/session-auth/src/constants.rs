//! Cookie names and upstream auth paths shared with the storefront frontend.

/// Cookie carrying the short-lived bearer token.
pub const ACCESS_COOKIE: &str = "serverToken";

/// Older access-token cookie name, still read but never written.
pub const LEGACY_ACCESS_COOKIE: &str = "accessToken";

/// Cookie carrying the long-lived refresh credential.
pub const REFRESH_COOKIE: &str = "refreshToken";

/// Upstream endpoint that exchanges a refresh credential for a new pair.
pub const REFRESH_PATH: &str = "/api/auth/refresh";

/// Upstream endpoint that exchanges login credentials for a pair.
pub const LOGIN_PATH: &str = "/api/auth/login";

/// Default access cookie lifetime: one day.
pub const DEFAULT_ACCESS_MAX_AGE_SECS: i64 = 24 * 60 * 60;

/// Default refresh cookie lifetime: seven days.
pub const DEFAULT_REFRESH_MAX_AGE_SECS: i64 = 7 * 24 * 60 * 60;
