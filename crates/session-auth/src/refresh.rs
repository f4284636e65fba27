//! Tolerant interpretation of the upstream refresh payload.
//!
//! The refresh endpoint's body has no fixed schema. It has been seen with
//! `accessToken`, `serverToken` and `refreshToken` in various combinations,
//! alongside fields the proxy does not care about. Only the three known
//! keys are looked at, and only when they hold non-empty strings.

use serde_json::Value;
use tracing::debug;

/// What a refresh produced. Both fields absent means the refresh failed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RefreshResult {
    pub new_access_token: Option<String>,
    pub rotated_refresh_token: Option<String>,
}

impl RefreshResult {
    /// The failed-refresh outcome.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A refresh only counts when it yields a new access token.
    pub fn is_refreshed(&self) -> bool {
        self.new_access_token.is_some()
    }
}

/// Parse a refresh response body.
///
/// `serverToken` takes precedence over `accessToken`. Malformed JSON and
/// non-object payloads yield [`RefreshResult::empty`].
pub fn parse_refresh_payload(body: &[u8]) -> RefreshResult {
    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => {
            debug!(error = %e, "refresh payload is not valid JSON");
            return RefreshResult::empty();
        }
    };
    from_value(&value)
}

/// Same as [`parse_refresh_payload`] for an already-decoded value.
fn from_value(value: &Value) -> RefreshResult {
    RefreshResult {
        new_access_token: string_field(value, "serverToken")
            .or_else(|| string_field(value, "accessToken")),
        rotated_refresh_token: string_field(value, "refreshToken"),
    }
}

/// Non-empty string at `key`, if `value` is an object holding one.
pub fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .as_object()?
        .get(key)?
        .as_str()
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
