//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! `API_BASE_URL`, `APP_ENV` and `PAYPAL_CLIENT_ID` overlay the file so the
//! same TOML can be shipped to every environment.

use serde::Deserialize;
use session_auth::{
    CookiePolicy, DEFAULT_ACCESS_MAX_AGE_SECS, DEFAULT_REFRESH_MAX_AGE_SECS,
};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub cookies: CookieConfig,
    #[serde(default)]
    pub paypal: PaypalConfig,
}

/// HTTP proxy settings
#[derive(Debug, Deserialize)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    /// Upstream API base. Unset means every proxied route answers 500.
    #[serde(default)]
    pub upstream_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Credential cookie attributes
#[derive(Debug, Deserialize)]
pub struct CookieConfig {
    #[serde(default)]
    pub secure: bool,
    #[serde(default = "default_access_max_age")]
    pub access_max_age_secs: i64,
    #[serde(default = "default_refresh_max_age")]
    pub refresh_max_age_secs: i64,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            secure: false,
            access_max_age_secs: default_access_max_age(),
            refresh_max_age_secs: default_refresh_max_age(),
        }
    }
}

impl CookieConfig {
    pub fn policy(&self) -> CookiePolicy {
        CookiePolicy::new(
            self.secure,
            self.access_max_age_secs,
            self.refresh_max_age_secs,
        )
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct PaypalConfig {
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    1000
}

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

fn default_access_max_age() -> i64 {
    DEFAULT_ACCESS_MAX_AGE_SECS
}

fn default_refresh_max_age() -> i64 {
    DEFAULT_REFRESH_MAX_AGE_SECS
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|source| common::Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents, |key| std::env::var(key).ok())
    }

    /// Parse TOML and apply the env overlay read through `env`.
    pub fn parse(contents: &str, env: impl Fn(&str) -> Option<String>) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;

        if let Some(url) = env("API_BASE_URL") {
            config.proxy.upstream_url = Some(url);
        }
        if env("APP_ENV").is_some_and(|v| v.eq_ignore_ascii_case("production")) {
            config.cookies.secure = true;
        }
        if let Some(id) = env("PAYPAL_CLIENT_ID") {
            config.paypal.client_id = Some(id);
        }

        config.proxy.upstream_url = normalize_optional(config.proxy.upstream_url.take())
            .map(|url| url.trim_end_matches('/').to_string());
        config.paypal.client_id = normalize_optional(config.paypal.client_id.take());

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if let Some(url) = &self.proxy.upstream_url
            && !url.starts_with("http://")
            && !url.starts_with("https://")
        {
            return Err(common::Error::invalid(
                "upstream_url",
                format!("must start with http:// or https://, got: {url}"),
            ));
        }

        let positive = [
            ("timeout_secs", self.proxy.timeout_secs as u128),
            ("max_connections", self.proxy.max_connections as u128),
            ("max_body_bytes", self.proxy.max_body_bytes as u128),
        ];
        if let Some(&(field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(common::Error::invalid(field, "must be greater than 0"));
        }

        let cookies = &self.cookies;
        if cookies.access_max_age_secs <= 0 {
            return Err(common::Error::invalid("access_max_age_secs", "must be greater than 0"));
        }
        if cookies.access_max_age_secs >= cookies.refresh_max_age_secs {
            return Err(common::Error::invalid(
                "access_max_age_secs",
                format!(
                    "must be shorter than refresh_max_age_secs ({} >= {})",
                    cookies.access_max_age_secs, cookies.refresh_max_age_secs
                ),
            ));
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("storefront-proxy.toml")
    }
}

fn normalize_optional(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn valid_toml() -> &'static str {
        r#"
[proxy]
listen_addr = "127.0.0.1:3000"
upstream_url = "https://api.example.com/"
"#
    }

    #[test]
    fn test_parse_valid_config_with_defaults() {
        let config = Config::parse(valid_toml(), no_env).unwrap();
        assert_eq!(
            config.proxy.upstream_url.as_deref(),
            Some("https://api.example.com")
        );
        assert_eq!(config.proxy.timeout_secs, 30);
        assert_eq!(config.proxy.max_connections, 1000);
        assert_eq!(config.proxy.max_body_bytes, 10 * 1024 * 1024);
        assert!(!config.cookies.secure);
        assert_eq!(config.cookies.access_max_age_secs, 86_400);
        assert_eq!(config.cookies.refresh_max_age_secs, 604_800);
        assert!(config.paypal.client_id.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storefront-proxy.toml");
        std::fs::write(&path, valid_toml()).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.proxy.listen_addr.port(), 3000);
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/config.toml"));
        assert!(matches!(result, Err(common::Error::Read { .. })));
    }

    #[test]
    fn test_parse_invalid_toml() {
        let result = Config::parse("not valid {{{{ toml", no_env);
        assert!(matches!(result, Err(common::Error::Toml(_))));
    }

    #[test]
    fn test_upstream_url_is_optional() {
        let config = Config::parse(
            r#"
[proxy]
listen_addr = "127.0.0.1:3000"
"#,
            no_env,
        )
        .unwrap();
        assert!(config.proxy.upstream_url.is_none());
    }

    #[test]
    fn test_blank_upstream_url_counts_as_unset() {
        let config = Config::parse(
            r#"
[proxy]
listen_addr = "127.0.0.1:3000"
upstream_url = "   "
"#,
            no_env,
        )
        .unwrap();
        assert!(config.proxy.upstream_url.is_none());
    }

    #[test]
    fn test_rejects_non_http_upstream() {
        let result = Config::parse(
            r#"
[proxy]
listen_addr = "127.0.0.1:3000"
upstream_url = "ftp://api.example.com"
"#,
            no_env,
        );
        assert_eq!(result.unwrap_err().field(), Some("upstream_url"));
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let result = Config::parse(
            r#"
[proxy]
listen_addr = "127.0.0.1:3000"
timeout_secs = 0
"#,
            no_env,
        );
        assert_eq!(result.unwrap_err().field(), Some("timeout_secs"));
    }

    #[test]
    fn test_rejects_access_lifetime_not_shorter_than_refresh() {
        let result = Config::parse(
            r#"
[proxy]
listen_addr = "127.0.0.1:3000"

[cookies]
access_max_age_secs = 3600
refresh_max_age_secs = 3600
"#,
            no_env,
        );
        let err = result.unwrap_err();
        assert_eq!(err.field(), Some("access_max_age_secs"));
        assert!(err.to_string().contains("shorter"), "got: {err}");
    }

    #[test]
    fn test_env_overlay() {
        let env = |key: &str| match key {
            "API_BASE_URL" => Some("http://backend:8080/".to_string()),
            "APP_ENV" => Some("production".to_string()),
            "PAYPAL_CLIENT_ID" => Some("paypal-sandbox-id".to_string()),
            _ => None,
        };
        let config = Config::parse(valid_toml(), env).unwrap();
        assert_eq!(
            config.proxy.upstream_url.as_deref(),
            Some("http://backend:8080")
        );
        assert!(config.cookies.secure);
        assert!(config.cookies.policy().secure);
        assert_eq!(
            config.paypal.client_id.as_deref(),
            Some("paypal-sandbox-id")
        );
    }

    #[test]
    fn test_non_production_env_keeps_file_setting() {
        let env = |key: &str| (key == "APP_ENV").then(|| "staging".to_string());
        let config = Config::parse(valid_toml(), env).unwrap();
        assert!(!config.cookies.secure);
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }
}
