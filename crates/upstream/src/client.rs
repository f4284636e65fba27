//! reqwest-backed upstream transport.
//!
//! Each call carries its own timeout. For forwarded calls it covers the wait
//! for response headers; the body is then streamed straight through, and
//! dropping the returned stream (for example when the browser disconnects)
//! aborts the upstream transfer. Refresh calls are bounded end to end.

use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_TYPE, COOKIE, HeaderValue};
use session_auth::{REFRESH_PATH, RefreshResult, parse_refresh_payload};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::headers::{outbound_headers, refresh_cookie_header};
use crate::{ForwardRequest, Result, Upstream, UpstreamError, UpstreamResponse};

/// Largest refresh payload the coordinator will read.
const MAX_REFRESH_BODY_BYTES: usize = 64 * 1024;

/// Upstream API reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpUpstream {
    /// `base_url` has any trailing slash trimmed.
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client,
            base_url,
            timeout,
        }
    }

    fn refresh_url(&self) -> String {
        format!("{}{REFRESH_PATH}", self.base_url)
    }

    fn classify(&self, err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else if err.is_builder() {
            UpstreamError::InvalidRequest(err.to_string())
        } else {
            UpstreamError::Unreachable(err.to_string())
        }
    }

    async fn send_refresh(&self, refresh_token: &str) -> std::result::Result<RefreshResult, &'static str> {
        let cookie = refresh_cookie_header(refresh_token).map_err(|e| {
            warn!(error = %e, "refresh token cannot be sent as a cookie");
            "invalid_token"
        })?;

        let response = self
            .client
            .post(self.refresh_url())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(COOKIE, cookie)
            .timeout(self.timeout)
            .body("{}")
            .send()
            .await
            .map_err(|e| {
                let e = self.classify(e);
                warn!(error = %e, url = %self.refresh_url(), "refresh request failed");
                e.kind()
            })?;

        let status = response.status();
        if !status.is_success() {
            info!(status = status.as_u16(), "refresh rejected by upstream");
            return Err("rejected");
        }

        let body = UpstreamResponse::new(
            status,
            response.headers().clone(),
            response.bytes_stream().map_err(std::io::Error::other).boxed(),
        )
        .read_to_bytes(MAX_REFRESH_BODY_BYTES)
        .await
        .map_err(|e| {
            warn!(error = %e, "failed to read refresh response");
            "invalid_response"
        })?;

        let result = parse_refresh_payload(&body);
        if !result.is_refreshed() {
            warn!("refresh response carried no access token");
            return Err("malformed");
        }
        Ok(result)
    }
}

impl Upstream for HttpUpstream {
    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn forward<'a>(
        &'a self,
        request: &'a ForwardRequest,
        access_token: Option<&'a str>,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse>> + Send + 'a>> {
        Box::pin(async move {
            let headers = outbound_headers(
                &request.headers,
                access_token,
                request.refresh_token.as_ref(),
            )?;

            let mut builder = self
                .client
                .request(request.method.clone(), &request.url)
                .headers(headers);
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            // Bounds time-to-headers only; the body then streams for as long as it takes.
            let response = tokio::time::timeout(self.timeout, builder.send())
                .await
                .map_err(|_| UpstreamError::Timeout(self.timeout))?
                .map_err(|e| self.classify(e))?;
            debug!(status = response.status().as_u16(), url = %request.url, "upstream responded");

            let status = response.status();
            let headers = response.headers().clone();
            let body = response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .boxed();
            Ok(UpstreamResponse::new(status, headers, body))
        })
    }

    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = RefreshResult> + Send + 'a>> {
        Box::pin(async move {
            match self.send_refresh(refresh_token).await {
                Ok(result) => {
                    metrics::counter!("upstream_refresh_total", "outcome" => "refreshed").increment(1);
                    result
                }
                Err(outcome) => {
                    metrics::counter!("upstream_refresh_total", "outcome" => outcome).increment(1);
                    RefreshResult::empty()
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use reqwest::Method;
    use reqwest::header::HeaderMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::TcpListener;

    /// Echo server: returns method, headers and body as JSON, plus a
    /// `set-cookie` that must never reach the browser.
    async fn start_echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|request: Request<Body>| async move {
                let mut headers_map = serde_json::Map::new();
                for (name, value) in request.headers() {
                    headers_map.insert(
                        name.to_string(),
                        serde_json::Value::String(value.to_str().unwrap_or("").to_string()),
                    );
                }
                let method = request.method().to_string();
                let body = axum::body::to_bytes(request.into_body(), 1024 * 1024)
                    .await
                    .unwrap();
                (
                    StatusCode::OK,
                    [("set-cookie", "upstream=1"), ("etag", "\"e1\"")],
                    axum::Json(serde_json::json!({
                        "method": method,
                        "headers": headers_map,
                        "body": String::from_utf8_lossy(&body),
                    })),
                )
            });
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    /// Refresh endpoint that answers with a fixed status and body and counts calls.
    async fn start_refresh_server(
        status: StatusCode,
        body: &'static str,
    ) -> (String, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/api/auth/refresh",
                axum::routing::post(move |request: Request<Body>| {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let cookie = request
                            .headers()
                            .get("cookie")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or("")
                            .to_string();
                        let payload = axum::body::to_bytes(request.into_body(), 1024)
                            .await
                            .unwrap();
                        if cookie != "refreshToken=rt_valid" || payload.as_ref() != b"{}" {
                            return (StatusCode::BAD_REQUEST, "bad refresh call");
                        }
                        (status, body)
                    }
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });
        (url, calls)
    }

    fn upstream(url: &str) -> HttpUpstream {
        HttpUpstream::new(reqwest::Client::new(), url, Duration::from_secs(5))
    }

    async fn json_body(response: UpstreamResponse) -> serde_json::Value {
        let bytes = response.read_to_bytes(1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn trailing_slash_is_trimmed() {
        let up = upstream("https://api.example.com/");
        assert_eq!(up.base_url(), "https://api.example.com");
        assert_eq!(up.refresh_url(), "https://api.example.com/api/auth/refresh");
    }

    #[tokio::test]
    async fn forward_attaches_bearer_and_refresh_cookie() {
        let url = start_echo_server().await;
        let up = upstream(&url);

        let mut inbound = HeaderMap::new();
        inbound.insert("accept", HeaderValue::from_static("application/json"));
        inbound.insert("cookie", HeaderValue::from_static("theme=dark"));
        let request = ForwardRequest::new(Method::GET, format!("{url}/api/cart"), &inbound, &[])
            .with_refresh_token(Some(common::Secret::new("rt1".into())));

        let response = up.forward(&request, Some("at1")).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        let echoed = json_body(response).await;
        assert_eq!(echoed["headers"]["authorization"], "Bearer at1");
        assert_eq!(echoed["headers"]["cookie"], "refreshToken=rt1");
        assert_eq!(echoed["headers"]["accept"], "application/json");
    }

    #[tokio::test]
    async fn forward_without_token_sends_no_authorization() {
        let url = start_echo_server().await;
        let up = upstream(&url);
        let request = ForwardRequest::new(Method::GET, format!("{url}/api/works"), &HeaderMap::new(), &[]);

        let echoed = json_body(up.forward(&request, Some("")).await.unwrap()).await;
        assert!(echoed["headers"].get("authorization").is_none());
        assert!(echoed["headers"].get("cookie").is_none());
    }

    #[tokio::test]
    async fn forward_omits_absent_body() {
        let url = start_echo_server().await;
        let up = upstream(&url);
        let request = ForwardRequest::new(Method::DELETE, format!("{url}/api/cart/items/3"), &HeaderMap::new(), &[]);

        let echoed = json_body(up.forward(&request, Some("at")).await.unwrap()).await;
        assert_eq!(echoed["method"], "DELETE");
        assert!(echoed["headers"].get("content-length").is_none());
        assert_eq!(echoed["body"], "");
    }

    #[tokio::test]
    async fn forward_sends_buffered_body() {
        let url = start_echo_server().await;
        let up = upstream(&url);
        let mut inbound = HeaderMap::new();
        inbound.insert("content-type", HeaderValue::from_static("application/json"));
        let request = ForwardRequest::new(
            Method::PATCH,
            format!("{url}/api/account/me"),
            &inbound,
            &["content-type"],
        )
        .with_body(Some(Bytes::from_static(br#"{"name":"kim"}"#)));

        let echoed = json_body(up.forward(&request, Some("at")).await.unwrap()).await;
        assert_eq!(echoed["method"], "PATCH");
        assert_eq!(echoed["body"], r#"{"name":"kim"}"#);
        assert_eq!(echoed["headers"]["content-type"], "application/json");
    }

    #[tokio::test]
    async fn forward_keeps_raw_headers_for_the_orchestrator_to_filter() {
        let url = start_echo_server().await;
        let up = upstream(&url);
        let request = ForwardRequest::new(Method::GET, format!("{url}/x"), &HeaderMap::new(), &[]);

        let response = up.forward(&request, None).await.unwrap();
        assert!(response.headers.get("set-cookie").is_some());
        let filtered = response.filtered_headers();
        assert!(filtered.get("set-cookie").is_none());
        assert_eq!(filtered.get("etag").unwrap(), "\"e1\"");
    }

    #[tokio::test]
    async fn forward_reports_unreachable_upstream() {
        let up = upstream("http://127.0.0.1:1");
        let request = ForwardRequest::new(Method::GET, "http://127.0.0.1:1/api/cart", &HeaderMap::new(), &[]);

        let err = up.forward(&request, Some("at")).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Unreachable(_)), "got: {err:?}");
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn forward_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            });
            axum::serve(listener, app).await.unwrap();
        });

        let up = HttpUpstream::new(reqwest::Client::new(), &url, Duration::from_millis(100));
        let request = ForwardRequest::new(Method::GET, format!("{url}/slow"), &HeaderMap::new(), &[]);
        let err = up.forward(&request, None).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Timeout(_)), "got: {err:?}");
    }

    #[tokio::test]
    async fn slow_body_streams_past_the_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().fallback(|| async {
                let chunks = futures_util::stream::unfold(0u8, |n| async move {
                    if n == 3 {
                        return None;
                    }
                    tokio::time::sleep(Duration::from_millis(80)).await;
                    Some((Ok::<_, std::io::Error>(Bytes::from_static(b"chunk;")), n + 1))
                });
                Body::from_stream(chunks)
            });
            axum::serve(listener, app).await.unwrap();
        });

        let up = HttpUpstream::new(reqwest::Client::new(), &url, Duration::from_millis(100));
        let request = ForwardRequest::new(Method::GET, format!("{url}/download"), &HeaderMap::new(), &[]);
        let response = up.forward(&request, None).await.unwrap();
        let body = response.read_to_bytes(1024).await.unwrap();
        assert_eq!(body, "chunk;chunk;chunk;");
    }

    async fn start_slow_refresh_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let app = axum::Router::new().route(
                "/api/auth/refresh",
                axum::routing::post(|| async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    r#"{"accessToken":"late"}"#
                }),
            );
            axum::serve(listener, app).await.unwrap();
        });
        url
    }

    #[tokio::test]
    async fn refresh_times_out_is_empty() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let url = start_slow_refresh_server().await;

        let up = HttpUpstream::new(reqwest::Client::new(), &url, Duration::from_millis(100));
        let result = {
            let _guard = metrics::set_default_local_recorder(&recorder);
            up.refresh("rt_valid").await
        };

        assert_eq!(result, RefreshResult::empty());
        let output = handle.render();
        assert!(output.contains("upstream_refresh_total"), "got: {output}");
        assert!(output.contains("outcome=\"timeout\""), "got: {output}");
    }

    #[tokio::test]
    async fn refresh_extracts_tokens() {
        let (url, calls) = start_refresh_server(
            StatusCode::OK,
            r#"{"accessToken":"T2","refreshToken":"rt_next","expiresIn":3600}"#,
        )
        .await;
        let result = upstream(&url).refresh("rt_valid").await;
        assert_eq!(result.new_access_token.as_deref(), Some("T2"));
        assert_eq!(result.rotated_refresh_token.as_deref(), Some("rt_next"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_non_success_is_empty() {
        let (url, calls) = start_refresh_server(StatusCode::UNAUTHORIZED, r#"{"message":"expired"}"#).await;
        let result = upstream(&url).refresh("rt_valid").await;
        assert_eq!(result, RefreshResult::empty());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_malformed_json_is_empty() {
        let (url, _calls) = start_refresh_server(StatusCode::OK, "not json").await;
        assert_eq!(upstream(&url).refresh("rt_valid").await, RefreshResult::empty());
    }

    #[tokio::test]
    async fn refresh_unreachable_is_empty() {
        let result = upstream("http://127.0.0.1:1").refresh("rt_valid").await;
        assert_eq!(result, RefreshResult::empty());
    }

    #[tokio::test]
    async fn refresh_records_outcome_metric() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let (url, _calls) = start_refresh_server(StatusCode::FORBIDDEN, "{}").await;

        let up = upstream(&url);
        {
            let _guard = metrics::set_default_local_recorder(&recorder);
            // current-thread runtime: the increment happens on this thread
            up.refresh("rt_valid").await;
        }

        let output = handle.render();
        assert!(output.contains("upstream_refresh_total"), "got: {output}");
        assert!(output.contains("outcome=\"rejected\""), "got: {output}");
    }
}
