//! Session endpoints: login, logout, session probe and explicit refresh,
//! plus the public auth passthroughs.

use axum::extract::{Request, State};
use axum::http::header::{ACCEPT, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use axum_extra::extract::cookie::CookieJar;
use bytes::Bytes;
use serde_json::{Value, json};
use session_auth::LOGIN_PATH;
use session_auth::refresh::string_field;
use tracing::{debug, info};
use upstream::ForwardRequest;

use crate::AppState;
use crate::error::{ApiError, Result};
use crate::metrics;
use crate::proxy::{self, ProxyTarget};

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/session", get(session))
        .route("/api/auth/refresh", post(refresh))
        .route("/api/auth/check-login-id", get(check_login_id))
        .route("/api/auth/guest-login", post(guest_login))
        .route("/api/config/paypal-client-id", get(paypal_client_id))
}

/// Login failures keep the `{success: false}` envelope the storefront expects.
fn login_failure(status: StatusCode, message: &str, code: Option<String>) -> Response {
    let mut body = json!({ "success": false, "error": message });
    if let Some(code) = code {
        body["code"] = Value::String(code);
    }
    (status, Json(body)).into_response()
}

async fn login(State(state): State<AppState>, request: Request) -> Response {
    let request_id = proxy::new_request_id();
    proxy::observe(&state.proxy, &request_id, Method::POST, login_exchange(&state, request)).await
}

async fn login_exchange(state: &AppState, request: Request) -> Result<Response> {
    let body = axum::body::to_bytes(request.into_body(), state.proxy.max_body_bytes)
        .await
        .map_err(|e| ApiError::BadRequest(format!("invalid request body: {e}")))?;
    let Ok(parsed) = serde_json::from_slice::<Value>(&body) else {
        return Ok(login_failure(StatusCode::BAD_REQUEST, "request body is not valid JSON", None));
    };
    let (Some(login_id), Some(password)) = (
        string_field(&parsed, "loginId"),
        string_field(&parsed, "password"),
    ) else {
        return Ok(login_failure(
            StatusCode::BAD_REQUEST,
            "loginId and password are required",
            None,
        ));
    };

    let upstream = state.proxy.upstream()?;
    let payload = json!({ "loginId": login_id, "password": password }).to_string();
    let mut forward = ForwardRequest::new(
        Method::POST,
        format!("{}{LOGIN_PATH}", upstream.base_url()),
        &HeaderMap::new(),
        &[],
    )
    .with_body(Some(Bytes::from(payload)));
    forward
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    forward
        .headers
        .insert(ACCEPT, HeaderValue::from_static("application/json"));

    let response = upstream
        .forward(&forward, None)
        .await
        .inspect_err(|e| metrics::record_upstream_error(e.kind()))?;
    let status = response.status;
    let raw = response
        .read_to_bytes(state.proxy.max_body_bytes)
        .await
        .inspect_err(|e| metrics::record_upstream_error(e.kind()))?;
    let data: Value = serde_json::from_slice(&raw).unwrap_or(Value::Null);

    if !status.is_success() {
        info!(status = status.as_u16(), "upstream rejected login");
        let message = string_field(&data, "message").unwrap_or_else(|| "login failed".to_string());
        return Ok(login_failure(status, &message, string_field(&data, "code")));
    }

    let Some(access_token) = string_field(&data, "accessToken") else {
        return Ok(login_failure(
            StatusCode::BAD_GATEWAY,
            "accessToken missing from upstream response",
            None,
        ));
    };

    let policy = &state.proxy.cookies;
    let mut jar = CookieJar::default().add(policy.access_cookie(&access_token));
    if let Some(refresh_token) = string_field(&data, "refreshToken") {
        jar = jar.add(policy.refresh_cookie(&refresh_token));
    }
    debug!("login succeeded, credential cookies issued");

    let body = json!({
        "success": true,
        "accessToken": access_token,
        "tokenType": data["tokenType"],
        "expiresIn": data["expiresIn"],
        "account": data["account"],
    });
    Ok((jar, Json(body)).into_response())
}

async fn logout(State(state): State<AppState>) -> Response {
    let request_id = proxy::new_request_id();
    proxy::observe(&state.proxy, &request_id, Method::POST, async {
        let jar = state
            .proxy
            .cookies
            .clear_cookies()
            .into_iter()
            .fold(CookieJar::default(), |jar, cookie| jar.add(cookie));
        Ok::<_, ApiError>((jar, StatusCode::NO_CONTENT).into_response())
    })
    .await
}

/// Reports only whether an access credential is present; it is not verified.
async fn session(headers: HeaderMap) -> Json<Value> {
    let credentials = session_auth::extract(&headers);
    Json(json!({ "loggedIn": credentials.access().is_some() }))
}

async fn refresh(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let request_id = proxy::new_request_id();
    proxy::observe(&state.proxy, &request_id, Method::POST, explicit_refresh(&state, &headers)).await
}

async fn explicit_refresh(state: &AppState, headers: &HeaderMap) -> Result<Response> {
    let upstream = state.proxy.upstream()?;
    let credentials = session_auth::extract(headers);
    let token = credentials.refresh().ok_or(ApiError::Unauthorized)?;

    let result = upstream.refresh(token).await;
    if !result.is_refreshed() {
        return Err(ApiError::Unauthorized);
    }

    let jar = state
        .proxy
        .cookies
        .rotation_cookies(&result)
        .into_iter()
        .fold(CookieJar::default(), |jar, cookie| jar.add(cookie));
    Ok((jar, Json(json!({ "refreshed": true }))).into_response())
}

async fn check_login_id(State(state): State<AppState>, request: Request) -> Response {
    let target = ProxyTarget::new("/api/auth/check-login-id").with_query();
    proxy::passthrough(&state.proxy, target, request, proxy::new_request_id()).await
}

async fn guest_login(State(state): State<AppState>, request: Request) -> Response {
    let target = ProxyTarget::new("/api/auth/guest-login").with_headers(&["content-type"]);
    proxy::passthrough(&state.proxy, target, request, proxy::new_request_id()).await
}

async fn paypal_client_id(State(state): State<AppState>) -> Response {
    match &state.paypal_client_id {
        Some(id) => Json(json!({ "clientId": id })).into_response(),
        None => (StatusCode::NOT_FOUND, Json(json!({ "clientId": null }))).into_response(),
    }
}
