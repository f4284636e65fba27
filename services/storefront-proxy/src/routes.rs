//! Authenticated storefront API routes
//!
//! Each route mirrors its own path onto the upstream base URL and hands the
//! request to [`proxy::proxy_request`]. Path parameters are checked here so a
//! malformed id never costs an upstream call.

use axum::Router;
use axum::extract::{Path, Request, State};
use axum::response::Response;
use axum::routing::{delete, get, patch, post};
use upstream::IDEMPOTENCY_KEY;

use crate::AppState;
use crate::error::{ApiError, Result};
use crate::proxy::{self, ProxyTarget};

/// Routes that carry a JSON body.
const BODY_HEADERS: &[&str] = &["content-type"];

/// Order and payment routes also forward the client's idempotency key.
const ORDER_HEADERS: &[&str] = &["content-type", IDEMPOTENCY_KEY];

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/api/works", get(works).post(works).delete(works))
        .route("/api/works/{id}", get(work).put(work))
        .route("/api/works/{id}/preset", get(work_preset))
        .route("/api/works/{id}/preview-url", patch(work_preview_url))
        .route("/api/cart", get(cart))
        .route(
            "/api/cart/items",
            get(cart_items).post(cart_items).patch(cart_items),
        )
        .route("/api/cart/items/{item_id}", delete(cart_item))
        .route("/api/orders", get(orders).post(orders))
        .route("/api/orders/direct", post(direct_order))
        .route("/api/orders/{order_id}", get(order))
        .route("/api/orders/{order_id}/pay", post(pay_order))
        .route("/api/account/me", get(account).patch(account))
        .route("/api/paypal/orders", post(paypal_orders))
        .route(
            "/api/paypal/orders/{paypal_order_id}/capture",
            post(paypal_capture),
        )
}

async fn protected(state: &AppState, target: Result<ProxyTarget>, request: Request) -> Response {
    let request_id = proxy::new_request_id();
    match target {
        Ok(target) => proxy::proxy_request(&state.proxy, target, request, request_id).await,
        Err(e) => proxy::reject(&state.proxy, e, request.method().clone(), request_id).await,
    }
}

/// Digits only. The id is forwarded as written.
fn numeric_id<'a>(raw: &'a str, message: &str) -> Result<&'a str> {
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        Ok(raw)
    } else {
        Err(ApiError::BadRequest(message.to_string()))
    }
}

/// Any non-blank segment, percent-encoded for the upstream path.
fn path_segment(raw: &str, message: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ApiError::BadRequest(message.to_string()));
    }
    Ok(urlencoding::encode(trimmed).into_owned())
}

async fn works(State(state): State<AppState>, request: Request) -> Response {
    let target = ProxyTarget::new("/api/works")
        .with_query()
        .with_headers(BODY_HEADERS);
    protected(&state, Ok(target), request).await
}

async fn work(State(state): State<AppState>, Path(id): Path<String>, request: Request) -> Response {
    let target = numeric_id(&id, "invalid id")
        .map(|id| ProxyTarget::new(format!("/api/works/{id}")).with_headers(BODY_HEADERS));
    protected(&state, target, request).await
}

async fn work_preset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Response {
    let target = numeric_id(&id, "invalid id")
        .map(|id| ProxyTarget::new(format!("/api/works/{id}/preset")));
    protected(&state, target, request).await
}

async fn work_preview_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    request: Request,
) -> Response {
    let target = numeric_id(&id, "invalid id").map(|id| {
        ProxyTarget::new(format!("/api/works/{id}/preview-url")).with_headers(BODY_HEADERS)
    });
    protected(&state, target, request).await
}

async fn cart(State(state): State<AppState>, request: Request) -> Response {
    protected(&state, Ok(ProxyTarget::new("/api/cart")), request).await
}

async fn cart_items(State(state): State<AppState>, request: Request) -> Response {
    let target = ProxyTarget::new("/api/cart/items").with_headers(BODY_HEADERS);
    protected(&state, Ok(target), request).await
}

async fn cart_item(
    State(state): State<AppState>,
    Path(item_id): Path<String>,
    request: Request,
) -> Response {
    let target = numeric_id(&item_id, "invalid itemId")
        .map(|id| ProxyTarget::new(format!("/api/cart/items/{id}")));
    protected(&state, target, request).await
}

async fn orders(State(state): State<AppState>, request: Request) -> Response {
    let target = ProxyTarget::new("/api/orders")
        .with_query()
        .with_headers(ORDER_HEADERS);
    protected(&state, Ok(target), request).await
}

async fn direct_order(State(state): State<AppState>, request: Request) -> Response {
    let target = ProxyTarget::new("/api/orders/direct").with_headers(ORDER_HEADERS);
    protected(&state, Ok(target), request).await
}

async fn order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    request: Request,
) -> Response {
    let target = path_segment(&order_id, "orderId missing")
        .map(|id| ProxyTarget::new(format!("/api/orders/{id}")));
    protected(&state, target, request).await
}

async fn pay_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
    request: Request,
) -> Response {
    let target = path_segment(&order_id, "orderId missing")
        .map(|id| ProxyTarget::new(format!("/api/orders/{id}/pay")).with_headers(ORDER_HEADERS));
    protected(&state, target, request).await
}

async fn account(State(state): State<AppState>, request: Request) -> Response {
    let target = ProxyTarget::new("/api/account/me").with_headers(BODY_HEADERS);
    protected(&state, Ok(target), request).await
}

async fn paypal_orders(State(state): State<AppState>, request: Request) -> Response {
    let target = ProxyTarget::new("/api/paypal/orders")
        .with_query()
        .with_headers(BODY_HEADERS);
    protected(&state, Ok(target), request).await
}

async fn paypal_capture(
    State(state): State<AppState>,
    Path(paypal_order_id): Path<String>,
    request: Request,
) -> Response {
    let target = path_segment(&paypal_order_id, "paypalOrderId missing").map(|id| {
        ProxyTarget::new(format!("/api/paypal/orders/{id}/capture")).with_headers(BODY_HEADERS)
    });
    protected(&state, target, request).await
}
