//! HTTP edge: request parsing, auth, rate limiting, dispatch to the
//! admission and order services.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use num_traits::{FromPrimitive, ToPrimitive};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::admission::AdmissionService;
use crate::auth::{AuthUser, JwtKeys};
use crate::error::{code, AdmissionError, OrderError};
use crate::models::{NewProduct, Order};
use crate::order_service::OrderService;
use crate::rate_limit::IpRateLimiter;
use crate::store::durable::Database;

#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<AdmissionService>,
    pub orders: Arc<OrderService>,
    pub db: Arc<Database>,
    pub jwt: JwtKeys,
    pub limiter: Arc<IpRateLimiter>,
}

pub fn create_router(state: AppState) -> Router {
    let seckill = Router::new()
        .route("/api/v1/seckill/execute", post(execute_seckill))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .route_layer(middleware::from_fn_with_state(state.clone(), seckill_rate_limit));

    let orders = Router::new()
        .route("/api/v1/orders/my", get(my_orders))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/orders/:id/cancel", post(cancel_order))
        .route("/api/v1/orders/:id/pay", post(pay_order))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let products = Router::new()
        .route("/api/v1/products", post(create_product))
        .route("/api/v1/products/:id", get(get_product))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .merge(seckill)
        .merge(orders)
        .merge(products)
        .route("/health", get(health_check))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    code: i32,
    message: String,
}

fn reply(status: StatusCode, code: i32, message: impl Into<String>) -> Response {
    (status, Json(ApiMessage { code, message: message.into() })).into_response()
}

// ---- middleware ----

async fn require_auth(State(state): State<AppState>, mut req: Request, next: Next) -> Response {
    let header_value = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(header_value) = header_value else {
        return reply(StatusCode::UNAUTHORIZED, code::ERROR_AUTH, "missing authorization header");
    };
    let Some(token) = header_value.strip_prefix("Bearer ") else {
        return reply(StatusCode::UNAUTHORIZED, code::ERROR_AUTH, "invalid authorization format");
    };
    match state.jwt.verify(token) {
        Ok(claims) => {
            req.extensions_mut().insert(AuthUser { user_id: claims.user_id });
            next.run(req).await
        }
        Err(crate::error::AuthError::Expired) => reply(
            StatusCode::UNAUTHORIZED,
            code::ERROR_AUTH_CHECK_TOKEN_TIMEOUT,
            "token expired",
        ),
        Err(_) => reply(
            StatusCode::UNAUTHORIZED,
            code::ERROR_AUTH_CHECK_TOKEN_FAIL,
            "token verification failed",
        ),
    }
}

async fn seckill_rate_limit(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let ip = client_ip(&req);
    if !state.limiter.try_acquire(&ip) {
        return reply(StatusCode::TOO_MANY_REQUESTS, code::ERROR, "too many requests, slow down");
    }
    next.run(req).await
}

fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
    {
        let forwarded = forwarded.trim();
        if !forwarded.is_empty() {
            return forwarded.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---- seckill ----

#[derive(Debug, Deserialize)]
struct SeckillRequest {
    product_id: i64,
    quantity: i32,
}

#[derive(Debug, Serialize)]
struct SeckillResponse {
    code: i32,
    message: String,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    order_id: Option<i64>,
}

async fn execute_seckill(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<SeckillRequest>,
) -> Response {
    match state
        .admission
        .execute(user.user_id, req.product_id, req.quantity)
        .await
    {
        Ok(ack) => Json(SeckillResponse {
            code: code::SUCCESS,
            message: ack.message.to_string(),
            success: true,
            // assigned asynchronously by the order consumer
            order_id: None,
        })
        .into_response(),
        Err(AdmissionError::Validation(message)) => (
            StatusCode::BAD_REQUEST,
            Json(SeckillResponse {
                code: code::INVALID_PARAMS,
                message: message.to_string(),
                success: false,
                order_id: None,
            }),
        )
            .into_response(),
        Err(e) => {
            let code = match &e {
                AdmissionError::OutOfStock => code::ERROR_STOCK_NOT_ENOUGH,
                AdmissionError::ProductNotFound => code::ERROR_PRODUCT_NOT_EXISTS,
                _ => code::ERROR,
            };
            Json(SeckillResponse {
                code,
                message: e.to_string(),
                success: false,
                order_id: None,
            })
            .into_response()
        }
    }
}

// ---- orders ----

#[derive(Debug, Serialize)]
struct OrderView {
    id: i64,
    user_id: i64,
    product_id: i64,
    quantity: i32,
    total_price: f64,
    status: i32,
    created_at: i64,
    updated_at: i64,
}

impl From<Order> for OrderView {
    fn from(order: Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            product_id: order.product_id,
            quantity: order.quantity,
            total_price: order.total_price.to_f64().unwrap_or_default(),
            status: order.status.as_i32(),
            created_at: order.created_at.timestamp(),
            updated_at: order.updated_at.timestamp(),
        }
    }
}

#[derive(Debug, Serialize)]
struct OrderResponse {
    code: i32,
    message: String,
    order: OrderView,
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    page: Option<i64>,
    page_size: Option<i64>,
}

#[derive(Debug, Serialize)]
struct OrderListResponse {
    code: i32,
    message: String,
    orders: Vec<OrderView>,
    total: i64,
}

fn order_error_reply(e: OrderError) -> Response {
    match e {
        OrderError::NotFound => reply(StatusCode::NOT_FOUND, code::ERROR, "order not found"),
        OrderError::Forbidden => reply(StatusCode::FORBIDDEN, code::ERROR, "no permission for this order"),
        OrderError::StatusChanged => reply(
            StatusCode::OK,
            code::ERROR_ORDER_STATUS_CHANGED,
            "order status already changed",
        ),
        OrderError::Unavailable(message) => {
            reply(StatusCode::INTERNAL_SERVER_ERROR, code::ERROR, message)
        }
    }
}

async fn get_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(order_id): Path<i64>,
) -> Response {
    match state.orders.get(order_id, user.user_id).await {
        Ok(order) => Json(OrderResponse {
            code: code::SUCCESS,
            message: "ok".to_string(),
            order: order.into(),
        })
        .into_response(),
        Err(e) => order_error_reply(e),
    }
}

async fn my_orders(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<PageQuery>,
) -> Response {
    let page = query.page.unwrap_or(1).max(1);
    let page_size = query.page_size.unwrap_or(10).clamp(1, 100);
    let (orders, total) = state.orders.list_mine(user.user_id, page, page_size).await;
    Json(OrderListResponse {
        code: code::SUCCESS,
        message: "ok".to_string(),
        orders: orders.into_iter().map(OrderView::from).collect(),
        total,
    })
    .into_response()
}

async fn cancel_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(order_id): Path<i64>,
) -> Response {
    match state.orders.cancel(order_id, user.user_id).await {
        Ok(()) => reply(StatusCode::OK, code::SUCCESS, "order canceled"),
        Err(e) => order_error_reply(e),
    }
}

async fn pay_order(
    State(state): State<AppState>,
    Extension(user): Extension<AuthUser>,
    Path(order_id): Path<i64>,
) -> Response {
    match state.orders.pay(order_id, user.user_id).await {
        Ok(()) => reply(StatusCode::OK, code::SUCCESS, "order paid"),
        Err(e) => order_error_reply(e),
    }
}

// ---- products (minimal CRUD so a sale can be seeded) ----

#[derive(Debug, Deserialize)]
struct CreateProductRequest {
    name: String,
    price: f64,
    stock: i32,
    seckill_start_time: Option<DateTime<Utc>>,
    seckill_end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct CreateProductResponse {
    code: i32,
    message: String,
    product_id: i64,
}

async fn create_product(
    State(state): State<AppState>,
    Json(req): Json<CreateProductRequest>,
) -> Response {
    if req.name.is_empty() || req.price <= 0.0 || req.stock < 0 {
        return reply(StatusCode::BAD_REQUEST, code::INVALID_PARAMS, "invalid product fields");
    }
    let Some(price) = BigDecimal::from_f64(req.price) else {
        return reply(StatusCode::BAD_REQUEST, code::INVALID_PARAMS, "invalid price");
    };
    let new = NewProduct {
        name: req.name,
        price,
        stock: req.stock,
        seckill_start_time: req.seckill_start_time,
        seckill_end_time: req.seckill_end_time,
    };
    match state.db.insert_product(new).await {
        Ok(product_id) => Json(CreateProductResponse {
            code: code::SUCCESS,
            message: "product created".to_string(),
            product_id,
        })
        .into_response(),
        Err(e) => reply(StatusCode::INTERNAL_SERVER_ERROR, code::ERROR, e.to_string()),
    }
}

#[derive(Debug, Serialize)]
struct ProductView {
    id: i64,
    name: String,
    price: f64,
    stock: i32,
    seckill_start_time: Option<i64>,
    seckill_end_time: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ProductResponse {
    code: i32,
    message: String,
    product: ProductView,
}

async fn get_product(State(state): State<AppState>, Path(product_id): Path<i64>) -> Response {
    match state.db.get_product(product_id).await {
        Some(product) => Json(ProductResponse {
            code: code::SUCCESS,
            message: "ok".to_string(),
            product: ProductView {
                id: product.id,
                name: product.name,
                price: product.price.to_f64().unwrap_or_default(),
                stock: product.stock,
                seckill_start_time: product.seckill_start_time.map(|t| t.timestamp()),
                seckill_end_time: product.seckill_end_time.map(|t| t.timestamp()),
            },
        })
        .into_response(),
        None => reply(StatusCode::NOT_FOUND, code::ERROR_PRODUCT_NOT_EXISTS, "product not found"),
    }
}

async fn health_check() -> &'static str {
    "OK"
}
