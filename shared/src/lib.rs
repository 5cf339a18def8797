use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

// Broker topology. Declared idempotently at startup; consumers bind by key.
pub const EXCHANGE: &str = "seckill.exchange";
pub const DLX: &str = "seckill.dlx";
pub const QUEUE_ORDER_CREATE: &str = "order.create";
pub const KEY_ORDER_CREATE: &str = "order.create";
pub const QUEUE_ORDER_CANCELED: &str = "order.canceled";
pub const KEY_ORDER_CANCELED: &str = "order.canceled";
pub const QUEUE_ORDER_CREATE_DLQ: &str = "order.create.dlq";
pub const QUEUE_STOCK_LOG: &str = "stock_log";
pub const KEY_STOCK_CHANGE: &str = "stock.change";

/// Product ids whose hot counter has diverged from the durable store.
pub const DIRTY_SET_KEY: &str = "product:dirty";

pub const JOINED_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const MSG_DONE_TTL: Duration = Duration::from_secs(30 * 60);
pub const EVENT_DEDUP_TTL: Duration = Duration::from_secs(24 * 60 * 60);
pub const WARMUP_LOCK_TTL: Duration = Duration::from_secs(30);
pub const PRODUCT_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

pub fn stock_key(product_id: i64) -> String {
    format!("stock:{product_id}")
}

pub fn product_cache_key(product_id: i64) -> String {
    format!("product:cache:{product_id}")
}

pub fn joined_key(product_id: i64) -> String {
    format!("seckill:joined:product:{product_id}")
}

pub fn msg_done_key(message_id: &str) -> String {
    format!("seckill:msg:done:{message_id}")
}

pub fn event_dedup_key(event_id: &str) -> String {
    format!("event:order.canceled:{event_id}")
}

pub fn warmup_lock_key(product_id: i64) -> String {
    format!("lock:init:stock:{product_id}")
}

/// Message id stamped on every admission publish so the consumer can
/// deduplicate redeliveries.
pub fn create_message_id(user_id: i64, product_id: i64) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    format!("create:{user_id}:{product_id}:{nanos}")
}

/// Deterministic event id: replays of the same logical event collapse to
/// one dedup key on the consumer side.
pub fn deterministic_event_id(order_id: i64, product_id: i64, user_id: i64, action: &str) -> String {
    format!("{order_id}-{product_id}-{user_id}-{action}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreateMessage {
    pub user_id: i64,
    pub product_id: i64,
    pub quantity: i32,
    pub total_price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCanceledEvent {
    pub event_id: String,
    pub occurred_at: i64,
    pub order_id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub quantity: i32,
}

impl OrderCanceledEvent {
    pub fn new(order_id: i64, user_id: i64, product_id: i64, quantity: i32) -> Self {
        Self {
            event_id: deterministic_event_id(order_id, product_id, user_id, "cancel"),
            occurred_at: Utc::now().timestamp(),
            order_id,
            user_id,
            product_id,
            quantity,
        }
    }
}

/// Audit trail for stock mutations, published with routing key `stock.change`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockLogMessage {
    pub product_id: i64,
    pub delta: i32,
    pub reason: String,
    pub time_unix: i64,
}

impl StockLogMessage {
    pub fn new(product_id: i64, delta: i32, reason: &str) -> Self {
        Self {
            product_id,
            delta,
            reason: reason.to_string(),
            time_unix: Utc::now().timestamp(),
        }
    }
}
