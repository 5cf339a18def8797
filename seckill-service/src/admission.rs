//! Admission pipeline: one attempt per user per product, stock as the
//! authoritative gate, async order hand-off, compensation on any failure
//! past the deduct.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use num_traits::ToPrimitive;
use tracing::{debug, error, info, warn};

use shared::{OrderCreateMessage, StockLogMessage};

use crate::error::{AdmissionError, StockError};
use crate::mq::pool::ProducerPool;
use crate::stock::StockEngine;
use crate::store::hot::HotStore;

const WINDOW_CHECK_DEADLINE: Duration = Duration::from_millis(200);
const LOOKUP_DEADLINE: Duration = Duration::from_millis(150);
const PUBLISH_DEADLINE: Duration = Duration::from_millis(300);

#[derive(Debug)]
pub struct AdmissionAck {
    pub message: &'static str,
}

pub struct AdmissionService {
    hot: Arc<HotStore>,
    stock: Arc<StockEngine>,
    pool: Arc<ProducerPool>,
}

impl AdmissionService {
    pub fn new(hot: Arc<HotStore>, stock: Arc<StockEngine>, pool: Arc<ProducerPool>) -> Self {
        Self { hot, stock, pool }
    }

    /// The per-request pipeline. The order id is assigned later by the
    /// consumer and is never returned synchronously.
    pub async fn execute(
        &self,
        user_id: i64,
        product_id: i64,
        quantity: i32,
    ) -> Result<AdmissionAck, AdmissionError> {
        if user_id <= 0 || product_id <= 0 {
            return Err(AdmissionError::Validation("invalid user or product id"));
        }
        if quantity <= 0 {
            return Err(AdmissionError::Validation("quantity must be positive"));
        }

        // Fast pre-check of the sale window. Best effort: on timeout the
        // stock gate below still decides.
        match tokio::time::timeout(WINDOW_CHECK_DEADLINE, self.stock.get_product(product_id)).await
        {
            Ok(Ok(product)) => {
                if let (Some(start), Some(end)) =
                    (product.seckill_start_time, product.seckill_end_time)
                {
                    let now = Utc::now();
                    if now < start {
                        return Err(AdmissionError::NotStarted);
                    }
                    if now > end {
                        return Err(AdmissionError::Ended);
                    }
                }
            }
            Ok(Err(StockError::ProductNotFound)) => return Err(AdmissionError::ProductNotFound),
            _ => {}
        }

        // 1. Participation dedup: first set-add wins the slot.
        let joined_key = shared::joined_key(product_id);
        let member = user_id.to_string();
        if !self.hot.sadd(&joined_key, &member, Some(shared::JOINED_TTL)) {
            return Err(AdmissionError::AlreadyJoined);
        }

        // 2. Stock is the authoritative gate.
        let left = match self.stock.deduct(product_id, quantity).await {
            Ok(left) => left,
            Err(StockError::OutOfStock) => {
                self.unjoin(product_id, user_id);
                return Err(AdmissionError::OutOfStock);
            }
            Err(StockError::ProductNotFound) => {
                self.unjoin(product_id, user_id);
                return Err(AdmissionError::ProductNotFound);
            }
            Err(e) => {
                warn!(user_id, product_id, error = %e, "stock deduct failed");
                self.unjoin(product_id, user_id);
                return Err(AdmissionError::Busy);
            }
        };
        self.publish_stock_log(product_id, -quantity, "seckill_deduct");

        // 3. Price lookup for the order total.
        let product = match tokio::time::timeout(
            LOOKUP_DEADLINE,
            self.stock.get_product(product_id),
        )
        .await
        {
            Ok(Ok(product)) => product,
            other => {
                warn!(user_id, product_id, ?other, "product lookup failed after deduct");
                self.compensate(product_id, user_id, quantity, "seckill_lookup_fail").await;
                return Err(AdmissionError::Busy);
            }
        };
        let total_price = (&product.price * BigDecimal::from(quantity))
            .to_f64()
            .unwrap_or_default();

        // 4. Async hand-off to the order pipeline.
        let message = OrderCreateMessage { user_id, product_id, quantity, total_price };
        let message_id = shared::create_message_id(user_id, product_id);
        let body = match serde_json::to_vec(&message) {
            Ok(body) => body,
            Err(e) => {
                error!(user_id, product_id, error = %e, "order create message encoding failed");
                self.compensate(product_id, user_id, quantity, "seckill_encode_fail").await;
                return Err(AdmissionError::Busy);
            }
        };
        let published = tokio::time::timeout(
            PUBLISH_DEADLINE,
            self.pool
                .publish_async(shared::EXCHANGE, shared::KEY_ORDER_CREATE, body, &message_id),
        )
        .await;
        match published {
            Ok(Ok(())) => {}
            other => {
                warn!(user_id, product_id, ?other, "order create publish failed");
                self.compensate(product_id, user_id, quantity, "seckill_publish_fail").await;
                return Err(AdmissionError::Busy);
            }
        }

        info!(user_id, product_id, quantity, left, %message_id, "seckill admission accepted");
        Ok(AdmissionAck { message: "seckill accepted, order is being created" })
    }

    /// Release the participation slot so the user may retry.
    fn unjoin(&self, product_id: i64, user_id: i64) {
        self.hot.srem(&shared::joined_key(product_id), &user_id.to_string());
    }

    /// Undo the deduct and the participation mark after a downstream
    /// failure.
    async fn compensate(&self, product_id: i64, user_id: i64, quantity: i32, reason: &str) {
        match self.stock.restore(product_id, quantity).await {
            Ok(_) => self.publish_stock_log(product_id, quantity, reason),
            Err(e) => {
                error!(product_id, quantity, reason, error = %e, "stock restore failed");
            }
        }
        self.unjoin(product_id, user_id);
    }

    /// Fire-and-forget audit message; never blocks or fails the request.
    fn publish_stock_log(&self, product_id: i64, delta: i32, reason: &str) {
        let message = StockLogMessage::new(product_id, delta, reason);
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let body = match serde_json::to_vec(&message) {
                Ok(body) => body,
                Err(_) => return,
            };
            if let Err(e) = pool
                .publish_async(shared::EXCHANGE, shared::KEY_STOCK_CHANGE, body, "")
                .await
            {
                debug!(error = %e, "stock log publish failed");
            }
        });
    }
}
