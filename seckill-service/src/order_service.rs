//! Order read/cancel/pay state machine. Cancel emits the `order.canceled`
//! event that eventually returns the stock.

use std::sync::Arc;

use tracing::{info, warn};

use shared::OrderCanceledEvent;

use crate::error::OrderError;
use crate::models::{Order, OrderStatus};
use crate::mq::pool::ProducerPool;
use crate::store::durable::Database;

pub struct OrderService {
    db: Arc<Database>,
    pool: Arc<ProducerPool>,
}

impl OrderService {
    pub fn new(db: Arc<Database>, pool: Arc<ProducerPool>) -> Self {
        Self { db, pool }
    }

    pub async fn get(&self, order_id: i64, user_id: i64) -> Result<Order, OrderError> {
        let order = self.db.get_order(order_id).await.ok_or(OrderError::NotFound)?;
        if order.user_id != user_id {
            return Err(OrderError::Forbidden);
        }
        Ok(order)
    }

    pub async fn list_mine(&self, user_id: i64, page: i64, page_size: i64) -> (Vec<Order>, i64) {
        self.db.orders_by_user(user_id, page, page_size).await
    }

    /// Pending → Cancelled, then publish the cancellation event. The
    /// conditional update is the only arbiter; a concurrent pay or cancel
    /// surfaces as `StatusChanged`.
    pub async fn cancel(&self, order_id: i64, user_id: i64) -> Result<(), OrderError> {
        let order = self.db.get_order(order_id).await.ok_or(OrderError::NotFound)?;
        if order.user_id != user_id {
            return Err(OrderError::Forbidden);
        }
        if order.status != OrderStatus::Pending {
            // Not cancellable; also avoids returning stock twice.
            return Err(OrderError::StatusChanged);
        }

        let changed = self
            .db
            .transition_order(order_id, user_id, OrderStatus::Pending, OrderStatus::Cancelled)
            .await
            .map_err(|e| OrderError::Unavailable(e.to_string()))?;
        if !changed {
            return Err(OrderError::StatusChanged);
        }

        // Deterministic event id, so a replayed cancel collapses on the
        // consumer's dedup key. Publish failure is logged, not surfaced: the
        // order is already cancelled.
        let event = OrderCanceledEvent::new(order_id, user_id, order.product_id, order.quantity);
        match serde_json::to_vec(&event) {
            Ok(body) => {
                match self
                    .pool
                    .publish_async(shared::EXCHANGE, shared::KEY_ORDER_CANCELED, body, &event.event_id)
                    .await
                {
                    Ok(()) => {
                        info!(
                            order_id,
                            product_id = order.product_id,
                            quantity = order.quantity,
                            event_id = %event.event_id,
                            "order canceled event published"
                        );
                    }
                    Err(e) => {
                        warn!(order_id, error = %e, "order canceled event publish failed");
                    }
                }
            }
            Err(e) => warn!(order_id, error = %e, "order canceled event encoding failed"),
        }

        Ok(())
    }

    /// Pending → Paid. Payment itself is modeled as this transition only.
    pub async fn pay(&self, order_id: i64, user_id: i64) -> Result<(), OrderError> {
        let order = self.db.get_order(order_id).await.ok_or(OrderError::NotFound)?;
        if order.user_id != user_id {
            return Err(OrderError::Forbidden);
        }
        if order.status != OrderStatus::Pending {
            return Err(OrderError::StatusChanged);
        }

        let changed = self
            .db
            .transition_order(order_id, user_id, OrderStatus::Pending, OrderStatus::Paid)
            .await
            .map_err(|e| OrderError::Unavailable(e.to_string()))?;
        if !changed {
            return Err(OrderError::StatusChanged);
        }
        info!(order_id, user_id, "order paid");
        Ok(())
    }
}
