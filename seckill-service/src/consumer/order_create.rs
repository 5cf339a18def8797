//! Order-create consumer: message-id dedup, batched durable inserts,
//! per-batch ack/nack, poison messages to the DLQ.

use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use num_traits::FromPrimitive;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use shared::OrderCreateMessage;

use crate::config::{ConsumerConfig, ConsumerMode};
use crate::models::NewOrder;
use crate::mq::{Delivery, QueueConsumer};
use crate::store::durable::Database;
use crate::store::hot::HotStore;

pub struct OrderCreateConsumer {
    hot: Arc<HotStore>,
    db: Arc<Database>,
    mode: ConsumerMode,
    batch_size: usize,
    flush_interval: Duration,
}

impl OrderCreateConsumer {
    pub fn new(hot: Arc<HotStore>, db: Arc<Database>, config: &ConsumerConfig) -> Self {
        Self {
            hot,
            db,
            mode: config.mode,
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms.max(1)),
        }
    }

    pub async fn run(&self, consumer: QueueConsumer, mut shutdown: watch::Receiver<bool>) {
        info!(batch_size = self.batch_size, mode = ?self.mode, "order create consumer started");
        let mut batch: Vec<(Delivery, NewOrder)> = Vec::with_capacity(self.batch_size);
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    // Drain once, then stop reading.
                    self.flush(&mut batch).await;
                    break;
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                }
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else {
                        self.flush(&mut batch).await;
                        break;
                    };
                    self.accept(delivery, &mut batch);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch).await;
                    }
                }
            }
        }
        info!("order create consumer stopped");
    }

    fn accept(&self, delivery: Delivery, batch: &mut Vec<(Delivery, NewOrder)>) {
        let message_id = delivery.message_id().to_string();
        if !message_id.is_empty() {
            let first = self.hot.set_nx(
                &shared::msg_done_key(&message_id),
                1,
                Some(shared::MSG_DONE_TTL),
            );
            if !first {
                debug!(%message_id, "duplicate delivery, acking");
                delivery.ack();
                return;
            }
        }

        match serde_json::from_slice::<OrderCreateMessage>(&delivery.envelope.body) {
            Ok(message) if message.quantity > 0 => {
                let order = NewOrder {
                    user_id: message.user_id,
                    product_id: message.product_id,
                    quantity: message.quantity,
                    total_price: BigDecimal::from_f64(message.total_price).unwrap_or_default(),
                };
                batch.push((delivery, order));
            }
            Ok(message) => {
                warn!(
                    %message_id,
                    quantity = message.quantity,
                    "order create message with non-positive quantity, dead-lettering"
                );
                delivery.nack(false);
            }
            Err(e) => {
                warn!(%message_id, error = %e, "unparseable order create message, dead-lettering");
                delivery.nack(false);
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<(Delivery, NewOrder)>) {
        if batch.is_empty() {
            return;
        }
        let items = std::mem::take(batch);
        let orders: Vec<NewOrder> = items.iter().map(|(_, order)| order.clone()).collect();

        let result = match self.mode {
            ConsumerMode::Aggressive => self
                .db
                .insert_orders(&orders)
                .await
                .map(|ids| (ids, Vec::new())),
            ConsumerMode::Conservative => self
                .db
                .insert_orders_decrementing(&orders)
                .await
                .map(|outcome| (outcome.inserted, outcome.rejected)),
        };

        match result {
            Ok((inserted, rejected)) => {
                info!(inserted = inserted.len(), rejected = rejected.len(), "order batch persisted");
                for (idx, (delivery, _)) in items.into_iter().enumerate() {
                    if rejected.contains(&idx) {
                        warn!(
                            message_id = delivery.message_id(),
                            "durable stock rejected order, dead-lettering"
                        );
                        self.drop_done_mark(delivery.message_id());
                        delivery.nack(false);
                    } else {
                        delivery.ack();
                    }
                }
            }
            Err(e) => {
                error!(count = items.len(), error = %e, "order batch insert failed, requeueing");
                for (delivery, _) in items {
                    // Clear the idempotency mark so the redelivery can pass dedup.
                    self.drop_done_mark(delivery.message_id());
                    delivery.nack(true);
                }
            }
        }
    }

    fn drop_done_mark(&self, message_id: &str) {
        if !message_id.is_empty() {
            self.hot.del(&shared::msg_done_key(message_id));
        }
    }
}
