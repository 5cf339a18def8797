//! Cancellation consumer: event-id dedup, stock return, requeue on
//! transient failure.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use shared::OrderCanceledEvent;

use crate::mq::{Delivery, QueueConsumer};
use crate::stock::StockEngine;
use crate::store::hot::HotStore;

pub struct CancelConsumer {
    hot: Arc<HotStore>,
    stock: Arc<StockEngine>,
}

impl CancelConsumer {
    pub fn new(hot: Arc<HotStore>, stock: Arc<StockEngine>) -> Self {
        Self { hot, stock }
    }

    pub async fn run(&self, consumer: QueueConsumer, mut shutdown: watch::Receiver<bool>) {
        info!("cancel consumer started");
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { break };
                    self.handle(delivery).await;
                }
            }
        }
        info!("cancel consumer stopped");
    }

    async fn handle(&self, delivery: Delivery) {
        let event = match serde_json::from_slice::<OrderCanceledEvent>(&delivery.envelope.body) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "unparseable order canceled event, dropping");
                delivery.nack(false);
                return;
            }
        };

        let dedup_key = shared::event_dedup_key(&event.event_id);
        if !self.hot.set_nx(&dedup_key, 1, Some(shared::EVENT_DEDUP_TTL)) {
            debug!(event_id = %event.event_id, "order canceled event already processed");
            delivery.ack();
            return;
        }

        if event.quantity > 0 && event.product_id > 0 {
            match self.stock.restore(event.product_id, event.quantity).await {
                Ok(stock) => {
                    info!(
                        order_id = event.order_id,
                        product_id = event.product_id,
                        quantity = event.quantity,
                        stock,
                        "stock returned for canceled order"
                    );
                }
                Err(e) => {
                    error!(
                        order_id = event.order_id,
                        product_id = event.product_id,
                        error = %e,
                        "stock return failed, requeueing"
                    );
                    // Release the dedup key so the redelivery retries.
                    self.hot.del(&dedup_key);
                    delivery.nack(true);
                    return;
                }
            }
        }
        delivery.ack();
    }
}
