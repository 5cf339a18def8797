//! Producer channel pool with background confirm drains.
//!
//! Channels are exclusive while held: acquisition takes a semaphore slot and
//! pops from the free list, release pushes back and returns the slot. One
//! drain task per channel reads the confirm stream and logs anything that
//! was not acked.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{info, warn};

use super::{Broker, BrokerError, Channel};

pub const DEFAULT_POOL_SIZE: usize = 16;

pub struct ProducerPool {
    broker: Broker,
    free: Mutex<VecDeque<Channel>>,
    slots: Arc<Semaphore>,
}

impl ProducerPool {
    pub fn new(broker: Broker, size: usize) -> Self {
        let size = if size == 0 { DEFAULT_POOL_SIZE } else { size };
        let mut free = VecDeque::with_capacity(size);
        for _ in 0..size {
            let (channel, mut confirms) = broker.channel();
            tokio::spawn(async move {
                while let Some(confirmation) = confirms.recv().await {
                    if !confirmation.ack {
                        warn!(delivery_tag = confirmation.delivery_tag, "publish not acked");
                    }
                }
            });
            free.push_back(channel);
        }
        info!(size, "producer channel pool initialized");
        Self {
            broker,
            free: Mutex::new(free),
            slots: Arc::new(Semaphore::new(size)),
        }
    }

    async fn acquire(&self) -> Result<(Channel, OwnedSemaphorePermit), BrokerError> {
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BrokerError::ConnectionLost)?;
        // FIFO rotation, so publishes cycle through every channel.
        let channel = self
            .free
            .lock()
            .pop_front()
            .ok_or(BrokerError::ConnectionLost)?;
        Ok((channel, permit))
    }

    fn release(&self, channel: Channel, permit: OwnedSemaphorePermit) {
        self.free.lock().push_back(channel);
        drop(permit);
    }

    /// Publish without waiting for the confirmation; the channel's drain
    /// task picks it up.
    pub async fn publish_async(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        message_id: &str,
    ) -> Result<(), BrokerError> {
        let (channel, permit) = self.acquire().await?;
        let result = channel.publish(exchange, routing_key, body, message_id);
        self.release(channel, permit);
        result.map(|_| ())
    }

    /// Publish on a dedicated channel and wait for its confirmation. For the
    /// rare critical message, not the admission hot path.
    pub async fn publish_sync(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        message_id: &str,
        confirm_timeout: Duration,
    ) -> Result<(), BrokerError> {
        let (channel, mut confirms) = self.broker.channel();
        channel.publish(exchange, routing_key, body, message_id)?;
        match tokio::time::timeout(confirm_timeout, confirms.recv()).await {
            Ok(Some(confirmation)) if confirmation.ack => Ok(()),
            Ok(_) => Err(BrokerError::Nacked),
            Err(_) => Err(BrokerError::ConfirmTimeout),
        }
    }

    /// Drop every pooled channel and refuse further acquisitions. The drain
    /// tasks end once their confirm senders are gone.
    pub fn close(&self) {
        self.slots.close();
        self.free.lock().clear();
        info!("producer channel pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::declare_topology;

    #[tokio::test]
    async fn async_publish_lands_in_the_bound_queue() {
        let broker = Broker::new();
        declare_topology(&broker).unwrap();
        let pool = ProducerPool::new(broker.clone(), 4);

        pool.publish_async(shared::EXCHANGE, shared::KEY_ORDER_CREATE, b"{}".to_vec(), "m-1")
            .await
            .unwrap();
        assert_eq!(broker.queue_depth(shared::QUEUE_ORDER_CREATE), 1);
    }

    #[tokio::test]
    async fn sync_publish_waits_for_the_confirm() {
        let broker = Broker::new();
        declare_topology(&broker).unwrap();
        let pool = ProducerPool::new(broker.clone(), 2);

        pool.publish_sync(
            shared::EXCHANGE,
            shared::KEY_ORDER_CANCELED,
            b"{}".to_vec(),
            "m-2",
            Duration::from_millis(300),
        )
        .await
        .unwrap();
        assert_eq!(broker.queue_depth(shared::QUEUE_ORDER_CANCELED), 1);
    }

    #[tokio::test]
    async fn closed_pool_refuses_publishes() {
        let broker = Broker::new();
        declare_topology(&broker).unwrap();
        let pool = ProducerPool::new(broker.clone(), 2);
        pool.close();
        let err = pool
            .publish_async(shared::EXCHANGE, shared::KEY_ORDER_CREATE, b"{}".to_vec(), "m-3")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::ConnectionLost));
    }

    #[tokio::test]
    async fn channels_cycle_through_the_pool() {
        let broker = Broker::new();
        declare_topology(&broker).unwrap();
        let pool = Arc::new(ProducerPool::new(broker.clone(), 2));

        let mut handles = Vec::new();
        for i in 0..20 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.publish_async(
                    shared::EXCHANGE,
                    shared::KEY_ORDER_CREATE,
                    b"{}".to_vec(),
                    &format!("m-{i}"),
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(broker.queue_depth(shared::QUEUE_ORDER_CREATE), 20);
    }
}
