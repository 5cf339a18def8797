//! Stock reconciler: merges high-frequency hot-counter deltas into one
//! batched durable write per tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::ReconcilerConfig;
use crate::store::durable::Database;
use crate::store::hot::HotStore;

pub struct Reconciler {
    hot: Arc<HotStore>,
    db: Arc<Database>,
    batch: usize,
    interval: Duration,
    monotonic_guard: bool,
}

impl Reconciler {
    pub fn new(hot: Arc<HotStore>, db: Arc<Database>, config: &ReconcilerConfig) -> Self {
        Self {
            hot,
            db,
            batch: config.batch.max(1),
            interval: Duration::from_millis(config.interval_ms.max(1)),
            monotonic_guard: config.monotonic_guard,
        }
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_ms = self.interval.as_millis() as u64,
            batch = self.batch,
            monotonic_guard = self.monotonic_guard,
            "stock reconciler started"
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.tick().await,
            }
        }
        info!("stock reconciler stopped");
    }

    /// One reconciliation pass: pop a batch of dirty ids, read their hot
    /// counters, apply one batched conditional write.
    pub async fn tick(&self) {
        let members = self.hot.spop_n(shared::DIRTY_SET_KEY, self.batch);
        if members.is_empty() {
            return;
        }

        let mut ids = Vec::with_capacity(members.len());
        for member in &members {
            match member.parse::<i64>() {
                Ok(id) => ids.push(id),
                Err(_) => warn!(member = %member, "non-numeric dirty set member dropped"),
            }
        }

        let mut pairs = Vec::with_capacity(ids.len());
        for id in &ids {
            match self.hot.get_int(&shared::stock_key(*id)) {
                Some(stock) => match i32::try_from(stock) {
                    Ok(stock) => pairs.push((*id, stock)),
                    Err(_) => warn!(product_id = id, stock, "hot stock out of range, dropped"),
                },
                // Key gone (expired or never warmed); nothing to flush.
                None => debug!(product_id = id, "hot stock key missing, dropped"),
            }
        }
        if pairs.is_empty() {
            return;
        }

        match self.db.apply_stock_batch(&pairs, self.monotonic_guard).await {
            Ok(updated) => debug!(updated, popped = members.len(), "stock batch reconciled"),
            Err(e) => {
                error!(error = %e, count = pairs.len(), "stock batch write failed, re-adding dirty ids");
                for (id, _) in &pairs {
                    self.hot.sadd(shared::DIRTY_SET_KEY, &id.to_string(), None);
                }
            }
        }
    }
}
