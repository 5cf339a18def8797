//! Stock engine: atomic deduct/return against the hot counter, lazy warmup
//! from the durable store, and the read-through product cache.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, error, info};

use crate::error::StockError;
use crate::models::Product;
use crate::store::durable::Database;
use crate::store::hot::{Deduct, HotStore, Restore};

/// Overall bound on a deduct/return that has to warm the key first.
const WARMUP_DEADLINE: Duration = Duration::from_secs(5);
/// A loser of the warmup lock sleeps roughly this long before retrying.
const WARMUP_RETRY_MS: (u64, u64) = (150, 250);
const CACHE_SECOND_DELETE_DELAY: Duration = Duration::from_millis(100);

pub struct StockEngine {
    hot: Arc<HotStore>,
    db: Arc<Database>,
    return_cap: i64,
}

impl StockEngine {
    pub fn new(hot: Arc<HotStore>, db: Arc<Database>, return_cap: i64) -> Self {
        Self { hot, db, return_cap }
    }

    /// Atomically take `quantity` off `stock:{product_id}`, warming the key
    /// from the durable store on first access. Returns the remaining stock.
    pub async fn deduct(&self, product_id: i64, quantity: i32) -> Result<i64, StockError> {
        if quantity <= 0 {
            return Err(StockError::Internal("non-positive quantity".to_string()));
        }
        let key = shared::stock_key(product_id);
        let deadline = tokio::time::Instant::now() + WARMUP_DEADLINE;
        loop {
            match self.hot.deduct(&key, i64::from(quantity)) {
                Deduct::NewValue(left) => {
                    self.mark_dirty(product_id);
                    self.invalidate_product_cache(product_id);
                    debug!(product_id, quantity, left, "stock deducted");
                    return Ok(left);
                }
                Deduct::Insufficient => return Err(StockError::OutOfStock),
                Deduct::Missing => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StockError::Unavailable("stock warmup timed out".to_string()));
                    }
                    self.warm_or_wait(product_id, &key).await?;
                }
            }
        }
    }

    /// Put `quantity` back, guarded by the configured upper bound.
    pub async fn restore(&self, product_id: i64, quantity: i32) -> Result<i64, StockError> {
        if quantity <= 0 {
            return Err(StockError::Internal("non-positive quantity".to_string()));
        }
        let key = shared::stock_key(product_id);
        let deadline = tokio::time::Instant::now() + WARMUP_DEADLINE;
        loop {
            match self.hot.restore(&key, i64::from(quantity), self.return_cap) {
                Restore::NewValue(stock) => {
                    self.mark_dirty(product_id);
                    self.invalidate_product_cache(product_id);
                    debug!(product_id, quantity, stock, "stock returned");
                    return Ok(stock);
                }
                Restore::OverCap => {
                    error!(product_id, quantity, cap = self.return_cap, "stock return over cap");
                    return Err(StockError::ReturnOverflow);
                }
                Restore::Missing => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(StockError::Unavailable("stock warmup timed out".to_string()));
                    }
                    self.warm_or_wait(product_id, &key).await?;
                }
            }
        }
    }

    /// Exactly one caller per product warms the key; everyone else backs off
    /// and retries against the (by then) warmed counter.
    async fn warm_or_wait(&self, product_id: i64, key: &str) -> Result<(), StockError> {
        let lock_key = shared::warmup_lock_key(product_id);
        if self.hot.set_nx(&lock_key, 1, Some(shared::WARMUP_LOCK_TTL)) {
            let result = self.load_stock_from_db(product_id, key).await;
            self.hot.del(&lock_key);
            result
        } else {
            let jitter: u64 = rand::thread_rng().gen_range(WARMUP_RETRY_MS.0..WARMUP_RETRY_MS.1);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
            Ok(())
        }
    }

    async fn load_stock_from_db(&self, product_id: i64, key: &str) -> Result<(), StockError> {
        // Double check: another warmer may have finished before we took the lock.
        if self.hot.exists(key) {
            return Ok(());
        }
        let product = self
            .db
            .get_product(product_id)
            .await
            .ok_or(StockError::ProductNotFound)?;
        // No expiration: the counter is authoritative for the rest of the sale.
        self.hot.set_int(key, i64::from(product.stock), None);
        info!(product_id, stock = product.stock, "stock key warmed from durable store");
        Ok(())
    }

    /// Read-through cached product lookup.
    pub async fn get_product(&self, product_id: i64) -> Result<Product, StockError> {
        let cache_key = shared::product_cache_key(product_id);
        if let Some(json) = self.hot.get_str(&cache_key) {
            match serde_json::from_str::<Product>(&json) {
                Ok(product) => return Ok(product),
                Err(_) => {
                    // Corrupt cache entry; fall through to the durable read.
                    self.hot.del(&cache_key);
                }
            }
        }
        let product = self
            .db
            .get_product(product_id)
            .await
            .ok_or(StockError::ProductNotFound)?;
        if let Ok(json) = serde_json::to_string(&product) {
            self.hot.set_str(&cache_key, json, Some(shared::PRODUCT_CACHE_TTL));
        }
        Ok(product)
    }

    fn mark_dirty(&self, product_id: i64) {
        self.hot.sadd(shared::DIRTY_SET_KEY, &product_id.to_string(), None);
    }

    /// Delete now and once more shortly after: a reader racing the deduct
    /// can repopulate the cache from the stale durable row in between, and
    /// the second delete closes that window.
    fn invalidate_product_cache(&self, product_id: i64) {
        let cache_key = shared::product_cache_key(product_id);
        self.hot.del(&cache_key);
        let hot = self.hot.clone();
        tokio::spawn(async move {
            tokio::time::sleep(CACHE_SECOND_DELETE_DELAY).await;
            hot.del(&cache_key);
        });
    }
}
