//! Durable store: authoritative product and order rows.
//!
//! The admission hot path never touches this store; only warmup, the order
//! consumer, the reconciler, and the order state machine do. Writes that the
//! production deployment would send as one SQL statement (batch insert,
//! conditional status update, batched CASE stock update) are implemented as
//! one atomic step under the table lock here, so the failure and retry
//! semantics the callers depend on are identical.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use thiserror::Error;

use crate::models::{NewOrder, NewProduct, Order, OrderStatus, Product};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database rejected the write")]
    WriteRejected,
}

/// Outcome of a conservative-mode batch insert: orders whose conditional
/// stock decrement did not hold are reported back by batch index.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub inserted: Vec<i64>,
    pub rejected: Vec<usize>,
}

pub struct Database {
    products: RwLock<BTreeMap<i64, Product>>,
    orders: RwLock<BTreeMap<i64, Order>>,
    next_product_id: AtomicI64,
    next_order_id: AtomicI64,
    fail_writes: AtomicBool,
}

impl Database {
    pub fn new() -> Self {
        Self {
            products: RwLock::new(BTreeMap::new()),
            orders: RwLock::new(BTreeMap::new()),
            next_product_id: AtomicI64::new(1),
            next_order_id: AtomicI64::new(1),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Makes every subsequent write fail, until switched back. Test hook for
    /// exercising requeue and dirty-set re-add paths.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn write_allowed(&self) -> Result<(), DbError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(DbError::WriteRejected)
        } else {
            Ok(())
        }
    }

    pub async fn insert_product(&self, new: NewProduct) -> Result<i64, DbError> {
        self.write_allowed()?;
        let id = self.next_product_id.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let product = Product {
            id,
            name: new.name,
            price: new.price,
            stock: new.stock,
            seckill_start_time: new.seckill_start_time,
            seckill_end_time: new.seckill_end_time,
            created_at: now,
            updated_at: now,
        };
        self.products.write().insert(id, product);
        Ok(id)
    }

    /// Upsert a fully-formed row, explicit id included. Used by seeding and
    /// tests; `insert_product` is the API-facing path.
    pub async fn put_product(&self, product: Product) {
        let next = product.id + 1;
        self.next_product_id.fetch_max(next, Ordering::SeqCst);
        self.products.write().insert(product.id, product);
    }

    pub async fn get_product(&self, id: i64) -> Option<Product> {
        self.products.read().get(&id).cloned()
    }

    pub async fn product_stock(&self, id: i64) -> Option<i32> {
        self.products.read().get(&id).map(|p| p.stock)
    }

    /// One batched conditional stock write, the reconciler's merge step.
    /// With `monotonic_guard` only decreases are applied. Returns the number
    /// of rows updated.
    pub async fn apply_stock_batch(
        &self,
        pairs: &[(i64, i32)],
        monotonic_guard: bool,
    ) -> Result<usize, DbError> {
        self.write_allowed()?;
        let now = Utc::now();
        let mut products = self.products.write();
        let mut updated = 0;
        for (id, stock) in pairs {
            if let Some(product) = products.get_mut(id) {
                if monotonic_guard && product.stock <= *stock {
                    continue;
                }
                product.stock = *stock;
                product.updated_at = now;
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Insert a whole batch in one transaction-equivalent step. Either every
    /// order lands or none does.
    pub async fn insert_orders(&self, batch: &[NewOrder]) -> Result<Vec<i64>, DbError> {
        self.write_allowed()?;
        let now = Utc::now();
        let mut orders = self.orders.write();
        let mut ids = Vec::with_capacity(batch.len());
        for new in batch {
            let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
            orders.insert(
                id,
                Order {
                    id,
                    user_id: new.user_id,
                    product_id: new.product_id,
                    quantity: new.quantity,
                    total_price: new.total_price.clone(),
                    status: OrderStatus::Pending,
                    created_at: now,
                    updated_at: now,
                },
            );
            ids.push(id);
        }
        Ok(ids)
    }

    /// Conservative-mode variant: each order also decrements the product's
    /// durable stock, guarded by `stock >= quantity`. Orders failing the
    /// guard are skipped and reported by index.
    pub async fn insert_orders_decrementing(
        &self,
        batch: &[NewOrder],
    ) -> Result<BatchOutcome, DbError> {
        self.write_allowed()?;
        let now = Utc::now();
        let mut products = self.products.write();
        let mut orders = self.orders.write();
        let mut outcome = BatchOutcome::default();
        for (idx, new) in batch.iter().enumerate() {
            let available = products
                .get(&new.product_id)
                .map(|p| p.stock >= new.quantity)
                .unwrap_or(false);
            if !available {
                outcome.rejected.push(idx);
                continue;
            }
            if let Some(product) = products.get_mut(&new.product_id) {
                product.stock -= new.quantity;
                product.updated_at = now;
            }
            let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
            orders.insert(
                id,
                Order {
                    id,
                    user_id: new.user_id,
                    product_id: new.product_id,
                    quantity: new.quantity,
                    total_price: new.total_price.clone(),
                    status: OrderStatus::Pending,
                    created_at: now,
                    updated_at: now,
                },
            );
            outcome.inserted.push(id);
        }
        Ok(outcome)
    }

    pub async fn get_order(&self, id: i64) -> Option<Order> {
        self.orders.read().get(&id).cloned()
    }

    /// Newest first, paged. Returns the page plus the total row count.
    pub async fn orders_by_user(&self, user_id: i64, page: i64, page_size: i64) -> (Vec<Order>, i64) {
        let orders = self.orders.read();
        let mine: Vec<Order> = orders
            .values()
            .rev()
            .filter(|o| o.user_id == user_id)
            .cloned()
            .collect();
        let total = mine.len() as i64;
        let offset = ((page.max(1) - 1) * page_size) as usize;
        let rows = mine.into_iter().skip(offset).take(page_size as usize).collect();
        (rows, total)
    }

    /// Conditional transition `WHERE id = ? AND user_id = ? AND status = from`.
    /// Returns false when zero rows matched.
    pub async fn transition_order(
        &self,
        order_id: i64,
        user_id: i64,
        from: OrderStatus,
        to: OrderStatus,
    ) -> Result<bool, DbError> {
        self.write_allowed()?;
        let mut orders = self.orders.write();
        match orders.get_mut(&order_id) {
            Some(order) if order.user_id == user_id && order.status == from => {
                order.status = to;
                order.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn orders_for_product(&self, product_id: i64) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| o.product_id == product_id)
            .cloned()
            .collect()
    }

    pub async fn order_count(&self) -> usize {
        self.orders.read().len()
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use bigdecimal::BigDecimal;

    use super::*;

    fn order_for(user_id: i64, product_id: i64, quantity: i32) -> NewOrder {
        NewOrder {
            user_id,
            product_id,
            quantity,
            total_price: BigDecimal::from(99) * BigDecimal::from(quantity),
        }
    }

    #[tokio::test]
    async fn batch_insert_assigns_sequential_ids() {
        let db = Database::new();
        let ids = db
            .insert_orders(&[order_for(1, 1003, 1), order_for(2, 1003, 1)])
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(db.order_count().await, 2);
    }

    #[tokio::test]
    async fn conditional_transition_reports_zero_rows() {
        let db = Database::new();
        let ids = db.insert_orders(&[order_for(7, 1003, 1)]).await.unwrap();
        let id = ids[0];

        // wrong user
        assert!(!db
            .transition_order(id, 8, OrderStatus::Pending, OrderStatus::Cancelled)
            .await
            .unwrap());
        // happy path
        assert!(db
            .transition_order(id, 7, OrderStatus::Pending, OrderStatus::Cancelled)
            .await
            .unwrap());
        // already cancelled
        assert!(!db
            .transition_order(id, 7, OrderStatus::Pending, OrderStatus::Paid)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn stock_batch_honours_the_monotonic_guard() {
        let db = Database::new();
        db.put_product(Product {
            id: 1003,
            name: "widget".into(),
            price: BigDecimal::from(99),
            stock: 10,
            seckill_start_time: None,
            seckill_end_time: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await;

        // guard on: an increase is skipped
        let n = db.apply_stock_batch(&[(1003, 20)], true).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(db.product_stock(1003).await, Some(10));

        // guard on: a decrease is applied
        let n = db.apply_stock_batch(&[(1003, 4)], true).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(db.product_stock(1003).await, Some(4));

        // guard off: blind overwrite
        let n = db.apply_stock_batch(&[(1003, 20)], false).await.unwrap();
        assert_eq!(n, 1);
        assert_eq!(db.product_stock(1003).await, Some(20));
    }

    #[tokio::test]
    async fn conservative_insert_rejects_on_exhausted_stock() {
        let db = Database::new();
        db.put_product(Product {
            id: 1003,
            name: "widget".into(),
            price: BigDecimal::from(99),
            stock: 1,
            seckill_start_time: None,
            seckill_end_time: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        })
        .await;

        let outcome = db
            .insert_orders_decrementing(&[order_for(1, 1003, 1), order_for(2, 1003, 1)])
            .await
            .unwrap();
        assert_eq!(outcome.inserted.len(), 1);
        assert_eq!(outcome.rejected, vec![1]);
        assert_eq!(db.product_stock(1003).await, Some(0));
    }

    #[tokio::test]
    async fn write_failure_injection_rejects_everything() {
        let db = Database::new();
        db.fail_writes(true);
        assert!(db.insert_orders(&[order_for(1, 1, 1)]).await.is_err());
        db.fail_writes(false);
        assert!(db.insert_orders(&[order_for(1, 1, 1)]).await.is_ok());
    }
}
