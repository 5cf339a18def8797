mod common;

use common::*;
use seckill_service::config::ReconcilerConfig;
use seckill_service::reconciler::Reconciler;

/// After a quiescent period every dirty product converges: durable stock
/// equals hot stock.
#[tokio::test]
async fn quiescent_stores_converge() {
    let app = TestApp::spawn().await;
    for id in 1..=5_i64 {
        app.seed_product(id, 10, 100).await;
    }

    for id in 1..=5_i64 {
        app.stock.deduct(id, id as i32).await.unwrap();
    }
    // drive ticks until the dirty set is drained
    for _ in 0..5 {
        app.reconciler.tick().await;
        if app.hot.scard(shared::DIRTY_SET_KEY) == 0 {
            break;
        }
    }

    for id in 1..=5_i64 {
        let hot = app.hot_stock(id).unwrap();
        let durable = i64::from(app.db.product_stock(id).await.unwrap());
        assert_eq!(hot, durable, "product {id} diverged");
        assert_eq!(durable, 100 - id);
    }
    app.stop().await;
}

/// A failed batch write re-adds the popped ids so no delta is lost.
#[tokio::test]
async fn failed_write_readds_dirty_ids() {
    let app = TestApp::spawn().await;
    app.seed_product(1003, 10, 100).await;
    app.stock.deduct(1003, 4).await.unwrap();
    assert!(app.hot.smembers(shared::DIRTY_SET_KEY).contains(&"1003".to_string()));

    app.db.fail_writes(true);
    app.reconciler.tick().await;
    assert!(app.hot.smembers(shared::DIRTY_SET_KEY).contains(&"1003".to_string()));
    assert_eq!(app.db.product_stock(1003).await, Some(100));

    app.db.fail_writes(false);
    app.reconciler.tick().await;
    assert_eq!(app.db.product_stock(1003).await, Some(96));
    assert_eq!(app.hot.scard(shared::DIRTY_SET_KEY), 0);
    app.stop().await;
}

/// Dirty ids whose hot key disappeared are dropped, not retried forever.
#[tokio::test]
async fn missing_hot_keys_are_dropped() {
    let app = TestApp::spawn().await;
    app.seed_product(1003, 10, 100).await;
    app.hot.sadd(shared::DIRTY_SET_KEY, "1003", None);
    app.hot.sadd(shared::DIRTY_SET_KEY, "not-a-number", None);

    app.reconciler.tick().await;
    assert_eq!(app.hot.scard(shared::DIRTY_SET_KEY), 0);
    assert_eq!(app.db.product_stock(1003).await, Some(100));
    app.stop().await;
}

/// With the monotonic guard a rehydrated (larger) hot counter cannot roll
/// the durable stock forward during a sale.
#[tokio::test]
async fn monotonic_guard_blocks_increases() {
    let app = TestApp::spawn().await;
    app.seed_product(1003, 10, 10).await;
    let guarded = Reconciler::new(
        app.hot.clone(),
        app.db.clone(),
        &ReconcilerConfig { interval_ms: 50, batch: 1000, monotonic_guard: true },
    );

    // hot counter larger than durable: blocked
    app.hot.set_int(&shared::stock_key(1003), 25, None);
    app.hot.sadd(shared::DIRTY_SET_KEY, "1003", None);
    guarded.tick().await;
    assert_eq!(app.db.product_stock(1003).await, Some(10));

    // smaller: applied
    app.hot.set_int(&shared::stock_key(1003), 4, None);
    app.hot.sadd(shared::DIRTY_SET_KEY, "1003", None);
    guarded.tick().await;
    assert_eq!(app.db.product_stock(1003).await, Some(4));
    app.stop().await;
}
