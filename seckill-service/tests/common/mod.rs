#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bigdecimal::BigDecimal;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use seckill_service::admission::AdmissionService;
use seckill_service::api::{self, AppState};
use seckill_service::auth::JwtKeys;
use seckill_service::config::{ConsumerConfig, ConsumerMode, ReconcilerConfig};
use seckill_service::consumer::order_canceled::CancelConsumer;
use seckill_service::consumer::order_create::OrderCreateConsumer;
use seckill_service::models::Product;
use seckill_service::mq::pool::ProducerPool;
use seckill_service::mq::{self, Broker};
use seckill_service::order_service::OrderService;
use seckill_service::rate_limit::IpRateLimiter;
use seckill_service::reconciler::Reconciler;
use seckill_service::stock::StockEngine;
use seckill_service::store::durable::Database;
use seckill_service::store::hot::HotStore;

pub const TEST_JWT_SECRET: &str = "test-secret";

/// The whole pipeline in one process: admission + both consumers wired over
/// an in-process broker. The reconciler is held unspawned so tests drive
/// ticks deterministically.
pub struct TestApp {
    pub hot: Arc<HotStore>,
    pub db: Arc<Database>,
    pub broker: Broker,
    pub pool: Arc<ProducerPool>,
    pub stock: Arc<StockEngine>,
    pub admission: Arc<AdmissionService>,
    pub orders: Arc<OrderService>,
    pub reconciler: Reconciler,
    shutdown_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_mode(ConsumerMode::Aggressive).await
    }

    pub async fn spawn_with_mode(mode: ConsumerMode) -> Self {
        let hot = Arc::new(HotStore::new());
        let db = Arc::new(Database::new());
        let broker = Broker::new();
        mq::declare_topology(&broker).unwrap();
        let pool = Arc::new(ProducerPool::new(broker.clone(), 4));
        let stock = Arc::new(StockEngine::new(hot.clone(), db.clone(), 1_000_000));
        let admission = Arc::new(AdmissionService::new(hot.clone(), stock.clone(), pool.clone()));
        let orders = Arc::new(OrderService::new(db.clone(), pool.clone()));
        let reconciler = Reconciler::new(
            hot.clone(),
            db.clone(),
            &ReconcilerConfig { interval_ms: 50, batch: 1000, monotonic_guard: false },
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut workers = Vec::new();

        let consumer_config =
            ConsumerConfig { batch_size: 8, flush_interval_ms: 25, mode };
        let create_consumer = broker.consume(shared::QUEUE_ORDER_CREATE, 64).unwrap();
        let create_worker = OrderCreateConsumer::new(hot.clone(), db.clone(), &consumer_config);
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            create_worker.run(create_consumer, shutdown).await;
        }));

        let cancel_consumer = broker.consume(shared::QUEUE_ORDER_CANCELED, 64).unwrap();
        let cancel_worker = CancelConsumer::new(hot.clone(), stock.clone());
        let shutdown = shutdown_rx.clone();
        workers.push(tokio::spawn(async move {
            cancel_worker.run(cancel_consumer, shutdown).await;
        }));

        Self {
            hot,
            db,
            broker,
            pool,
            stock,
            admission,
            orders,
            reconciler,
            shutdown_tx,
            workers,
        }
    }

    pub async fn seed_product(&self, id: i64, price: i64, stock: i32) {
        let now = Utc::now();
        self.db
            .put_product(Product {
                id,
                name: format!("product-{id}"),
                price: BigDecimal::from(price),
                stock,
                seckill_start_time: None,
                seckill_end_time: None,
                created_at: now,
                updated_at: now,
            })
            .await;
    }

    pub fn hot_stock(&self, product_id: i64) -> Option<i64> {
        self.hot.get_int(&shared::stock_key(product_id))
    }

    pub fn joined_count(&self, product_id: i64) -> usize {
        self.hot.scard(&shared::joined_key(product_id))
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for worker in self.workers {
            let _ = worker.await;
        }
    }
}

/// Poll until the product has at least `count` persisted orders.
pub async fn wait_for_orders(db: &Database, product_id: i64, count: usize) -> bool {
    for _ in 0..400 {
        if db.orders_for_product(product_id).await.len() >= count {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    db.orders_for_product(product_id).await.len() >= count
}

/// Poll until the hot counter reads the expected value.
pub async fn wait_for_hot_stock(hot: &HotStore, product_id: i64, expected: i64) -> bool {
    let key = shared::stock_key(product_id);
    for _ in 0..400 {
        if hot.get_int(&key) == Some(expected) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    hot.get_int(&key) == Some(expected)
}

/// A short pause for the consumers to make a pass over anything in flight.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(120)).await;
}

/// Serve the HTTP edge for an existing pipeline on an ephemeral port.
/// Returns the base url and the server's shutdown handle.
pub async fn spawn_edge(app: &TestApp, per_sec: u32, burst: u32) -> (String, watch::Sender<bool>) {
    let jwt = JwtKeys::new(TEST_JWT_SECRET, 1);
    let limiter = Arc::new(IpRateLimiter::new(per_sec, burst, Duration::from_secs(300)));
    let state = AppState {
        admission: app.admission.clone(),
        orders: app.orders.clone(),
        db: app.db.clone(),
        jwt,
        limiter,
    };
    let router = api::create_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await
        .unwrap();
    });
    (format!("http://{addr}"), shutdown_tx)
}

pub fn test_token(user_id: i64) -> String {
    JwtKeys::new(TEST_JWT_SECRET, 1)
        .sign(user_id, &format!("user-{user_id}"))
        .unwrap()
}
