use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info};

use seckill_service::admission::AdmissionService;
use seckill_service::api::{self, AppState};
use seckill_service::auth::JwtKeys;
use seckill_service::config::AppConfig;
use seckill_service::consumer::dlq::DlqMonitor;
use seckill_service::consumer::order_canceled::CancelConsumer;
use seckill_service::consumer::order_create::OrderCreateConsumer;
use seckill_service::mq::pool::ProducerPool;
use seckill_service::mq::{self, Broker};
use seckill_service::order_service::OrderService;
use seckill_service::rate_limit::IpRateLimiter;
use seckill_service::reconciler::Reconciler;
use seckill_service::stock::StockEngine;
use seckill_service::store::durable::Database;
use seckill_service::store::hot::HotStore;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser)]
#[command(name = "seckill-service")]
struct Args {
    #[arg(long, env = "SECKILL_CONFIG", default_value = "config.yaml")]
    config: String,

    /// Comma-separated roles to run in this process.
    #[arg(
        long,
        env = "SECKILL_ROLES",
        default_value = "edge,order-consumer,cancel-consumer,reconciler,dlq-monitor"
    )]
    roles: String,

    #[arg(long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let mut config = AppConfig::load(&args.config)
        .with_context(|| format!("loading config from {}", args.config))?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    let roles: HashSet<&str> = args.roles.split(',').map(str::trim).collect();

    // Shared bootstrap: stores, broker topology, producer pool, engines.
    let hot = Arc::new(HotStore::new());
    let db = Arc::new(Database::new());
    let broker = Broker::new();
    mq::declare_topology(&broker).context("declaring broker topology")?;
    let pool = Arc::new(ProducerPool::new(broker.clone(), config.mq.channel_pool_size));
    let stock = Arc::new(StockEngine::new(hot.clone(), db.clone(), config.stock.return_cap));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if roles.contains("order-consumer") {
        let consumer = broker
            .consume(shared::QUEUE_ORDER_CREATE, config.mq.consumer_prefetch)
            .context("binding order create consumer")?;
        let worker = OrderCreateConsumer::new(hot.clone(), db.clone(), &config.consumer);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(consumer, shutdown).await }));
    }

    if roles.contains("cancel-consumer") {
        let consumer = broker
            .consume(shared::QUEUE_ORDER_CANCELED, config.mq.consumer_prefetch)
            .context("binding cancel consumer")?;
        let worker = CancelConsumer::new(hot.clone(), stock.clone());
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(consumer, shutdown).await }));
    }

    if roles.contains("reconciler") {
        let worker = Reconciler::new(hot.clone(), db.clone(), &config.reconciler);
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }

    if roles.contains("dlq-monitor") {
        let consumer = broker
            .consume(shared::QUEUE_ORDER_CREATE_DLQ, config.mq.consumer_prefetch)
            .context("binding dlq monitor")?;
        let worker = DlqMonitor::new(config.dlq.alarm_log.clone());
        let shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { worker.run(consumer, shutdown).await }));
    }

    if roles.contains("edge") || roles.contains("admission") {
        let admission = Arc::new(AdmissionService::new(hot.clone(), stock.clone(), pool.clone()));
        let orders = Arc::new(OrderService::new(db.clone(), pool.clone()));
        let jwt = JwtKeys::new(&config.jwt.secret, config.jwt.expire_hours);
        let limiter = Arc::new(IpRateLimiter::new(
            config.rate_limit.per_sec,
            config.rate_limit.burst,
            Duration::from_secs(config.rate_limit.idle_secs),
        ));

        {
            let limiter = limiter.clone();
            let mut shutdown = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => { limiter.sweep_stale(); }
                    }
                }
            }));
        }

        let state = AppState { admission, orders, db: db.clone(), jwt, limiter };
        let app = api::create_router(state);
        let addr = format!("{}:{}", config.server.host, config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding edge listener on {addr}"))?;
        info!(%addr, "edge listening");

        let mut shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let serve = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            });
            if let Err(e) = serve.await {
                error!(error = %e, "edge server failed");
            }
        }));
    }

    info!(roles = %args.roles, "seckill service started");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("shutdown signal received, draining");

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    pool.close();
    info!("shutdown complete");
    Ok(())
}
