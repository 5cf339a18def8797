mod common;

use common::*;
use serde_json::{json, Value};

#[tokio::test]
async fn requests_without_a_token_are_rejected() {
    let app = TestApp::spawn().await;
    let (base, edge_shutdown) = spawn_edge(&app, 0, 0).await;
    let client = reqwest::Client::new();

    let resp = client
        .post(format!("{base}/api/v1/seckill/execute"))
        .json(&json!({"product_id": 1003, "quantity": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 10004);

    let resp = client
        .post(format!("{base}/api/v1/seckill/execute"))
        .header("Authorization", "Bearer not-a-token")
        .json(&json!({"product_id": 1003, "quantity": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 10001);

    let _ = edge_shutdown.send(true);
    app.stop().await;
}

#[tokio::test]
async fn seckill_round_trip_over_http() {
    let app = TestApp::spawn().await;
    app.seed_product(1003, 99, 2).await;
    let (base, edge_shutdown) = spawn_edge(&app, 0, 0).await;
    let client = reqwest::Client::new();
    let token = test_token(7);

    let resp = client
        .post(format!("{base}/api/v1/seckill/execute"))
        .header("Authorization", format!("Bearer {token}"))
        .json(&json!({"product_id": 1003, "quantity": 1}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["code"], 0);
    // the order id is assigned later by the consumer
    assert!(body.get("order_id").is_none());

    // second attempt from the same user is refused
    let resp = client
        .post(format!("{base}/api/v1/seckill/execute"))
        .header("Authorization", format!("Bearer {token}"))
        .json(&json!({"product_id": 1003, "quantity": 1}))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);

    // the persisted order shows up in "my orders"
    assert!(wait_for_orders(&app.db, 1003, 1).await);
    let resp = client
        .get(format!("{base}/api/v1/orders/my"))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["total"], 1);
    let order_id = body["orders"][0]["id"].as_i64().unwrap();
    assert_eq!(body["orders"][0]["status"], 0);

    // cancel it, then a pay attempt reports the benign status conflict
    let resp = client
        .post(format!("{base}/api/v1/orders/{order_id}/cancel"))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 0);

    let resp = client
        .post(format!("{base}/api/v1/orders/{order_id}/pay"))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], 40001);

    let _ = edge_shutdown.send(true);
    app.stop().await;
}

#[tokio::test]
async fn product_create_and_fetch_over_http() {
    let app = TestApp::spawn().await;
    let (base, edge_shutdown) = spawn_edge(&app, 0, 0).await;
    let client = reqwest::Client::new();
    let token = test_token(1);

    let resp = client
        .post(format!("{base}/api/v1/products"))
        .header("Authorization", format!("Bearer {token}"))
        .json(&json!({"name": "widget", "price": 19.9, "stock": 42}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let product_id = body["product_id"].as_i64().unwrap();

    let resp = client
        .get(format!("{base}/api/v1/products/{product_id}"))
        .header("Authorization", format!("Bearer {token}"))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["product"]["name"], "widget");
    assert_eq!(body["product"]["stock"], 42);

    // invalid payloads are rejected synchronously
    let resp = client
        .post(format!("{base}/api/v1/products"))
        .header("Authorization", format!("Bearer {token}"))
        .json(&json!({"name": "", "price": -1.0, "stock": -5}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);

    let _ = edge_shutdown.send(true);
    app.stop().await;
}

#[tokio::test]
async fn seckill_route_is_rate_limited_per_ip() {
    let app = TestApp::spawn().await;
    app.seed_product(1003, 99, 100).await;
    let (base, edge_shutdown) = spawn_edge(&app, 1, 1).await;
    let client = reqwest::Client::new();

    let mut limited = 0;
    for user_id in 1..=3_i64 {
        let token = test_token(user_id);
        let resp = client
            .post(format!("{base}/api/v1/seckill/execute"))
            .header("Authorization", format!("Bearer {token}"))
            .json(&json!({"product_id": 1003, "quantity": 1}))
            .send()
            .await
            .unwrap();
        if resp.status() == 429 {
            limited += 1;
        }
    }
    assert!(limited >= 1, "expected at least one rate-limited response");

    let _ = edge_shutdown.send(true);
    app.stop().await;
}

#[tokio::test]
async fn health_endpoint_needs_no_auth() {
    let app = TestApp::spawn().await;
    let (base, edge_shutdown) = spawn_edge(&app, 0, 0).await;

    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");

    let _ = edge_shutdown.send(true);
    app.stop().await;
}
