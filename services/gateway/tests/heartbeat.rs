// Heartbeat behavior: ping cadence, pong echo, and the one-interval grace.

mod common;

use common::{base_config, spawn_gateway};
use gate_test_utils::TestClient;
use serde_json::json;
use std::time::{Duration, Instant};

#[tokio::test]
async fn client_echoing_pongs_stays_connected() {
    let mut config = base_config();
    config.heartbeat.interval_ms = 50;
    let gateway = spawn_gateway(config).await;

    let mut client = TestClient::connect(&gateway.url).await.unwrap();
    client.recv_frame().await.unwrap(); // welcome

    // Echo nine consecutive pings the way a healthy client would.
    let mut pings = 0;
    while pings < 9 {
        let frame = client.recv_frame().await.unwrap();
        if frame["type"] == "ping" {
            let timestamp = frame["timestamp"].as_i64().unwrap();
            client.send_pong(timestamp).await.unwrap();
            pings += 1;
        }
    }

    // Well past several grace windows, the connection still serves requests.
    let data = client.call(1, "ping", json!({})).await.unwrap();
    assert!(data["timestamp"].is_number());
}

#[tokio::test]
async fn silent_client_is_closed_with_heartbeat_timeout() {
    let mut config = base_config();
    config.heartbeat.interval_ms = 50;
    let gateway = spawn_gateway(config).await;

    let mut client = TestClient::connect(&gateway.url).await.unwrap();
    client.recv_frame().await.unwrap(); // welcome

    // Ignore every ping; the second tick closes the socket.
    let started = Instant::now();
    let close = client.recv_close().await.unwrap();
    assert_eq!(close.code, 4001);
    assert_eq!(close.reason, "heartbeat_timeout");
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "close took {:?}, expected about two intervals",
        started.elapsed()
    );
}

#[tokio::test]
async fn late_pong_after_the_tick_does_not_save_the_connection() {
    let mut config = base_config();
    config.heartbeat.interval_ms = 50;
    let gateway = spawn_gateway(config).await;

    let mut client = TestClient::connect(&gateway.url).await.unwrap();
    client.recv_frame().await.unwrap();

    // Answer the first ping only, then go quiet.
    loop {
        let frame = client.recv_frame().await.unwrap();
        if frame["type"] == "ping" {
            client
                .send_pong(frame["timestamp"].as_i64().unwrap())
                .await
                .unwrap();
            break;
        }
    }
    let close = client.recv_close().await.unwrap();
    assert_eq!(close.code, 4001);
    assert_eq!(close.reason, "heartbeat_timeout");
}
