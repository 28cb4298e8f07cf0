//! Integration tests for the task WebSocket + REST surface.
//!
//! Each test spins up an Axum server on a random port, connects via
//! tokio-tungstenite or reqwest, and exercises the real wire contract.

mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use common::{Pipeline, TEST_TIMEOUT, pipeline, wait_for_terminal};
use fit_pipeline::tasks::routes::task_routes;

/// Start an Axum server on a random port, return (port, pipeline).
async fn start_server() -> (u16, Pipeline) {
    let p = pipeline().await;
    let app = task_routes(p.service.clone(), p.engine.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, p)
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

async fn submit(port: u16, body: Value) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("http://127.0.0.1:{port}/api/tasks"))
        .json(&body)
        .send()
        .await
        .unwrap()
}

fn status_rank(status: &str) -> u8 {
    match status {
        "pending" => 0,
        "processing" => 1,
        "completed" | "failed" => 2,
        other => panic!("unexpected status {other}"),
    }
}

// ── WebSocket Tests ──────────────────────────────────────────────────

#[tokio::test]
async fn ws_connect_receives_empty_sync() {
    timeout(TEST_TIMEOUT, async {
        let (port, _p) = start_server().await;

        let (mut ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks/alice"))
            .await
            .expect("WS connect failed");

        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);
        assert_eq!(json["type"], "tasks_sync");
        assert!(json["tasks"].as_array().unwrap().is_empty());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_sync_includes_existing_tasks() {
    timeout(TEST_TIMEOUT, async {
        let (port, p) = start_server().await;

        let resp = submit(
            port,
            json!({ "owner_id": "alice", "kind": "parse_workout", "input": { "text": "Squat 140x5x3" } }),
        )
        .await;
        let task_id: uuid::Uuid =
            serde_json::from_value(resp.json::<Value>().await.unwrap()["task_id"].clone()).unwrap();
        wait_for_terminal(&p.tasks, task_id).await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks/alice"))
            .await
            .unwrap();
        let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(json["type"], "tasks_sync");
        let tasks = json["tasks"].as_array().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0]["task_id"], task_id.to_string());
        assert_eq!(tasks[0]["status"], "completed");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_pushes_monotonic_updates_for_owner_only() {
    timeout(TEST_TIMEOUT, async {
        let (port, _p) = start_server().await;

        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks/alice"))
            .await
            .unwrap();
        let sync = parse_ws_json(&ws.next().await.unwrap().unwrap());
        assert_eq!(sync["type"], "tasks_sync");

        // Someone else's task first; it must never reach alice.
        submit(
            port,
            json!({ "owner_id": "bob", "kind": "parse_workout", "input": { "text": "Deadlift 180x3x1" } }),
        )
        .await;
        let resp = submit(
            port,
            json!({ "owner_id": "alice", "kind": "parse_workout", "input": { "text": "Bench 100 5 5 5" } }),
        )
        .await;
        assert_eq!(resp.status(), 202);
        let task_id = resp.json::<Value>().await.unwrap()["task_id"].clone();

        let mut last_rank = 0;
        loop {
            let json = parse_ws_json(&ws.next().await.unwrap().unwrap());
            assert_eq!(json["type"], "task_update");
            assert_eq!(json["owner_id"], "alice");
            assert_eq!(json["task_id"], task_id);

            let status = json["status"].as_str().unwrap();
            let rank = status_rank(status);
            assert!(rank >= last_rank, "status went backwards to {status}");
            last_rank = rank;
            if status == "completed" {
                assert_eq!(json["result"]["kind"], "parsed_workout");
                assert_eq!(json["result"]["exercises"][0]["name"], "Bench Press");
                break;
            }
            assert_ne!(status, "failed", "{json}");
        }
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn ws_ping_gets_pong() {
    timeout(TEST_TIMEOUT, async {
        let (port, _p) = start_server().await;
        let (mut ws, _) = connect_async(format!("ws://127.0.0.1:{port}/ws/tasks/alice"))
            .await
            .unwrap();
        let _sync = ws.next().await.unwrap().unwrap();

        ws.send(Message::Ping(vec![1, 2, 3].into())).await.unwrap();
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Pong(data) => {
                    assert_eq!(data.to_vec(), vec![1u8, 2, 3]);
                    break;
                }
                Message::Text(_) => continue,
                other => panic!("unexpected frame {other:?}"),
            }
        }
    })
    .await
    .expect("test timed out");
}

// ── REST Tests ───────────────────────────────────────────────────────

#[tokio::test]
async fn health_reports_ok() {
    timeout(TEST_TIMEOUT, async {
        let (port, _p) = start_server().await;
        let resp = reqwest::get(format!("http://127.0.0.1:{port}/health"))
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["service"], "fit-pipeline");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_task_is_404() {
    timeout(TEST_TIMEOUT, async {
        let (port, _p) = start_server().await;
        let resp = reqwest::get(format!(
            "http://127.0.0.1:{port}/api/tasks/{}",
            uuid::Uuid::new_v4()
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn unknown_kind_is_rejected() {
    timeout(TEST_TIMEOUT, async {
        let (port, _p) = start_server().await;
        let resp = submit(
            port,
            json!({ "owner_id": "alice", "kind": "juggle", "input": {} }),
        )
        .await;
        assert!(resp.status().is_client_error());
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn failed_task_can_be_retried() {
    timeout(TEST_TIMEOUT, async {
        let (port, p) = start_server().await;
        let resp = submit(
            port,
            json!({ "owner_id": "alice", "kind": "analyze_photo", "input": { "image_ref": "missing.png" } }),
        )
        .await;
        let task_id: uuid::Uuid =
            serde_json::from_value(resp.json::<Value>().await.unwrap()["task_id"].clone()).unwrap();
        let record = wait_for_terminal(&p.tasks, task_id).await;
        assert_eq!(record.status.to_string(), "failed");

        let resp = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{port}/api/tasks/{task_id}/retry"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let json: Value = resp.json().await.unwrap();
        assert_eq!(json["status"], "processing");
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn manual_trigger_starts_workflow() {
    timeout(TEST_TIMEOUT, async {
        let (port, _p) = start_server().await;
        let client = reqwest::Client::new();

        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workflows/weekly-report/trigger"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 202);
        let json: Value = resp.json().await.unwrap();
        assert!(json["event_id"].is_string());

        let resp = client
            .post(format!("http://127.0.0.1:{port}/api/workflows/nope/trigger"))
            .json(&json!({}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 404);
    })
    .await
    .expect("test timed out");
}
