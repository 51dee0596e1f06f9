// Copyright 2025 Sprint Lens Contributors
// SPDX-License-Identifier: Apache-2.0

//! HTTP delivery against a mock collector.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};
use sprintlens::{Client, ClientConfig, SpanType, TokenUsage, TraceRecord};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct Collector {
    bodies: Mutex<Vec<Value>>,
    auth: Mutex<Vec<Option<String>>>,
    requests: AtomicUsize,
    fail_remaining: AtomicUsize,
}

impl Collector {
    fn bodies(&self) -> Vec<Value> {
        self.bodies.lock().unwrap().clone()
    }

    fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }
}

async fn receive_traces(
    State(state): State<Arc<Collector>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> StatusCode {
    state.requests.fetch_add(1, Ordering::SeqCst);
    let failing = state
        .fail_remaining
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if failing {
        return StatusCode::INTERNAL_SERVER_ERROR;
    }

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.auth.lock().unwrap().push(auth);
    state.bodies.lock().unwrap().push(body);
    StatusCode::ACCEPTED
}

async fn spawn_collector() -> (SocketAddr, Arc<Collector>) {
    let state = Arc::new(Collector::default());
    let app = Router::new()
        .route("/api/v1/traces", post(receive_traces))
        .with_state(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (addr, state)
}

fn config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(format!("http://{}", addr))
        .with_api_key("sk-test")
        .with_project("collector-tests")
        .with_timeout(Duration::from_secs(2))
        .with_retries(0, Duration::from_millis(1))
        .with_flush_interval(Duration::from_secs(3600))
}

#[tokio::test]
async fn test_single_trace_wire_shape() {
    let (addr, collector) = spawn_collector().await;
    let client = Client::new(config(addr)).unwrap();

    let trace = client.trace("wire");
    let span = trace.span("llm-call").span_type(SpanType::Llm).build();
    span.in_scope(|| span.set_output("ok"));
    trace.flush().await;
    client.flush().await;

    let bodies = collector.bodies();
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert!(body.is_object());
    assert_eq!(body["name"], "wire");
    assert_eq!(body["projectName"], "collector-tests");
    assert_eq!(body["status"], "completed");
    assert!(body["startTime"].is_string());
    assert!(body["durationMs"].is_number());
    assert_eq!(body["spans"][0]["traceId"], json!(trace.id()));
    assert_eq!(body["spans"][0]["spanType"], "llm");
    assert_eq!(body["spans"][0]["output"], "ok");
    assert!(body["spans"][0]["parentId"].is_null());

    let auth = collector.auth.lock().unwrap().clone();
    assert_eq!(auth, vec![Some("Bearer sk-test".to_string())]);
}

#[tokio::test]
async fn test_batch_is_posted_as_array() {
    let (addr, collector) = spawn_collector().await;
    let client = Client::new(config(addr).with_batch_size(5)).unwrap();

    for i in 0..3 {
        client.log_trace(&client.trace(format!("t{}", i)));
    }
    client.flush().await;

    let bodies = collector.bodies();
    assert_eq!(bodies.len(), 1);
    assert_eq!(bodies[0].as_array().map(Vec::len), Some(3));
}

#[tokio::test]
async fn test_server_error_keeps_trace_buffered() {
    let (addr, collector) = spawn_collector().await;
    let client = Client::new(config(addr)).unwrap();
    collector.fail_next(1);

    let trace = client.trace("resilient");
    assert!(client.log_trace(&trace));
    client.flush().await;

    assert_eq!(collector.requests.load(Ordering::SeqCst), 1);
    assert!(collector.bodies().is_empty());
    assert_eq!(client.buffered_len(), 1);

    client.flush().await;
    assert_eq!(client.buffered_len(), 0);
    assert_eq!(collector.bodies()[0]["id"], json!(trace.id()));
}

#[tokio::test]
async fn test_in_request_retries_with_backoff() {
    let (addr, collector) = spawn_collector().await;
    let client = Client::new(config(addr).with_retries(2, Duration::from_millis(5))).unwrap();
    collector.fail_next(2);

    client.log_trace(&client.trace("retried"));
    client.flush().await;

    assert_eq!(collector.requests.load(Ordering::SeqCst), 3);
    assert_eq!(collector.bodies().len(), 1);
    assert_eq!(client.buffered_len(), 0);
}

#[tokio::test]
async fn test_unreachable_collector_does_not_fail_caller() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let client = Client::new(config(addr).with_timeout(Duration::from_millis(500))).unwrap();
    let trace = client.trace("offline");
    let value = trace.in_scope_async(async { 42 }).await;
    assert_eq!(value, 42);
    client.flush().await;

    assert_eq!(client.buffered_len(), 1);
}

#[tokio::test]
async fn test_round_trip_preserves_every_field() {
    let (addr, collector) = spawn_collector().await;
    let client = Client::new(config(addr)).unwrap();

    let trace = client
        .trace_builder("round-trip")
        .user_id("user-7")
        .session_id("session-3")
        .input(&json!({"question": "why?"}))
        .build();
    trace.add_tag("env", "test");
    trace.set_metadata("attempt", &2);

    let root = trace.span("plan").span_type(SpanType::Processing).build();
    root.in_scope(|| {
        root.set_input(&json!({"steps": [1, 2, 3]}));
        root.add_metric("confidence", 0.75, None);
        let llm = trace
            .span("generate")
            .span_type(SpanType::Llm)
            .model("gpt-4o")
            .build();
        llm.in_scope(|| {
            llm.set_token_usage(TokenUsage {
                prompt_tokens: Some(120),
                completion_tokens: Some(30),
                total_tokens: None,
                ..Default::default()
            });
            llm.set_cost(0.0042);
            llm.add_tag("temperature", 0.2);
            llm.set_output("because");
        });
    });
    trace.set_output("because");
    trace.finish();
    trace.add_score("helpfulness", 0.9);
    let expected = trace.to_record();

    trace.flush().await;
    client.flush().await;

    let bodies = collector.bodies();
    let received: TraceRecord = serde_json::from_value(bodies[0].clone()).unwrap();
    assert_eq!(received, expected);
    assert!(received.validate().is_empty());
    assert_eq!(received.spans[1].parent_id.as_deref(), Some(received.spans[0].id.as_str()));
    assert_eq!(received.metrics["total_tokens"].value.as_f64(), Some(150.0));
}
