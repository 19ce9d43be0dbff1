//! HTTP contract tests for the receiver simulator.

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use herald_core::{PayloadSigner, DEVELOPMENT_SECRET, SIGNATURE_HEADER};
use herald_testing::{ReceiverConfig, ReceiverSimulator};
use serde_json::{json, Value};
use tower::ServiceExt;

fn simulator(fail_first_n: u32) -> Arc<ReceiverSimulator> {
    Arc::new(
        ReceiverSimulator::new(ReceiverConfig { fail_first_n, ..ReceiverConfig::default() })
            .unwrap(),
    )
}

fn signed_request(body: &str, signature: Option<&str>) -> Request<Body> {
    let mut builder =
        Request::builder().method("POST").uri("/webhook").header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header(SIGNATURE_HEADER, signature);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(sim: &Arc<ReceiverSimulator>, request: Request<Body>) -> (StatusCode, Value) {
    let response = sim.clone().router().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn rejects_first_n_attempts_then_accepts_signed_body() {
    let sim = simulator(2);
    let signer = PayloadSigner::new(DEVELOPMENT_SECRET).unwrap();
    let body = r#"{"amount":10,"event_id":"evt-1"}"#;
    let signature = signer.sign_bytes(body.as_bytes());

    for _ in 0..2 {
        let (status, json) = send(&sim, signed_request(body, Some(&signature))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json, json!({ "error": "Simulated failure" }));
    }

    let (status, json) = send(&sim, signed_request(body, Some(&signature))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "received": true }));
    assert_eq!(sim.attempts_for("evt-1"), 3);
}

#[tokio::test]
async fn failures_are_counted_before_signature_checks() {
    let sim = simulator(1);

    let (status, _) = send(&sim, signed_request(r#"{"event_id":"evt-2"}"#, None)).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, json) = send(&sim, signed_request(r#"{"event_id":"evt-2"}"#, None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json, json!({ "error": "Missing signature" }));
}

#[tokio::test]
async fn invalid_signature_is_unauthorized() {
    let sim = simulator(0);
    let body = r#"{"event_id":"evt-3"}"#;
    let forged = PayloadSigner::new("not-the-secret").unwrap().sign_bytes(body.as_bytes());

    let (status, json) = send(&sim, signed_request(body, Some(&forged))).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json, json!({ "error": "Invalid signature" }));
}

#[tokio::test]
async fn verifies_raw_bytes_not_reserialized_json() {
    let sim = simulator(0);
    let signer = PayloadSigner::new(DEVELOPMENT_SECRET).unwrap();
    // Whitespace and key order would not survive a parse and re-serialize.
    let body = r#"{ "event_id" : "evt-4",  "b": 2, "a": 1 }"#;
    let signature = signer.sign_bytes(body.as_bytes());

    let (status, _) = send(&sim, signed_request(body, Some(&signature))).await;

    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn missing_event_id_counts_as_unknown() {
    let sim = simulator(5);

    send(&sim, signed_request(r#"{"amount":1}"#, None)).await;
    send(&sim, signed_request(r#"{"amount":2}"#, None)).await;

    assert_eq!(sim.attempts_for("unknown"), 2);
}

#[tokio::test]
async fn health_and_unknown_routes() {
    let sim = simulator(0);

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, json) = send(&sim, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, json!({ "status": "ok" }));

    let request = Request::builder().uri("/nope").body(Body::empty()).unwrap();
    let (status, json) = send(&sim, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(json, json!({ "error": "Route not found" }));
}
