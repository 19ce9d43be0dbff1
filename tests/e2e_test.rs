//! End-to-end tests for complete webhook delivery workflows.
//!
//! Exercises the whole system against PostgreSQL: submission through the
//! HTTP API, claiming, signed delivery to a failure-injecting receiver,
//! exponential backoff, dead-lettering, and exclusive claiming across
//! dispatchers. Time is driven by a `TestClock`, so backoff waits cost
//! nothing.
//!
//! Every test needs `DATABASE_URL`.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
};
use chrono::{SubsecRound, Utc};
use herald_api::{create_router, AppState};
use herald_core::{storage::Storage, Clock, PayloadSigner, TaskId, TaskStatus, DEVELOPMENT_SECRET};
use herald_delivery::{ClientConfig, DeliveryConfig, DeliveryEngine, RetryPolicy};
use herald_testing::{
    MockServer, ReceiverConfig, ReceiverSimulator, TaskBuilder, TestClock, TestDatabase,
};
use serde_json::{json, Value};
use tower::ServiceExt;

struct TestEnv {
    db: TestDatabase,
    clock: TestClock,
    storage: Arc<Storage>,
}

impl TestEnv {
    async fn new() -> Result<Self> {
        let db = TestDatabase::new().await?;
        let clock = TestClock::starting_at(Utc::now().trunc_subsecs(0));
        let storage = Arc::new(db.storage(Arc::new(clock.clone())));
        Ok(Self { db, clock, storage })
    }

    fn clock(&self) -> Arc<dyn Clock> {
        Arc::new(self.clock.clone())
    }

    fn engine(&self, max_attempts: u32) -> Result<DeliveryEngine> {
        let config = DeliveryConfig {
            retry_policy: RetryPolicy::new(max_attempts),
            client_config: ClientConfig {
                timeout: Duration::from_secs(2),
                ..ClientConfig::default()
            },
            ..DeliveryConfig::default()
        };
        Ok(DeliveryEngine::with_postgres(
            self.storage.clone(),
            PayloadSigner::new(DEVELOPMENT_SECRET)?,
            config,
            self.clock(),
        )?)
    }

    async fn submit(&self, target_url: &str, payload: Value) -> Result<TaskId> {
        let app = create_router(
            AppState::new(self.storage.clone(), self.clock()),
            Duration::from_secs(5),
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri("/events")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"target_url": target_url, "payload": payload}).to_string()))?;

        let response = app.oneshot(request).await?;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await?;
        let body: Value = serde_json::from_slice(&bytes)?;
        Ok(TaskId(body["id"].as_str().unwrap_or_default().parse()?))
    }

    async fn task(&self, id: TaskId) -> Result<herald_core::DeliveryTask> {
        Ok(self.storage.tasks.find_by_id(id).await?.expect("task exists"))
    }
}

async fn start_receiver(fail_first_n: u32) -> Result<(Arc<ReceiverSimulator>, String)> {
    let config = ReceiverConfig { fail_first_n, ..ReceiverConfig::default() };
    let simulator = Arc::new(ReceiverSimulator::new(config)?);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let url = format!("http://{}/webhook", listener.local_addr()?);

    tokio::spawn(simulator.clone().serve(listener, std::future::pending()));

    Ok((simulator, url))
}

/// The golden path: submission, two simulated failures with 2s and 4s
/// backoff, then a verified delivery.
#[tokio::test]
async fn submitted_event_is_delivered_after_retries() -> Result<()> {
    let env = TestEnv::new().await?;
    let (receiver, url) = start_receiver(2).await?;
    let engine = env.engine(10)?;

    let id = env.submit(&url, json!({"amount": 4200, "currency": "usd"})).await?;

    assert_eq!(engine.fetch_and_process_batch().await?, 1);
    let task = env.task(id).await?;
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.attempted_count, 1);
    assert_eq!(task.next_attempt_at, env.clock.now_utc() + chrono::Duration::seconds(2));

    // Not due yet.
    assert_eq!(engine.fetch_and_process_batch().await?, 0);

    env.clock.advance(Duration::from_secs(2));
    assert_eq!(engine.fetch_and_process_batch().await?, 1);
    assert_eq!(env.task(id).await?.attempted_count, 2);

    env.clock.advance(Duration::from_secs(4));
    assert_eq!(engine.fetch_and_process_batch().await?, 1);

    let task = env.task(id).await?;
    assert_eq!(task.status, TaskStatus::Succeeded);
    assert_eq!(task.attempted_count, 3);
    assert_eq!(receiver.attempts_for(&id.to_string()), 3);

    // Terminal tasks are never claimed again.
    env.clock.advance(Duration::from_secs(3600));
    assert_eq!(engine.fetch_and_process_batch().await?, 0);

    env.db.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn always_failing_receiver_dead_letters_after_max_attempts() -> Result<()> {
    let env = TestEnv::new().await?;
    let server = MockServer::start().await;
    server.mock_always_fail(500).await;
    let engine = env.engine(10)?;

    let id = env.submit(&server.endpoint_url("/webhook"), json!({"n": 1})).await?;

    for attempt in 1..=10_u32 {
        assert_eq!(engine.fetch_and_process_batch().await?, 1, "attempt {attempt}");
        let task = env.task(id).await?;
        assert_eq!(task.attempted_count, i32::try_from(attempt)?);

        if attempt < 10 {
            assert_eq!(task.status, TaskStatus::Pending);
            env.clock.advance(Duration::from_secs(1 << attempt));
        } else {
            assert_eq!(task.status, TaskStatus::Dead);
        }
    }

    env.clock.advance(Duration::from_secs(1 << 20));
    assert_eq!(engine.fetch_and_process_batch().await?, 0);
    server.assert_request_count(10).await;

    let stats = engine.stats().await;
    assert_eq!(stats.retries_scheduled, 9);
    assert_eq!(stats.dead_lettered, 1);

    env.db.cleanup().await?;
    Ok(())
}

#[tokio::test]
async fn concurrent_dispatchers_deliver_each_task_once() -> Result<()> {
    let env = TestEnv::new().await?;
    let (receiver, url) = start_receiver(0).await?;
    let first = env.engine(10)?;
    let second = env.engine(10)?;

    let mut ids = Vec::new();
    for _ in 0..12 {
        let task = TaskBuilder::new()
            .target_url(url.clone())
            .insert(&env.storage, env.clock.now_utc())
            .await?;
        ids.push(task.id);
    }

    let (a, b) = tokio::join!(first.fetch_and_process_batch(), second.fetch_and_process_batch());
    let (a, b) = (a?, b?);
    let (c, d) = tokio::join!(first.fetch_and_process_batch(), second.fetch_and_process_batch());
    assert_eq!(a + b + c? + d?, 12);

    for id in ids {
        assert_eq!(env.task(id).await?.status, TaskStatus::Succeeded);
        assert_eq!(receiver.attempts_for(&id.to_string()), 1);
    }

    env.db.cleanup().await?;
    Ok(())
}

/// A worker that claims a task and dies leaves it leased; once the lease
/// runs out another worker picks it up.
#[tokio::test]
async fn task_of_crashed_worker_is_recovered_after_lease() -> Result<()> {
    let env = TestEnv::new().await?;
    let (receiver, url) = start_receiver(0).await?;
    let engine = env.engine(10)?;
    let lease = engine.config().claim_lease;

    let task =
        TaskBuilder::new().target_url(url).insert(&env.storage, env.clock.now_utc()).await?;

    // Claimed by a worker that never reports back.
    let claimed = env.storage.tasks.claim_batch(10, lease).await?;
    assert_eq!(claimed.len(), 1);

    assert_eq!(engine.fetch_and_process_batch().await?, 0);

    env.clock.advance(lease);
    assert_eq!(engine.fetch_and_process_batch().await?, 1);

    let stored = env.task(task.id).await?;
    assert_eq!(stored.status, TaskStatus::Succeeded);
    assert_eq!(stored.attempted_count, 1);
    assert_eq!(receiver.attempts_for(&task.id.to_string()), 1);

    env.db.cleanup().await?;
    Ok(())
}
