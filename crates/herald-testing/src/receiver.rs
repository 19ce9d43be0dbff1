//! Failure-injecting webhook receiver.
//!
//! Simulates an unreliable downstream service: it rejects the first
//! `fail_first_n` attempts of every event with a 500, optionally stalls a
//! fraction of requests long enough to trip the dispatcher's HTTP timeout,
//! and verifies the HMAC signature of everything it accepts.
//!
//! Attempt counters live only in memory. They reset when the process
//! restarts, and [`ReceiverSimulator::reset`] clears them explicitly.

use std::{
    collections::HashMap,
    net::SocketAddr,
    str::FromStr,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_core::{models::EVENT_ID_FIELD, PayloadSigner, DEVELOPMENT_SECRET, SIGNATURE_HEADER};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

const CONFIG_FILE: &str = "config.toml";
const UNKNOWN_EVENT: &str = "unknown";

/// Receiver simulator settings.
///
/// Loaded from defaults, then `config.toml`, then environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverConfig {
    /// Bind address.
    ///
    /// Environment variable: `MOCK_RECEIVER_HOST`
    #[serde(default = "default_host", alias = "MOCK_RECEIVER_HOST")]
    pub mock_receiver_host: String,
    /// Bind port.
    ///
    /// Environment variable: `MOCK_RECEIVER_PORT`
    #[serde(default = "default_port", alias = "MOCK_RECEIVER_PORT")]
    pub mock_receiver_port: u16,
    /// Attempts per event answered with a simulated 500.
    ///
    /// Environment variable: `FAIL_FIRST_N`
    #[serde(default = "default_fail_first_n", alias = "FAIL_FIRST_N")]
    pub fail_first_n: u32,
    /// Probability (0.0 to 1.0) of stalling a request.
    ///
    /// Environment variable: `TIMEOUT_RATE`
    #[serde(default, alias = "TIMEOUT_RATE")]
    pub timeout_rate: f64,
    /// How long a stalled request sleeps, in milliseconds.
    ///
    /// Environment variable: `TIMEOUT_DELAY_MS`
    #[serde(default = "default_timeout_delay_ms", alias = "TIMEOUT_DELAY_MS")]
    pub timeout_delay_ms: u64,
    /// Shared signing secret.
    ///
    /// Environment variable: `HMAC_SECRET`
    #[serde(default = "default_hmac_secret", alias = "HMAC_SECRET")]
    pub hmac_secret: String,
}

impl ReceiverConfig {
    /// Loads and validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or a value is invalid.
    pub fn load() -> Result<Self> {
        let config: Self = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""))
            .extract()
            .context("Failed to load receiver configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Socket address to bind.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        SocketAddr::from_str(&format!("{}:{}", self.mock_receiver_host, self.mock_receiver_port))
            .context("Invalid receiver address")
    }

    /// Stall duration for simulated timeouts.
    pub fn timeout_delay(&self) -> Duration {
        Duration::from_millis(self.timeout_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.timeout_rate) {
            anyhow::bail!("timeout_rate must be between 0.0 and 1.0");
        }

        if self.hmac_secret.is_empty() {
            anyhow::bail!("hmac_secret must not be empty");
        }

        Ok(())
    }
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            mock_receiver_host: default_host(),
            mock_receiver_port: default_port(),
            fail_first_n: default_fail_first_n(),
            timeout_rate: 0.0,
            timeout_delay_ms: default_timeout_delay_ms(),
            hmac_secret: default_hmac_secret(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3001
}

fn default_fail_first_n() -> u32 {
    5
}

fn default_timeout_delay_ms() -> u64 {
    15_000
}

fn default_hmac_secret() -> String {
    DEVELOPMENT_SECRET.to_string()
}

/// What the simulator decided for one incoming attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttemptDecision {
    /// 1-based attempt count for the event, including this one.
    pub count: u32,
    /// Answer with a simulated 500.
    pub reject: bool,
    /// Stall this long before answering.
    pub delay: Option<Duration>,
}

/// In-memory receiver with per-event attempt counters.
#[derive(Debug)]
pub struct ReceiverSimulator {
    config: ReceiverConfig,
    signer: PayloadSigner,
    attempts: Mutex<HashMap<String, u32>>,
}

impl ReceiverSimulator {
    /// Creates a simulator from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the signing secret is empty.
    pub fn new(config: ReceiverConfig) -> Result<Self> {
        let signer = PayloadSigner::new(&config.hmac_secret)
            .map_err(|e| anyhow::anyhow!("invalid receiver secret: {e}"))?;
        Ok(Self { config, signer, attempts: Mutex::new(HashMap::new()) })
    }

    /// Simulator settings.
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Counts one attempt for `event_id` and decides how to answer it.
    pub fn record_attempt(&self, event_id: &str) -> AttemptDecision {
        let count = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let count = attempts.entry(event_id.to_string()).or_insert(0);
            *count = count.saturating_add(1);
            *count
        };

        let stall = self.config.timeout_rate > 0.0
            && rand::thread_rng().gen_bool(self.config.timeout_rate.min(1.0));

        AttemptDecision {
            count,
            reject: count <= self.config.fail_first_n,
            delay: stall.then(|| self.config.timeout_delay()),
        }
    }

    /// Attempts seen so far for `event_id`.
    pub fn attempts_for(&self, event_id: &str) -> u32 {
        self.attempts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(event_id)
            .copied()
            .unwrap_or(0)
    }

    /// Forgets every counter.
    pub fn reset(&self) {
        self.attempts.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clear();
    }

    /// Checks a signature over the raw body.
    pub fn verify(&self, raw_body: &[u8], signature: &str) -> bool {
        self.signer.verify(raw_body, signature)
    }

    /// HTTP routes: `POST /webhook` and `GET /health`.
    pub fn router(self: Arc<Self>) -> Router {
        Router::new()
            .route("/webhook", post(handle_webhook))
            .route("/health", get(health))
            .fallback(not_found)
            .with_state(self)
    }

    /// Serves the simulator until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener fails.
    pub async fn serve(
        self: Arc<Self>,
        listener: tokio::net::TcpListener,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        axum::serve(listener, self.router()).with_graceful_shutdown(shutdown).await
    }
}

fn event_id_of(body: &[u8]) -> String {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|value| value.get(EVENT_ID_FIELD).and_then(Value::as_str).map(str::to_owned))
        .unwrap_or_else(|| UNKNOWN_EVENT.to_string())
}

async fn handle_webhook(
    State(simulator): State<Arc<ReceiverSimulator>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event_id = event_id_of(&body);
    let decision = simulator.record_attempt(&event_id);

    if let Some(delay) = decision.delay {
        warn!(
            event_id = %event_id,
            attempt = decision.count,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "simulating timeout"
        );
        tokio::time::sleep(delay).await;
    }

    if decision.reject {
        warn!(
            event_id = %event_id,
            attempt = decision.count,
            fail_first_n = simulator.config.fail_first_n,
            "rejecting delivery with simulated failure"
        );
        return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "Simulated failure" })))
            .into_response();
    }

    let signature = headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok());
    let Some(signature) = signature.filter(|_| !body.is_empty()) else {
        error!(event_id = %event_id, "missing signature or body");
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "Missing signature" })))
            .into_response();
    };

    if !simulator.verify(&body, signature) {
        error!(event_id = %event_id, "signature mismatch");
        return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid signature" })))
            .into_response();
    }

    info!(event_id = %event_id, attempt = decision.count, "webhook accepted, signature verified");
    (StatusCode::OK, Json(json!({ "received": true }))).into_response()
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> (StatusCode, Json<Value>) {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Route not found" })))
}
