//! HTTP client for webhook delivery with a bounded per-attempt timeout.
//!
//! Every status code is a normal response here; only transport failures
//! (timeout, refused connection, broken stream) come back as errors. The
//! engine decides what counts as success.

use std::time::{Duration, Instant};

use bytes::Bytes;
use herald_core::{TaskId, SIGNATURE_HEADER};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// Header carrying the task id.
pub const EVENT_ID_HEADER: &str = "X-Event-Id";

/// Header carrying the 1-based attempt number.
pub const DELIVERY_ATTEMPT_HEADER: &str = "X-Delivery-Attempt";

const MAX_RECORDED_BODY_SIZE: usize = 1024;

/// Configuration for the webhook delivery client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Timeout for one HTTP attempt, connection included.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
    /// Maximum number of redirects to follow.
    pub max_redirects: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(crate::DEFAULT_TIMEOUT_MS),
            user_agent: "Herald-Webhook-Delivery/1.0".to_string(),
            max_redirects: 3,
        }
    }
}

/// HTTP client shared by every dispatch loop in the process.
///
/// Wraps a pooled `reqwest::Client`; cloning is cheap.
#[derive(Debug, Clone)]
pub struct DeliveryClient {
    client: reqwest::Client,
    config: ClientConfig,
}

/// One signed delivery attempt.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    /// Task being delivered.
    pub task_id: TaskId,
    /// Destination URL.
    pub url: String,
    /// Serialized body. Sent exactly as signed.
    pub body: Bytes,
    /// Hex HMAC-SHA256 of `body`.
    pub signature: String,
    /// 1-based attempt number.
    pub attempt_number: u32,
}

/// Response to a delivery attempt, whatever its status.
#[derive(Debug, Clone)]
pub struct DeliveryResponse {
    /// HTTP status code.
    pub status_code: u16,
    /// Response body, truncated for attempt records.
    pub body: String,
    /// Whether the status is 2xx.
    pub is_success: bool,
}

impl DeliveryClient {
    /// Creates a new delivery client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be configured with the provided settings.
    pub fn new(config: ClientConfig) -> Result<Self> {
        if config.timeout.is_zero() {
            return Err(DeliveryError::configuration("HTTP timeout must be greater than zero"));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects as usize))
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    /// Creates a new delivery client with default configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn with_defaults() -> Result<Self> {
        Self::new(ClientConfig::default())
    }

    /// Returns the client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// POSTs a signed payload to its destination.
    ///
    /// # Errors
    ///
    /// Returns only transport failures:
    /// - `Timeout` when the attempt exceeds the configured timeout
    /// - `NetworkError` for connection and protocol failures
    ///
    /// Non-2xx responses are returned as `Ok` with `is_success == false`.
    pub async fn deliver(&self, request: DeliveryRequest) -> Result<DeliveryResponse> {
        let start_time = Instant::now();

        let span = info_span!(
            "webhook_delivery",
            task_id = %request.task_id,
            url = %request.url,
            attempt = request.attempt_number
        );

        async move {
            tracing::debug!("starting webhook delivery");

            let result = self
                .client
                .post(&request.url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(SIGNATURE_HEADER, &request.signature)
                .header(EVENT_ID_HEADER, request.task_id.to_string())
                .header(DELIVERY_ATTEMPT_HEADER, request.attempt_number.to_string())
                .body(request.body)
                .send()
                .await;

            let response = match result {
                Ok(response) => response,
                Err(e) => {
                    let duration = start_time.elapsed();
                    tracing::warn!(duration_ms = duration.as_millis(), error = %e, "request failed");
                    return Err(classify_transport_error(&e, self.config.timeout));
                },
            };

            let delivery_response = read_response(response).await;
            let duration_ms = start_time.elapsed().as_millis();

            if delivery_response.is_success {
                tracing::debug!(
                    status = delivery_response.status_code,
                    duration_ms,
                    "received success response"
                );
            } else {
                tracing::debug!(
                    status = delivery_response.status_code,
                    duration_ms,
                    "received failure response"
                );
            }

            Ok(delivery_response)
        }
        .instrument(span)
        .await
    }
}

fn classify_transport_error(error: &reqwest::Error, timeout: Duration) -> DeliveryError {
    if error.is_timeout() {
        return DeliveryError::timeout(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
    }
    if error.is_connect() {
        return DeliveryError::network(format!("connection failed: {error}"));
    }
    DeliveryError::network(error.to_string())
}

async fn read_response(response: Response) -> DeliveryResponse {
    let status_code = response.status().as_u16();
    let is_success = response.status().is_success();

    let body = match response.bytes().await {
        Ok(bytes) => truncate_body(&bytes),
        Err(e) => {
            tracing::warn!(error = %e, "failed to read response body");
            format!("[failed to read response body: {e}]")
        },
    };

    DeliveryResponse { status_code, body, is_success }
}

fn truncate_body(bytes: &[u8]) -> String {
    if bytes.len() <= MAX_RECORDED_BODY_SIZE {
        return String::from_utf8_lossy(bytes).into_owned();
    }

    let suffix = "... (truncated)";
    let keep = MAX_RECORDED_BODY_SIZE - suffix.len();
    format!("{}{suffix}", String::from_utf8_lossy(&bytes[..keep]))
}
