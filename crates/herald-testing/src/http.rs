//! Wiremock-backed webhook receivers for delivery tests.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer as WiremockServer, ResponseTemplate,
};

/// Mock receiver listening on a random local port.
pub struct MockServer {
    server: WiremockServer,
}

impl MockServer {
    /// Starts a new mock server.
    pub async fn start() -> Self {
        Self { server: WiremockServer::start().await }
    }

    /// Base URL of the server.
    pub fn url(&self) -> String {
        self.server.uri()
    }

    /// Absolute URL for `path` on this server.
    pub fn endpoint_url(&self, path: &str) -> String {
        format!("{}{}", self.server.uri(), path)
    }

    /// Mounts `endpoint` for POST requests.
    pub async fn mock_endpoint(&self, endpoint: MockEndpoint) {
        let mut mock = Mock::given(method("POST")).and(path(endpoint.path.clone()));
        for (key, value) in &endpoint.expected_headers {
            mock = mock.and(header(key.as_str(), value.as_str()));
        }

        let mock = mock.respond_with(endpoint.response.into_template());
        match endpoint.times {
            Some(n) => mock.up_to_n_times(n).with_priority(1).mount(&self.server).await,
            None => mock.with_priority(5).mount(&self.server).await,
        }
    }

    /// Responds `status` to the first `failures` POSTs on `path`, then 200.
    pub async fn mock_fail_then_succeed(&self, path: &str, failures: u64, status: u16) {
        if failures > 0 {
            let failing = MockEndpoint::failure(path, status).times(failures);
            self.mock_endpoint(failing).await;
        }
        self.mock_endpoint(MockEndpoint::success(path)).await;
    }

    /// Responds `status` to every POST on any path.
    pub async fn mock_always_fail(&self, status: u16) {
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status))
            .mount(&self.server)
            .await;
    }

    /// All requests received so far, in arrival order.
    pub async fn received_requests(&self) -> Vec<RecordedRequest> {
        self.server
            .received_requests()
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|request| RecordedRequest {
                method: request.method.clone(),
                path: request.url.path().to_string(),
                headers: request.headers.clone(),
                body: Bytes::from(request.body),
            })
            .collect()
    }

    /// Number of requests received so far.
    pub async fn request_count(&self) -> usize {
        self.server.received_requests().await.map_or(0, |requests| requests.len())
    }

    /// Asserts that exactly `expected` requests were received.
    pub async fn assert_request_count(&self, expected: usize) {
        let actual = self.request_count().await;
        assert_eq!(actual, expected, "expected {expected} requests, received {actual}");
    }
}

/// Configuration for one mocked endpoint.
pub struct MockEndpoint {
    /// Request path to match.
    pub path: String,
    /// Headers the request must carry.
    pub expected_headers: Vec<(String, String)>,
    /// Response to return.
    pub response: MockResponse,
    /// Match at most this many requests.
    pub times: Option<u64>,
}

impl MockEndpoint {
    /// Endpoint answering 200 `{"received": true}`.
    pub fn success(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            expected_headers: Vec::new(),
            response: MockResponse::Status {
                status: StatusCode::OK,
                body: Some(serde_json::json!({ "received": true })),
            },
            times: None,
        }
    }

    /// Endpoint answering `status` with an error body.
    pub fn failure(path: impl Into<String>, status: u16) -> Self {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        Self {
            path: path.into(),
            expected_headers: Vec::new(),
            response: MockResponse::Status {
                status,
                body: Some(serde_json::json!({ "error": "Simulated failure" })),
            },
            times: None,
        }
    }

    /// Endpoint that answers 200 only after `delay`.
    pub fn slow(path: impl Into<String>, delay: Duration) -> Self {
        Self {
            path: path.into(),
            expected_headers: Vec::new(),
            response: MockResponse::Delayed { status: StatusCode::OK, delay },
            times: None,
        }
    }

    /// Requires a header on matching requests.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.expected_headers.push((key.into(), value.into()));
        self
    }

    /// Limits the endpoint to the first `n` matching requests.
    pub fn times(mut self, n: u64) -> Self {
        self.times = Some(n);
        self
    }
}

/// Response returned by a mocked endpoint.
pub enum MockResponse {
    /// Immediate response with an optional JSON body.
    Status {
        /// Status code.
        status: StatusCode,
        /// JSON body.
        body: Option<Value>,
    },
    /// Response sent after a delay, for timeout tests.
    Delayed {
        /// Status code.
        status: StatusCode,
        /// Delay before responding.
        delay: Duration,
    },
}

impl MockResponse {
    fn into_template(self) -> ResponseTemplate {
        match self {
            Self::Status { status, body: Some(body) } => {
                ResponseTemplate::new(status.as_u16()).set_body_json(body)
            },
            Self::Status { status, body: None } => ResponseTemplate::new(status.as_u16()),
            Self::Delayed { status, delay } => {
                ResponseTemplate::new(status.as_u16()).set_delay(delay)
            },
        }
    }
}

/// A request captured by the mock server.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    /// HTTP method.
    pub method: Method,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Raw body bytes.
    pub body: Bytes,
}

impl RecordedRequest {
    /// Header value as a string, if present and valid UTF-8.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Body parsed as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the body is not valid JSON.
    pub fn json(&self) -> serde_json::Result<Value> {
        serde_json::from_slice(&self.body)
    }
}
