//! Delivery task model and strongly-typed identifiers.
//!
//! A [`DeliveryTask`] is one webhook delivery obligation. It is created
//! `pending`, retried while `pending`, and ends in exactly one of the
//! terminal states `succeeded` or `dead`.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

/// Name of the correlation field injected into every outbound body.
pub const EVENT_ID_FIELD: &str = "event_id";

/// Strongly-typed task identifier.
///
/// Generated once at creation and never changed. The same value is sent to
/// receivers as the `event_id` field of the outbound body.
///
/// # Example
///
/// ```
/// use herald_core::models::TaskId;
/// let task_id = TaskId::new();
/// println!("delivering task {task_id}");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Creates a new random task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for TaskId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl sqlx::Type<PgDb> for TaskId {
    fn type_info() -> PgTypeInfo {
        <Uuid as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TaskId {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(Self(uuid))
    }
}

impl sqlx::Encode<'_, PgDb> for TaskId {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
    }
}

/// Lifecycle state of a delivery task.
///
/// `Pending` is both the initial state and the retry state. `Succeeded` and
/// `Dead` are terminal: once reached, the task row is never written again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for its next attempt once `next_attempt_at` has passed.
    Pending,

    /// Receiver answered 2xx. Terminal.
    Succeeded,

    /// Attempt ceiling reached without success. Terminal.
    Dead,
}

impl TaskStatus {
    /// Database and wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Dead => "dead",
        }
    }

    /// Returns true if no further transition may happen.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Dead)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "dead" => Ok(Self::Dead),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for TaskStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for TaskStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for TaskStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// One webhook delivery obligation as persisted by the task store.
///
/// Instances held by the delivery engine are snapshots taken at claim time;
/// every state change goes back through the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryTask {
    /// Unique identifier.
    pub id: TaskId,

    /// Destination URL. Immutable.
    pub target_url: String,

    /// Submitter-supplied JSON object. Immutable.
    pub payload: sqlx::types::Json<Map<String, Value>>,

    /// Current lifecycle state.
    pub status: TaskStatus,

    /// Number of attempts made so far. Starts at 0 and grows by exactly one
    /// per attempt.
    pub attempted_count: i32,

    /// The task must not be claimed before this instant.
    pub next_attempt_at: DateTime<Utc>,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Time of the most recent attempt, if any.
    pub last_attempted_at: Option<DateTime<Utc>>,
}

impl DeliveryTask {
    /// Builds a fresh pending task as the store would create it.
    pub fn new(target_url: impl Into<String>, payload: Map<String, Value>, now: DateTime<Utc>) -> Self {
        Self {
            id: TaskId::new(),
            target_url: target_url.into(),
            payload: sqlx::types::Json(payload),
            status: TaskStatus::Pending,
            attempted_count: 0,
            next_attempt_at: now,
            created_at: now,
            last_attempted_at: None,
        }
    }

    /// Attempt number the next delivery will carry (1-based).
    pub fn next_attempt_number(&self) -> u32 {
        u32::try_from(self.attempted_count).unwrap_or(0).saturating_add(1)
    }

    /// Returns true if the task may be claimed at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.next_attempt_at <= now
    }

    /// Body sent to the receiver: the payload with `event_id` set to the task
    /// id. A submitter field with the same name is overwritten.
    pub fn outbound_payload(&self) -> Map<String, Value> {
        let mut body = self.payload.0.clone();
        body.insert(EVENT_ID_FIELD.to_string(), Value::String(self.id.to_string()));
        body
    }
}

/// Filter for listing tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskFilter {
    /// Only return tasks in this state.
    pub status: Option<TaskStatus>,
}

impl TaskFilter {
    /// Filter matching every task.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter matching tasks in `status`.
    pub fn with_status(status: TaskStatus) -> Self {
        Self { status: Some(status) }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("fixture must be an object"),
        }
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [TaskStatus::Pending, TaskStatus::Succeeded, TaskStatus::Dead] {
            assert_eq!(status.as_str().parse::<TaskStatus>(), Ok(status));
        }
        assert!("delivering".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn only_succeeded_and_dead_are_terminal() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Dead.is_terminal());
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(serde_json::to_value(TaskStatus::Succeeded).unwrap(), json!("succeeded"));
    }

    #[test]
    fn new_task_is_pending_and_due_immediately() {
        let now = Utc::now();
        let task = DeliveryTask::new("http://x/hook", payload(json!({"amount": 10})), now);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempted_count, 0);
        assert_eq!(task.next_attempt_number(), 1);
        assert!(task.is_due(now));
        assert!(task.last_attempted_at.is_none());
    }

    #[test]
    fn outbound_payload_injects_task_id() {
        let task = DeliveryTask::new(
            "http://x/hook",
            payload(json!({"amount": 10, "event_id": "spoofed"})),
            Utc::now(),
        );

        let body = task.outbound_payload();

        assert_eq!(body["amount"], json!(10));
        assert_eq!(body[EVENT_ID_FIELD], json!(task.id.to_string()));
        assert_eq!(task.payload.0["event_id"], json!("spoofed"));
    }

    #[test]
    fn task_id_parses_from_string() {
        let id = TaskId::new();
        assert_eq!(id.to_string().parse::<TaskId>().unwrap(), id);
        assert!("not-a-uuid".parse::<TaskId>().is_err());
    }
}
