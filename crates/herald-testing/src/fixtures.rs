//! Delivery task builders with sensible defaults.

use chrono::{DateTime, Duration, Utc};
use herald_core::{
    models::{DeliveryTask, TaskId, TaskStatus},
    storage::Storage,
};
use rand::Rng;
use serde_json::{json, Map, Value};

/// Builder for delivery tasks in arbitrary states.
///
/// `build()` produces an in-memory task; `insert()` persists it unchanged,
/// which lets tests start from states the public API cannot reach directly.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    id: TaskId,
    target_url: String,
    payload: Map<String, Value>,
    status: TaskStatus,
    attempted_count: i32,
    next_attempt_at: Option<DateTime<Utc>>,
    created_at: Option<DateTime<Utc>>,
    last_attempted_at: Option<DateTime<Utc>>,
}

impl TaskBuilder {
    /// Pending task with a small payment payload, due now.
    pub fn new() -> Self {
        let amount: u32 = rand::thread_rng().gen_range(1..10_000);
        let payload = match json!({ "type": "payment.created", "amount": amount }) {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Self {
            id: TaskId::new(),
            target_url: "http://localhost:3001/webhook".to_string(),
            payload,
            status: TaskStatus::Pending,
            attempted_count: 0,
            next_attempt_at: None,
            created_at: None,
            last_attempted_at: None,
        }
    }

    /// Sets the destination URL.
    pub fn target_url(mut self, url: impl Into<String>) -> Self {
        self.target_url = url.into();
        self
    }

    /// Replaces the payload. Non-object values are wrapped as `{"value": v}`.
    pub fn payload(mut self, payload: Value) -> Self {
        self.payload = match payload {
            Value::Object(map) => map,
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            },
        };
        self
    }

    /// Sets the lifecycle state.
    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }

    /// Sets the number of attempts already made.
    pub fn attempted_count(mut self, count: i32) -> Self {
        self.attempted_count = count;
        self
    }

    /// Sets the claim eligibility time.
    pub fn next_attempt_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_attempt_at = Some(at);
        self
    }

    /// Makes the task due `offset` after `now`; negative offsets are overdue.
    pub fn due_in(self, now: DateTime<Utc>, offset: Duration) -> Self {
        self.next_attempt_at(now + offset)
    }

    /// Sets the creation time.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    /// Sets the last attempt time.
    pub fn last_attempted_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_attempted_at = Some(at);
        self
    }

    /// Builds the task, taking unset timestamps from `now`.
    pub fn build_at(self, now: DateTime<Utc>) -> DeliveryTask {
        DeliveryTask {
            id: self.id,
            target_url: self.target_url,
            payload: sqlx::types::Json(self.payload),
            status: self.status,
            attempted_count: self.attempted_count,
            next_attempt_at: self.next_attempt_at.unwrap_or(now),
            created_at: self.created_at.unwrap_or(now),
            last_attempted_at: self.last_attempted_at,
        }
    }

    /// Builds the task using the current wall-clock time for unset fields.
    pub fn build(self) -> DeliveryTask {
        self.build_at(Utc::now())
    }

    /// Persists the task and returns it.
    ///
    /// # Errors
    ///
    /// Returns the storage error if the insert fails.
    pub async fn insert(self, storage: &Storage, now: DateTime<Utc>) -> anyhow::Result<DeliveryTask> {
        let task = self.build_at(now);
        storage.tasks.insert(&task).await?;
        Ok(task)
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_pending_and_due() {
        let now = Utc::now();
        let task = TaskBuilder::new().build_at(now);

        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempted_count, 0);
        assert_eq!(task.next_attempt_at, now);
        assert!(task.payload.0.contains_key("amount"));
    }

    #[test]
    fn non_object_payload_is_wrapped() {
        let task = TaskBuilder::new().payload(json!(42)).build();
        assert_eq!(task.payload.0["value"], json!(42));
    }

    #[test]
    fn due_in_offsets_from_now() {
        let now = Utc::now();
        let task = TaskBuilder::new().due_in(now, Duration::seconds(-30)).build_at(now);
        assert!(task.is_due(now));
    }
}
