//! Storage abstraction layer for the delivery engine.
//!
//! The engine reaches the task store only through [`DeliveryStorage`]. The
//! production implementation forwards to `herald_core::storage::Storage`;
//! [`mock::MockDeliveryStorage`] reproduces the same claim and guard rules
//! in memory so delivery logic can be tested without PostgreSQL.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use herald_core::{
    error::Result,
    models::{DeliveryTask, TaskId},
    storage::Storage,
};

/// Task store operations required by the delivery engine.
pub trait DeliveryStorage: Send + Sync + 'static {
    /// Claims up to `batch_size` due tasks, oldest-due first.
    ///
    /// Claimed tasks stay invisible to other claimers for the duration of
    /// the claim lease.
    fn claim_batch(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryTask>>> + Send + '_>>;

    /// Records a successful attempt. Terminal.
    fn mark_succeeded(
        &self,
        task_id: TaskId,
        attempt_number: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records a failed attempt and reschedules the task.
    fn mark_failed(
        &self,
        task_id: TaskId,
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Records the final failed attempt. Terminal.
    fn mark_dead(
        &self,
        task_id: TaskId,
        attempt_number: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Production storage backed by PostgreSQL.
pub struct PostgresDeliveryStorage {
    storage: Arc<Storage>,
    lease: Duration,
}

impl PostgresDeliveryStorage {
    /// Creates an adapter that claims with the given lease.
    pub fn new(storage: Arc<Storage>, lease: Duration) -> Self {
        Self { storage, lease }
    }
}

impl DeliveryStorage for PostgresDeliveryStorage {
    fn claim_batch(
        &self,
        batch_size: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryTask>>> + Send + '_>> {
        Box::pin(async move { self.storage.tasks.claim_batch(batch_size, self.lease).await })
    }

    fn mark_succeeded(
        &self,
        task_id: TaskId,
        attempt_number: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.storage.tasks.mark_succeeded(task_id, attempt_number).await })
    }

    fn mark_failed(
        &self,
        task_id: TaskId,
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.storage.tasks.mark_failed(task_id, attempt_number, next_attempt_at).await
        })
    }

    fn mark_dead(
        &self,
        task_id: TaskId,
        attempt_number: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move { self.storage.tasks.mark_dead(task_id, attempt_number).await })
    }
}

pub mod mock {
    //! In-memory task store for testing.
    //!
    //! Applies the same rules as the PostgreSQL repository: due tasks are
    //! claimed oldest first and leased, and every transition is guarded on
    //! `pending` plus the expected attempt count. Supports injecting claim
    //! and per-task update failures.

    use std::{
        collections::{HashMap, HashSet},
        future::Future,
        pin::Pin,
        sync::Arc,
        time::Duration,
    };

    use chrono::{DateTime, Utc};
    use herald_core::{
        error::{CoreError, Result},
        models::{DeliveryTask, TaskId, TaskStatus},
        Clock,
    };
    use tokio::sync::RwLock;

    use super::DeliveryStorage;

    /// Mock storage for testing delivery logic without a database.
    pub struct MockDeliveryStorage {
        clock: Arc<dyn Clock>,
        lease: Duration,
        tasks: Arc<RwLock<HashMap<TaskId, DeliveryTask>>>,
        claim_error: Arc<RwLock<Option<String>>>,
        failing_updates: Arc<RwLock<HashSet<TaskId>>>,
        claims: Arc<RwLock<Vec<TaskId>>>,
    }

    impl MockDeliveryStorage {
        /// Creates an empty store driven by `clock`.
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self::with_lease(clock, Duration::from_secs(crate::DEFAULT_CLAIM_LEASE_SECONDS))
        }

        /// Creates an empty store with a custom claim lease.
        pub fn with_lease(clock: Arc<dyn Clock>, lease: Duration) -> Self {
            Self {
                clock,
                lease,
                tasks: Arc::new(RwLock::new(HashMap::new())),
                claim_error: Arc::new(RwLock::new(None)),
                failing_updates: Arc::new(RwLock::new(HashSet::new())),
                claims: Arc::new(RwLock::new(Vec::new())),
            }
        }

        /// Stores a task as-is.
        pub async fn add_task(&self, task: DeliveryTask) {
            self.tasks.write().await.insert(task.id, task);
        }

        /// Returns the stored copy of a task.
        pub async fn task(&self, task_id: TaskId) -> Option<DeliveryTask> {
            self.tasks.read().await.get(&task_id).cloned()
        }

        /// Returns every stored task.
        pub async fn tasks(&self) -> Vec<DeliveryTask> {
            self.tasks.read().await.values().cloned().collect()
        }

        /// Every task id handed out by `claim_batch`, in claim order.
        pub async fn claimed_ids(&self) -> Vec<TaskId> {
            self.claims.read().await.clone()
        }

        /// Makes the next claim fail with a database error.
        pub async fn inject_claim_error(&self, error: impl Into<String>) {
            *self.claim_error.write().await = Some(error.into());
        }

        /// Makes every state transition of `task_id` fail.
        pub async fn fail_updates_for(&self, task_id: TaskId) {
            self.failing_updates.write().await.insert(task_id);
        }

        async fn transition(
            &self,
            task_id: TaskId,
            attempt_number: u32,
            apply: impl FnOnce(&mut DeliveryTask) + Send,
        ) -> Result<()> {
            if self.failing_updates.read().await.contains(&task_id) {
                return Err(CoreError::Database(format!("injected update failure for {task_id}")));
            }

            let attempt = i32::try_from(attempt_number)
                .ok()
                .filter(|n| *n >= 1)
                .ok_or_else(|| {
                    CoreError::InvalidInput(format!("attempt number out of range: {attempt_number}"))
                })?;

            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(&task_id)
                .filter(|t| t.status == TaskStatus::Pending && t.attempted_count == attempt - 1)
                .ok_or_else(|| {
                    CoreError::InvalidState(format!(
                        "task {task_id} is terminal or its attempt count is not {}",
                        attempt - 1
                    ))
                })?;

            task.attempted_count = attempt;
            task.last_attempted_at = Some(self.clock.now_utc());
            apply(task);
            Ok(())
        }
    }

    impl DeliveryStorage for MockDeliveryStorage {
        fn claim_batch(
            &self,
            batch_size: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<DeliveryTask>>> + Send + '_>> {
            Box::pin(async move {
                if let Some(error) = self.claim_error.write().await.take() {
                    return Err(CoreError::Database(error));
                }

                let now = self.clock.now_utc();
                let leased_until = chrono::Duration::from_std(self.lease)
                    .ok()
                    .and_then(|lease| now.checked_add_signed(lease))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);

                let mut tasks = self.tasks.write().await;
                let mut due: Vec<&mut DeliveryTask> =
                    tasks.values_mut().filter(|t| t.is_due(now)).collect();
                due.sort_by_key(|t| t.next_attempt_at);

                let mut claimed = Vec::new();
                for task in due.into_iter().take(batch_size) {
                    task.next_attempt_at = leased_until;
                    claimed.push(task.clone());
                }
                drop(tasks);

                self.claims.write().await.extend(claimed.iter().map(|t| t.id));
                Ok(claimed)
            })
        }

        fn mark_succeeded(
            &self,
            task_id: TaskId,
            attempt_number: u32,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.transition(task_id, attempt_number, |task| {
                    task.status = TaskStatus::Succeeded;
                })
                .await
            })
        }

        fn mark_failed(
            &self,
            task_id: TaskId,
            attempt_number: u32,
            next_attempt_at: DateTime<Utc>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.transition(task_id, attempt_number, |task| {
                    task.next_attempt_at = next_attempt_at;
                })
                .await
            })
        }

        fn mark_dead(
            &self,
            task_id: TaskId,
            attempt_number: u32,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                self.transition(task_id, attempt_number, |task| {
                    task.status = TaskStatus::Dead;
                })
                .await
            })
        }
    }
}
