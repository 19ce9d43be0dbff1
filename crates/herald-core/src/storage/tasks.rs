//! Repository for delivery task persistence and claiming.
//!
//! Concurrent dispatchers share one `delivery_tasks` table. Exclusivity per
//! attempt comes from two mechanisms working together:
//!
//! - `claim_batch` selects due rows with `FOR UPDATE SKIP LOCKED`, so
//!   concurrent claimers skip rows another claimer holds instead of
//!   blocking on them.
//! - While holding those locks it pushes `next_attempt_at` forward by a
//!   lease, so the rows stay invisible to later claims after the short
//!   claim transaction commits and the HTTP attempt runs outside it.
//!
//! Every state transition is guarded on `status = 'pending'` and on the
//! expected attempt count, so terminal tasks are never written again and
//! `attempted_count` only ever grows by one.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{Executor, PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{CoreError, Result},
    models::{DeliveryTask, TaskFilter, TaskId},
    time::Clock,
};

/// Repository for delivery task database operations.
pub struct Repository {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>, clock: Arc<dyn Clock>) -> Self {
        Self { pool, clock }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Creates a pending task due immediately.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the insert fails.
    pub async fn create(&self, target_url: &str, payload: Map<String, Value>) -> Result<DeliveryTask> {
        let task = DeliveryTask::new(target_url, payload, self.clock.now_utc());
        self.insert_impl(&*self.pool, &task).await?;
        Ok(task)
    }

    /// Creates a pending task within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        target_url: &str,
        payload: Map<String, Value>,
    ) -> Result<DeliveryTask> {
        let task = DeliveryTask::new(target_url, payload, self.clock.now_utc());
        self.insert_impl(&mut **tx, &task).await?;
        Ok(task)
    }

    /// Inserts a fully specified task row.
    ///
    /// Used by fixtures that need tasks in a particular state.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::ConstraintViolation` on a duplicate id or an
    /// invalid status, and `CoreError::Database` for other failures.
    pub async fn insert(&self, task: &DeliveryTask) -> Result<TaskId> {
        self.insert_impl(&*self.pool, task).await
    }

    /// Inserts a fully specified task row within a transaction.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::insert`].
    pub async fn insert_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task: &DeliveryTask,
    ) -> Result<TaskId> {
        self.insert_impl(&mut **tx, task).await
    }

    async fn insert_impl<'e, E>(&self, executor: E, task: &DeliveryTask) -> Result<TaskId>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO delivery_tasks (
                id, target_url, payload, status, attempted_count,
                next_attempt_at, created_at, last_attempted_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(task.id)
        .bind(&task.target_url)
        .bind(&task.payload)
        .bind(task.status)
        .bind(task.attempted_count)
        .bind(task.next_attempt_at)
        .bind(task.created_at)
        .bind(task.last_attempted_at)
        .fetch_one(executor)
        .await?;

        Ok(TaskId(id))
    }

    /// Finds a task by ID.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the query fails.
    pub async fn find_by_id(&self, task_id: TaskId) -> Result<Option<DeliveryTask>> {
        self.find_by_id_impl(&*self.pool, task_id).await
    }

    /// Finds a task by ID within a transaction.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the query fails.
    pub async fn find_by_id_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task_id: TaskId,
    ) -> Result<Option<DeliveryTask>> {
        self.find_by_id_impl(&mut **tx, task_id).await
    }

    async fn find_by_id_impl<'e, E>(&self, executor: E, task_id: TaskId) -> Result<Option<DeliveryTask>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let task = sqlx::query_as::<_, DeliveryTask>(
            r#"
            SELECT id, target_url, payload, status, attempted_count,
                   next_attempt_at, created_at, last_attempted_at
            FROM delivery_tasks
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(executor)
        .await?;

        Ok(task)
    }

    /// Lists tasks newest first with a total count for pagination.
    ///
    /// `page` is 1-based; callers clamp `limit` to a sane range. Page 0 is
    /// treated as page 1.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if either query fails.
    pub async fn find_all(
        &self,
        filter: &TaskFilter,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<DeliveryTask>, i64)> {
        let limit = i64::from(limit);
        let offset = i64::from(page.max(1) - 1) * limit;
        let status = filter.status.map(|s| s.as_str());

        let tasks = sqlx::query_as::<_, DeliveryTask>(
            r#"
            SELECT id, target_url, payload, status, attempted_count,
                   next_attempt_at, created_at, last_attempted_at
            FROM delivery_tasks
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY created_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&*self.pool)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM delivery_tasks
            WHERE ($1::text IS NULL OR status = $1)
            "#,
        )
        .bind(status)
        .fetch_one(&*self.pool)
        .await?;

        Ok((tasks, total))
    }

    /// Claims up to `max_n` due pending tasks for this worker.
    ///
    /// Runs a short `READ COMMITTED` transaction that locks the oldest-due
    /// rows with `FOR UPDATE SKIP LOCKED`, moves their `next_attempt_at` to
    /// `now + lease`, and commits. Tasks are returned oldest-due first, with
    /// `next_attempt_at` reflecting the lease.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if `lease` cannot be represented
    /// and `CoreError::Database` if the transaction fails.
    pub async fn claim_batch(&self, max_n: usize, lease: Duration) -> Result<Vec<DeliveryTask>> {
        if max_n == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED").execute(&mut *tx).await?;

        let tasks = self.claim_batch_in_tx(&mut tx, max_n, lease).await?;

        tx.commit().await?;

        Ok(tasks)
    }

    /// Claims due tasks inside a caller-owned transaction.
    ///
    /// Row locks are held until the caller commits, so keep the transaction
    /// short.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::claim_batch`].
    pub async fn claim_batch_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        max_n: usize,
        lease: Duration,
    ) -> Result<Vec<DeliveryTask>> {
        let now = self.clock.now_utc();
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| CoreError::InvalidInput(format!("claim lease out of range: {e}")))?;
        let leased_until = now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut tasks = sqlx::query_as::<_, DeliveryTask>(
            r#"
            SELECT id, target_url, payload, status, attempted_count,
                   next_attempt_at, created_at, last_attempted_at
            FROM delivery_tasks
            WHERE status = 'pending'
              AND next_attempt_at <= $1
            ORDER BY next_attempt_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .bind(i64::try_from(max_n).unwrap_or(i64::MAX))
        .fetch_all(&mut **tx)
        .await?;

        if tasks.is_empty() {
            return Ok(tasks);
        }

        let ids: Vec<Uuid> = tasks.iter().map(|t| t.id.0).collect();
        sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET next_attempt_at = $1
            WHERE id = ANY($2)
            "#,
        )
        .bind(leased_until)
        .bind(&ids)
        .execute(&mut **tx)
        .await?;

        for task in &mut tasks {
            task.next_attempt_at = leased_until;
        }

        Ok(tasks)
    }

    /// Marks a task as delivered. Terminal.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidState` if the task is not pending with
    /// `attempted_count == attempt_number - 1`, and `CoreError::Database`
    /// if the update fails.
    pub async fn mark_succeeded(&self, task_id: TaskId, attempt_number: u32) -> Result<()> {
        self.mark_succeeded_impl(&*self.pool, task_id, attempt_number).await
    }

    /// Marks a task as delivered within a transaction.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::mark_succeeded`].
    pub async fn mark_succeeded_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task_id: TaskId,
        attempt_number: u32,
    ) -> Result<()> {
        self.mark_succeeded_impl(&mut **tx, task_id, attempt_number).await
    }

    async fn mark_succeeded_impl<'e, E>(
        &self,
        executor: E,
        task_id: TaskId,
        attempt_number: u32,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let attempt = attempt_to_i32(attempt_number)?;

        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET status = 'succeeded',
                attempted_count = $2,
                last_attempted_at = $3
            WHERE id = $1
              AND status = 'pending'
              AND attempted_count = $2 - 1
            "#,
        )
        .bind(task_id)
        .bind(attempt)
        .bind(self.clock.now_utc())
        .execute(executor)
        .await?;

        ensure_transitioned(result.rows_affected(), task_id, attempt_number)
    }

    /// Records a failed attempt and schedules the next one.
    ///
    /// The task stays `pending` and becomes claimable at `next_attempt_at`.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::mark_succeeded`].
    pub async fn mark_failed(
        &self,
        task_id: TaskId,
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.mark_failed_impl(&*self.pool, task_id, attempt_number, next_attempt_at).await
    }

    /// Records a failed attempt within a transaction.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::mark_succeeded`].
    pub async fn mark_failed_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task_id: TaskId,
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()> {
        self.mark_failed_impl(&mut **tx, task_id, attempt_number, next_attempt_at).await
    }

    async fn mark_failed_impl<'e, E>(
        &self,
        executor: E,
        task_id: TaskId,
        attempt_number: u32,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let attempt = attempt_to_i32(attempt_number)?;

        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET attempted_count = $2,
                last_attempted_at = $3,
                next_attempt_at = $4
            WHERE id = $1
              AND status = 'pending'
              AND attempted_count = $2 - 1
            "#,
        )
        .bind(task_id)
        .bind(attempt)
        .bind(self.clock.now_utc())
        .bind(next_attempt_at)
        .execute(executor)
        .await?;

        ensure_transitioned(result.rows_affected(), task_id, attempt_number)
    }

    /// Marks a task as dead after its final failed attempt. Terminal.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::mark_succeeded`].
    pub async fn mark_dead(&self, task_id: TaskId, attempt_number: u32) -> Result<()> {
        self.mark_dead_impl(&*self.pool, task_id, attempt_number).await
    }

    /// Marks a task as dead within a transaction.
    ///
    /// # Errors
    ///
    /// Same as [`Repository::mark_succeeded`].
    pub async fn mark_dead_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        task_id: TaskId,
        attempt_number: u32,
    ) -> Result<()> {
        self.mark_dead_impl(&mut **tx, task_id, attempt_number).await
    }

    async fn mark_dead_impl<'e, E>(&self, executor: E, task_id: TaskId, attempt_number: u32) -> Result<()>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let attempt = attempt_to_i32(attempt_number)?;

        let result = sqlx::query(
            r#"
            UPDATE delivery_tasks
            SET status = 'dead',
                attempted_count = $2,
                last_attempted_at = $3
            WHERE id = $1
              AND status = 'pending'
              AND attempted_count = $2 - 1
            "#,
        )
        .bind(task_id)
        .bind(attempt)
        .bind(self.clock.now_utc())
        .execute(executor)
        .await?;

        ensure_transitioned(result.rows_affected(), task_id, attempt_number)
    }
}

fn attempt_to_i32(attempt_number: u32) -> Result<i32> {
    match i32::try_from(attempt_number) {
        Ok(n) if n >= 1 => Ok(n),
        _ => Err(CoreError::InvalidInput(format!("attempt number out of range: {attempt_number}"))),
    }
}

fn ensure_transitioned(rows_affected: u64, task_id: TaskId, attempt_number: u32) -> Result<()> {
    if rows_affected == 0 {
        return Err(CoreError::InvalidState(format!(
            "task {task_id} is terminal or its attempt count is not {}",
            attempt_number.saturating_sub(1)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::RealClock;

    #[tokio::test]
    async fn repository_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let _repo = Repository::new(Arc::new(pool), Arc::new(RealClock::new()));
    }

    #[tokio::test]
    async fn zero_sized_claim_does_not_touch_database() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let repo = Repository::new(Arc::new(pool), Arc::new(RealClock::new()));

        let claimed = repo.claim_batch(0, Duration::from_secs(60)).await.unwrap();

        assert!(claimed.is_empty());
    }

    #[test]
    fn attempt_zero_is_rejected() {
        assert!(matches!(attempt_to_i32(0), Err(CoreError::InvalidInput(_))));
        assert!(matches!(attempt_to_i32(u32::MAX), Err(CoreError::InvalidInput(_))));
        assert_eq!(attempt_to_i32(3).unwrap(), 3);
    }

    #[test]
    fn unmatched_guard_is_invalid_state() {
        let err = ensure_transitioned(0, TaskId::new(), 4).unwrap_err();
        assert!(matches!(err, CoreError::InvalidState(_)));
        assert!(ensure_transitioned(1, TaskId::new(), 4).is_ok());
    }
}
