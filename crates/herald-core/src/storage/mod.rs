//! Database access layer for delivery tasks.
//!
//! All task SQL lives in this module. The rest of the system reaches the
//! database through [`Storage`] and its repositories, which keeps the claim
//! protocol and state guards in one place.

use std::sync::Arc;

use sqlx::PgPool;

pub mod schema;
pub mod tasks;

use crate::{error::Result, time::Clock};

/// Entry point for all database operations.
///
/// Holds the shared connection pool and the repositories built on it.
#[derive(Clone)]
pub struct Storage {
    /// Repository for delivery tasks.
    pub tasks: Arc<tasks::Repository>,

    pool: Arc<PgPool>,
}

impl Storage {
    /// Creates storage over `pool`, taking timestamps from `clock`.
    pub fn new(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        let pool = Arc::new(pool);

        Self { tasks: Arc::new(tasks::Repository::new(pool.clone(), clock)), pool }
    }

    /// Returns the shared connection pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Verifies database connectivity with `SELECT 1`.
    ///
    /// Backs the `/ready` endpoint.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy or the
    /// query times out.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) = sqlx::query_as("SELECT 1").fetch_one(&*self.pool).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::RealClock;

    #[tokio::test]
    async fn storage_can_be_created() {
        let pool = sqlx::PgPool::connect_lazy("postgresql://test").unwrap();
        let storage = Storage::new(pool, Arc::new(RealClock::new()));

        assert!(Arc::ptr_eq(&storage.pool(), &storage.tasks.pool()));
    }
}
