//! Isolated PostgreSQL schemas for integration tests.
//!
//! Each [`TestDatabase`] creates a uniquely named schema on the database
//! named by `DATABASE_URL`, points every pooled connection's `search_path`
//! at it, and applies the task schema there. Tests can therefore run in
//! parallel against one server without seeing each other's rows.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use herald_core::{
    storage::{schema, Storage},
    Clock,
};
use sqlx::{postgres::PgPoolOptions, Executor, PgPool};
use tracing::{debug, warn};
use uuid::Uuid;

/// Handle to a per-test schema and a pool bound to it.
#[derive(Debug)]
pub struct TestDatabase {
    pool: PgPool,
    admin_pool: PgPool,
    schema: String,
}

impl TestDatabase {
    /// Creates a fresh schema and applies the task table to it.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is unset or the server cannot be
    /// reached.
    pub async fn new() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

        let admin_pool = PgPoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(3))
            .connect(&database_url)
            .await
            .context("failed to connect to test database")?;

        let schema_name = format!("test_{}", Uuid::new_v4().simple());
        sqlx::query(&format!("CREATE SCHEMA \"{schema_name}\""))
            .execute(&admin_pool)
            .await
            .with_context(|| format!("failed to create schema {schema_name}"))?;

        let set_search_path = format!("SET search_path TO \"{schema_name}\"");
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .min_connections(0)
            .acquire_timeout(Duration::from_secs(3))
            .after_connect(move |conn, _meta| {
                let statement = set_search_path.clone();
                Box::pin(async move {
                    conn.execute(statement.as_str()).await?;
                    Ok(())
                })
            })
            .connect(&database_url)
            .await
            .with_context(|| format!("failed to create pool for schema {schema_name}"))?;

        schema::apply(&pool)
            .await
            .with_context(|| format!("failed to apply schema in {schema_name}"))?;

        debug!(schema = %schema_name, "created isolated test schema");

        Ok(Self { pool, admin_pool, schema: schema_name })
    }

    /// Pool whose connections resolve tables in this test's schema.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Name of the isolated schema.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Storage over this test's schema using `clock` for timestamps.
    pub fn storage(&self, clock: Arc<dyn Clock>) -> Storage {
        Storage::new(self.pool.clone(), clock)
    }

    /// Closes the pool and drops the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be dropped.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;

        let result = sqlx::query(&format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", self.schema))
            .execute(&self.admin_pool)
            .await;
        self.admin_pool.close().await;

        if let Err(e) = &result {
            warn!(schema = %self.schema, error = %e, "failed to drop test schema");
        }
        result.map(|_| ()).with_context(|| format!("failed to drop schema {}", self.schema))
    }
}
