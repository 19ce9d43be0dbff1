//! Idempotent schema bootstrap for the task store.
//!
//! Tables are created unqualified, so they land in the first schema on the
//! connection's `search_path`. Test databases rely on this to isolate each
//! test in its own schema.

use sqlx::PgPool;
use tracing::debug;

use crate::error::Result;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "delivery_tasks",
        r#"
        CREATE TABLE IF NOT EXISTS delivery_tasks (
            id UUID PRIMARY KEY,
            target_url VARCHAR(2048) NOT NULL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'succeeded', 'dead')),
            attempted_count INTEGER NOT NULL DEFAULT 0
                CHECK (attempted_count >= 0),
            next_attempt_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            last_attempted_at TIMESTAMPTZ
        )
        "#,
    ),
    (
        "idx_delivery_tasks_due",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_tasks_due
        ON delivery_tasks(status, next_attempt_at)
        WHERE status = 'pending'
        "#,
    ),
    (
        "idx_delivery_tasks_created",
        r#"
        CREATE INDEX IF NOT EXISTS idx_delivery_tasks_created
        ON delivery_tasks(created_at DESC)
        "#,
    ),
];

/// Creates the `delivery_tasks` table and its indexes if missing.
///
/// Safe to run on every start.
///
/// # Errors
///
/// Returns `CoreError::Database` if any statement fails.
pub async fn apply(pool: &PgPool) -> Result<()> {
    for &(object, statement) in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
        debug!(object, "schema object ensured");
    }

    Ok(())
}
