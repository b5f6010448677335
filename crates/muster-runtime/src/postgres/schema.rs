//! Tables backing the Postgres registry.

use sqlx::PgPool;
use tracing::{debug, info};

use muster_core::error::{MusterError, Result};

/// Internal schema, embedded from the migrations directory.
const MUSTER_INTERNAL_SQL: &str = include_str!("../../migrations/0000_muster_internal.sql");

/// Create the registry tables if they do not exist yet. Safe to run on every start.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    for statement in statements(MUSTER_INTERNAL_SQL) {
        debug!("Applying schema statement: {}", first_line(&statement));
        sqlx::query(&statement)
            .execute(pool)
            .await
            .map_err(|e| MusterError::Database(format!("Failed to apply schema: {}", e)))?;
    }
    info!("Registry schema ready");
    Ok(())
}

/// Split on `;`, dropping comment-only and empty chunks.
fn statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|chunk| {
            chunk
                .lines()
                .filter(|l| !l.trim_start().starts_with("--"))
                .collect::<Vec<_>>()
                .join("\n")
                .trim()
                .to_string()
        })
        .filter(|s| !s.is_empty())
        .collect()
}

fn first_line(statement: &str) -> &str {
    statement.lines().next().unwrap_or_default()
}
