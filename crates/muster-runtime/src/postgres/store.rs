use sqlx::PgPool;

use muster_core::cluster::{BoxFuture, VersionStore};
use muster_core::error::{MusterError, Result};

/// Version record storage in the `muster_kv` table.
#[derive(Clone)]
pub struct PgVersionStore {
    pool: PgPool,
}

impl PgVersionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl VersionStore for PgVersionStore {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM muster_kv WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| MusterError::Database(format!("Failed to read {}: {}", key, e)))?;

            Ok(row.map(|(value,)| value))
        })
    }

    fn put<'a>(&'a self, key: &'a str, value: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            sqlx::query(
                r#"
                INSERT INTO muster_kv (key, value, updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (key) DO UPDATE SET
                    value = EXCLUDED.value,
                    updated_at = NOW()
                "#,
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(|e| MusterError::Database(format!("Failed to write {}: {}", key, e)))?;

            Ok(())
        })
    }
}
