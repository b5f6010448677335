//! Database access for Postgres backend tests.
//!
//! Tests read `TEST_DATABASE_URL`, never `DATABASE_URL`, and skip when it
//! is unset. Each test works in its own scope or key so runs can share
//! one database.

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::OnceCell;
use uuid::Uuid;

use muster_core::cluster::RegistryScope;

use super::ensure_schema;

static SCHEMA: OnceCell<()> = OnceCell::const_new();

/// URL of the test database, if one was given.
pub(crate) fn test_database_url() -> Option<String> {
    match std::env::var("TEST_DATABASE_URL") {
        Ok(url) if !url.is_empty() => Some(url),
        _ => {
            eprintln!("TEST_DATABASE_URL not set, skipping database test");
            None
        }
    }
}

/// Pool on the test database with the registry schema applied.
pub(crate) async fn test_pool() -> Option<PgPool> {
    let url = test_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .unwrap();

    SCHEMA
        .get_or_init(|| async {
            ensure_schema(&pool).await.unwrap();
        })
        .await;
    Some(pool)
}

/// A registry scope no other test shares.
pub(crate) fn unique_scope() -> RegistryScope {
    RegistryScope::new(format!("test-{}", Uuid::new_v4().simple()), "default")
}

/// A lock or record name no other test shares.
pub(crate) fn unique_name(prefix: &str) -> String {
    format!("{}/{}", prefix, Uuid::new_v4().simple())
}
