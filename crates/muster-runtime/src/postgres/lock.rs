use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tracing::debug;

use muster_core::cluster::{BoxFuture, DistributedLock, LockLease};
use muster_core::config::LockConfig;
use muster_core::error::{MusterError, Result};

/// Global lock on PostgreSQL session advisory locks.
///
/// Each lease pins one pooled connection; the lock lives exactly as long
/// as that session, so the connection is closed rather than returned to
/// the pool when the lease goes away.
pub struct PgAdvisoryLock {
    pool: PgPool,
    retry_interval: Duration,
    max_retry_interval: Duration,
}

impl PgAdvisoryLock {
    pub fn new(pool: PgPool, config: &LockConfig) -> Self {
        Self {
            pool,
            retry_interval: config.retry_interval(),
            max_retry_interval: config.max_retry_interval(),
        }
    }
}

/// Stable advisory lock id for a lock name (64-bit FNV-1a).
pub fn lock_id(name: &str) -> i64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let hash = name
        .bytes()
        .fold(OFFSET, |h, b| (h ^ u64::from(b)).wrapping_mul(PRIME));
    hash as i64
}

impl DistributedLock for PgAdvisoryLock {
    fn acquire<'a>(&'a self, name: &'a str) -> BoxFuture<'a, Result<Box<dyn LockLease>>> {
        Box::pin(async move {
            let id = lock_id(name);
            let mut conn = self.pool.acquire().await.map_err(|e| {
                MusterError::LockUnavailable(format!("Failed to get connection for {}: {}", name, e))
            })?;
            conn.close_on_drop();

            let mut delay = self.retry_interval;
            loop {
                let (acquired,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
                    .bind(id)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(|e| {
                        MusterError::LockUnavailable(format!("Failed to acquire {}: {}", name, e))
                    })?;

                if acquired {
                    debug!(lock = %name, id, "Advisory lock acquired");
                    return Ok(Box::new(PgLease {
                        name: name.to_string(),
                        id,
                        conn,
                    }) as Box<dyn LockLease>);
                }

                debug!(lock = %name, retry_in = ?delay, "Advisory lock busy");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.max_retry_interval);
            }
        })
    }
}

struct PgLease {
    name: String,
    id: i64,
    conn: PoolConnection<Postgres>,
}

impl LockLease for PgLease {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(self: Box<Self>) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let PgLease { name, id, mut conn } = *self;
            let (released,): (bool,) = sqlx::query_as("SELECT pg_advisory_unlock($1)")
                .bind(id)
                .fetch_one(&mut *conn)
                .await
                .map_err(|e| MusterError::Database(format!("Failed to release {}: {}", name, e)))?;

            if !released {
                return Err(MusterError::LockUnavailable(format!(
                    "{} was not held by this session",
                    name
                )));
            }
            debug!(lock = %name, id, "Advisory lock released");
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::postgres::testing::{test_pool, unique_name};
    use muster_core::config::GLOBAL_LOCK_NAME;

    fn fast_retry() -> LockConfig {
        LockConfig {
            retry_interval_ms: 10,
            max_retry_interval_ms: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_lock_id_is_stable() {
        assert_eq!(lock_id(GLOBAL_LOCK_NAME), lock_id(GLOBAL_LOCK_NAME));
        // FNV-1a of the empty string is the offset basis.
        assert_eq!(lock_id(""), 0xcbf2_9ce4_8422_2325_u64 as i64);
    }

    #[test]
    fn test_lock_ids_differ_by_name() {
        assert_ne!(lock_id("/muster/locks/global"), lock_id("/muster/locks/other"));
    }

    #[tokio::test]
    async fn test_lock_excludes_other_session() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let name = unique_name("/muster/locks/test");
        let first = PgAdvisoryLock::new(pool.clone(), &fast_retry());
        let second = PgAdvisoryLock::new(pool, &fast_retry());

        let lease = first.acquire(&name).await.unwrap();
        assert_eq!(lease.name(), name);

        let blocked =
            tokio::time::timeout(Duration::from_millis(300), second.acquire(&name)).await;
        assert!(blocked.is_err());

        lease.release().await.unwrap();

        let lease = tokio::time::timeout(Duration::from_secs(5), second.acquire(&name))
            .await
            .unwrap()
            .unwrap();
        lease.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_waiter_gets_lock_after_release() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let name = unique_name("/muster/locks/test");
        let lock = std::sync::Arc::new(PgAdvisoryLock::new(pool, &fast_retry()));

        let held = lock.acquire(&name).await.unwrap();
        let waiter = tokio::spawn({
            let lock = lock.clone();
            let name = name.clone();
            async move {
                let lease = lock.acquire(&name).await?;
                lease.release().await
            }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        held.release().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
