use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use sqlx::postgres::PgPool;
use sqlx::{Connection, PgConnection};
use tracing::{info, warn};

const ACQUIRE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of a lock acquisition attempt. `Busy` is the expected contention
/// outcome when another orchestrator instance is mid-run.
pub enum LockOutcome {
    Held(EtlLock),
    Busy,
}

/// A named cross-process mutual-exclusion token backed by a Postgres
/// advisory lock held on a dedicated session.
///
/// The session is the lock's scope: if the holding process crashes or the
/// future holding this guard is dropped mid-run, the connection closes and
/// the server releases the lock, so a dead holder cannot wedge the pipeline.
pub struct EtlLock {
    conn: PgConnection,
    key: i64,
    name: String,
}

/// Derive a stable 64-bit advisory-lock key from the lock name.
fn lock_key(name: &str) -> i64 {
    let digest = Sha256::digest(name.as_bytes());
    i64::from_be_bytes(digest[..8].try_into().expect("digest is at least 8 bytes"))
}

impl EtlLock {
    /// Try to acquire the named lock, polling until `timeout` elapses.
    /// The acquisition timeout is separate from the lock's lifetime.
    pub async fn acquire(
        pool: &PgPool,
        name: &str,
        timeout: Duration,
    ) -> Result<LockOutcome, sqlx::Error> {
        // Detached from the pool: this session exists only to hold the lock.
        let mut conn = pool.acquire().await?.detach();
        let key = lock_key(name);
        let deadline = Instant::now() + timeout;

        loop {
            let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
                .bind(key)
                .fetch_one(&mut conn)
                .await?;

            if locked {
                info!(name, "etl lock acquired");
                return Ok(LockOutcome::Held(EtlLock {
                    conn,
                    key,
                    name: name.to_owned(),
                }));
            }

            if Instant::now() >= deadline {
                conn.close().await.ok();
                return Ok(LockOutcome::Busy);
            }

            tokio::time::sleep(ACQUIRE_POLL_INTERVAL).await;
        }
    }

    /// Release the lock and tear down its session. Skipping this (on panic
    /// or cancellation) is safe: dropping the guard closes the connection
    /// and the server releases the lock either way.
    pub async fn release(self) {
        let EtlLock {
            mut conn,
            key,
            name,
        } = self;

        if let Err(e) = sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(key)
            .execute(&mut conn)
            .await
        {
            warn!(name, "failed to release etl lock: {e}");
        } else {
            info!(name, "etl lock released");
        }

        conn.close().await.ok();
    }
}
