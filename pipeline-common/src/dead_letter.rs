use sqlx::postgres::PgPool;
use thiserror::Error;

use crate::fingerprint::hash_payload;

#[derive(Error, Debug)]
pub enum DeadLetterError {
    #[error("dead letter upsert failed with: {0}")]
    Store(#[from] sqlx::Error),
}

/// Why a message was routed to the dead-letter sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The payload could not be decoded; structurally invalid input cannot
    /// become valid, so these are never retried.
    MalformedPayload,
    /// The fingerprint claim kept failing after exhausting retries.
    ClaimFailed,
    /// The raw-layer insert kept failing after exhausting retries.
    PersistFailed,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterReason::MalformedPayload => "malformed_payload",
            DeadLetterReason::ClaimFailed => "claim_failed",
            DeadLetterReason::PersistFailed => "persist_failed",
        }
    }
}

/// Append-only record of messages that could not be processed. Entries are
/// keyed by (payload hash, reason): re-encountering the same failure bumps
/// `attempt_count` instead of duplicating rows. Nothing here ever feeds back
/// into the raw layer automatically.
pub struct DeadLetterSink {
    pool: PgPool,
}

impl DeadLetterSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn record(
        &self,
        routing_key: &str,
        payload: &[u8],
        reason: DeadLetterReason,
    ) -> Result<(), DeadLetterError> {
        let payload_hash = hash_payload(payload);
        let body = String::from_utf8_lossy(payload);

        sqlx::query(
            r#"
INSERT INTO dead_letter_events
    (payload_hash, reason, routing_key, payload, attempt_count, first_seen_at, last_seen_at)
VALUES
    ($1, $2, $3, $4, 1, NOW(), NOW())
ON CONFLICT (payload_hash, reason) DO UPDATE SET
    attempt_count = dead_letter_events.attempt_count + 1,
    last_seen_at = NOW()
            "#,
        )
        .bind(&payload_hash)
        .bind(reason.as_str())
        .bind(routing_key)
        .bind(body.as_ref())
        .execute(&self.pool)
        .await?;

        metrics::counter!("events_dead_lettered_total", &[("reason", reason.as_str())])
            .increment(1);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[sqlx::test(migrations = "../migrations")]
    async fn test_repeated_failures_increment_attempt_count(db: PgPool) {
        let sink = DeadLetterSink::new(db.clone());
        let payload = b"{not json";

        sink.record("order.created", payload, DeadLetterReason::MalformedPayload)
            .await
            .unwrap();
        sink.record("order.created", payload, DeadLetterReason::MalformedPayload)
            .await
            .unwrap();
        sink.record("order.created", payload, DeadLetterReason::MalformedPayload)
            .await
            .unwrap();

        let (count, attempts): (i64, i32) = sqlx::query_as(
            "SELECT COUNT(*), MAX(attempt_count) FROM dead_letter_events",
        )
        .fetch_one(&db)
        .await
        .unwrap();

        assert_eq!(count, 1);
        assert_eq!(attempts, 3);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_distinct_reasons_keep_distinct_rows(db: PgPool) {
        let sink = DeadLetterSink::new(db.clone());
        let payload = br#"{"order_id": "o-1"}"#;

        sink.record("order.created", payload, DeadLetterReason::ClaimFailed)
            .await
            .unwrap();
        sink.record("order.created", payload, DeadLetterReason::PersistFailed)
            .await
            .unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM dead_letter_events")
            .fetch_one(&db)
            .await
            .unwrap();

        assert_eq!(count, 2);
    }
}
