use async_trait::async_trait;
use sqlx::postgres::PgPool;

use super::{RecomputeWindow, StageError, StageName, StageTransform};

/// Cleaning reads raw events received inside the window, normalizes them
/// into `cleaned_events`, restitches `cleaned_sessions` for every session
/// the window touched, and rebuilds those sessions' ordered `page_sequences`
/// from their page-view events. Every write is a keyed upsert or a rebuild
/// scoped to the touched sessions, so rerunning over an overlapping window
/// recomputes instead of duplicating.
pub struct CleaningStage;

impl CleaningStage {
    fn query_error(error: sqlx::Error) -> StageError {
        StageError::Query {
            stage: StageName::Cleaning.as_str(),
            error,
        }
    }
}

#[async_trait]
impl StageTransform for CleaningStage {
    fn name(&self) -> StageName {
        StageName::Cleaning
    }

    async fn run(&self, pool: &PgPool, window: &RecomputeWindow) -> Result<u64, StageError> {
        let events = sqlx::query(
            r#"
INSERT INTO cleaned_events
    (event_id, event_type, event_timestamp, time_bucket, session_id, user_id, entity_id)
SELECT
    event_id,
    lower(trim(event_type)),
    event_timestamp,
    (event_timestamp AT TIME ZONE 'UTC')::date,
    session_id,
    user_id,
    entity_id
FROM raw_events
WHERE received_at >= $1 AND received_at < $2
ON CONFLICT (event_id) DO UPDATE SET
    event_type = EXCLUDED.event_type,
    event_timestamp = EXCLUDED.event_timestamp,
    time_bucket = EXCLUDED.time_bucket,
    session_id = EXCLUDED.session_id,
    user_id = EXCLUDED.user_id,
    entity_id = EXCLUDED.entity_id
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .execute(pool)
        .await
        .map_err(Self::query_error)?;

        // Sessions are stitched from all of their cleaned events, not just
        // the windowed ones, so a session spanning the window edge keeps
        // consistent bounds.
        let sessions = sqlx::query(
            r#"
INSERT INTO cleaned_sessions
    (session_id, user_id, start_time, end_time, duration_seconds, event_count)
SELECT
    session_id,
    MAX(user_id),
    MIN(event_timestamp),
    MAX(event_timestamp),
    GREATEST(0, EXTRACT(EPOCH FROM (MAX(event_timestamp) - MIN(event_timestamp))))::bigint,
    COUNT(*)
FROM cleaned_events
WHERE session_id IN (
    SELECT DISTINCT session_id
    FROM raw_events
    WHERE received_at >= $1 AND received_at < $2
)
GROUP BY session_id
ON CONFLICT (session_id) DO UPDATE SET
    user_id = EXCLUDED.user_id,
    start_time = EXCLUDED.start_time,
    end_time = EXCLUDED.end_time,
    duration_seconds = EXCLUDED.duration_seconds,
    event_count = EXCLUDED.event_count
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .execute(pool)
        .await
        .map_err(Self::query_error)?;

        // Step numbers shift whenever a session gains an event, so the
        // touched sessions' sequences are rebuilt rather than upserted.
        sqlx::query(
            r#"
DELETE FROM page_sequences
WHERE session_id IN (
    SELECT DISTINCT session_id
    FROM raw_events
    WHERE received_at >= $1 AND received_at < $2
)
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .execute(pool)
        .await
        .map_err(Self::query_error)?;

        let pages = sqlx::query(
            r#"
INSERT INTO page_sequences (session_id, step_number, page_url, event_timestamp)
SELECT
    session_id,
    ROW_NUMBER() OVER (PARTITION BY session_id ORDER BY event_timestamp, event_id),
    payload->>'page_url',
    event_timestamp
FROM raw_events
WHERE lower(trim(event_type)) = 'page_view'
  AND payload->>'page_url' IS NOT NULL
  AND session_id IN (
      SELECT DISTINCT session_id
      FROM raw_events
      WHERE received_at >= $1 AND received_at < $2
  )
            "#,
        )
        .bind(window.start)
        .bind(window.end)
        .execute(pool)
        .await
        .map_err(Self::query_error)?;

        Ok(events.rows_affected() + sessions.rows_affected() + pages.rows_affected())
    }
}
