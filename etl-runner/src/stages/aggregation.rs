use async_trait::async_trait;
use sqlx::postgres::PgPool;

use super::{RecomputeWindow, StageError, StageName, StageTransform};

/// Aggregation reads the cleaned layer and upserts daily business metrics:
/// per-type event counts and funnel stage transitions, both keyed by metric
/// name and day bucket. The recompute set is the window's day range plus
/// every day bucket touched by raw events received inside the window, so a
/// late arrival whose event time predates the window still reaches the
/// aggregates. Metric values come from the cleaned layer only; the raw
/// layer is consulted just to discover touched buckets.
pub struct AggregationStage;

impl AggregationStage {
    fn query_error(error: sqlx::Error) -> StageError {
        StageError::Query {
            stage: StageName::Aggregation.as_str(),
            error,
        }
    }
}

#[async_trait]
impl StageTransform for AggregationStage {
    fn name(&self) -> StageName {
        StageName::Aggregation
    }

    async fn run(&self, pool: &PgPool, window: &RecomputeWindow) -> Result<u64, StageError> {
        let start_bucket = window.start.date_naive();
        let end_bucket = window.end.date_naive();

        let counts = sqlx::query(
            r#"
INSERT INTO metrics_daily (metric_date, metric, value)
SELECT
    time_bucket,
    'events_total.' || event_type,
    COUNT(*)
FROM cleaned_events
WHERE time_bucket >= $1 AND time_bucket <= $2
   OR time_bucket IN (
        SELECT DISTINCT (event_timestamp AT TIME ZONE 'UTC')::date
        FROM raw_events
        WHERE received_at >= $3 AND received_at < $4
   )
GROUP BY time_bucket, event_type
ON CONFLICT (metric_date, metric) DO UPDATE SET
    value = EXCLUDED.value
            "#,
        )
        .bind(start_bucket)
        .bind(end_bucket)
        .bind(window.start)
        .bind(window.end)
        .execute(pool)
        .await
        .map_err(Self::query_error)?;

        let funnel = sqlx::query(
            r#"
INSERT INTO funnel_daily
    (metric_date, sessions, cart_sessions, checkout_sessions, purchase_sessions)
SELECT
    time_bucket,
    COUNT(DISTINCT session_id),
    COUNT(DISTINCT session_id) FILTER (WHERE event_type LIKE 'cart%'),
    COUNT(DISTINCT session_id) FILTER (WHERE event_type LIKE 'checkout%'),
    COUNT(DISTINCT session_id)
        FILTER (WHERE event_type LIKE 'purchase%' OR event_type LIKE 'order%')
FROM cleaned_events
WHERE time_bucket >= $1 AND time_bucket <= $2
   OR time_bucket IN (
        SELECT DISTINCT (event_timestamp AT TIME ZONE 'UTC')::date
        FROM raw_events
        WHERE received_at >= $3 AND received_at < $4
   )
GROUP BY time_bucket
ON CONFLICT (metric_date) DO UPDATE SET
    sessions = EXCLUDED.sessions,
    cart_sessions = EXCLUDED.cart_sessions,
    checkout_sessions = EXCLUDED.checkout_sessions,
    purchase_sessions = EXCLUDED.purchase_sessions
            "#,
        )
        .bind(start_bucket)
        .bind(end_bucket)
        .bind(window.start)
        .bind(window.end)
        .execute(pool)
        .await
        .map_err(Self::query_error)?;

        Ok(counts.rows_affected() + funnel.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, Utc};
    use uuid::Uuid;

    async fn seed_cleaned_event(db: &PgPool, session_id: &str, event_type: &str) {
        let now = Utc::now();
        sqlx::query(
            r#"
INSERT INTO cleaned_events
    (event_id, event_type, event_timestamp, time_bucket, session_id, user_id, entity_id)
VALUES ($1, $2, $3, ($3 AT TIME ZONE 'UTC')::date, $4, NULL, NULL)
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(event_type)
        .bind(now)
        .bind(session_id)
        .execute(db)
        .await
        .unwrap();
    }

    async fn snapshot(db: &PgPool) -> (Vec<(String, i64)>, Vec<(NaiveDate, i64, i64, i64, i64)>) {
        let metrics: Vec<(String, i64)> =
            sqlx::query_as("SELECT metric, value FROM metrics_daily ORDER BY metric")
                .fetch_all(db)
                .await
                .unwrap();
        let funnel: Vec<(NaiveDate, i64, i64, i64, i64)> = sqlx::query_as(
            "SELECT metric_date, sessions, cart_sessions, checkout_sessions, purchase_sessions
             FROM funnel_daily ORDER BY metric_date",
        )
        .fetch_all(db)
        .await
        .unwrap();
        (metrics, funnel)
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_aggregation_counts_and_funnel(db: PgPool) {
        // s-1 goes all the way through the funnel, s-2 stops at cart,
        // s-3 only browses.
        seed_cleaned_event(&db, "s-1", "page_view").await;
        seed_cleaned_event(&db, "s-1", "cart_action").await;
        seed_cleaned_event(&db, "s-1", "checkout").await;
        seed_cleaned_event(&db, "s-1", "order_created").await;
        seed_cleaned_event(&db, "s-2", "page_view").await;
        seed_cleaned_event(&db, "s-2", "cart_action").await;
        seed_cleaned_event(&db, "s-3", "page_view").await;

        let stage = AggregationStage;
        let window = RecomputeWindow::covering_last(Duration::hours(1));
        stage.run(&db, &window).await.unwrap();

        let (metrics, funnel) = snapshot(&db).await;

        assert!(metrics.contains(&("events_total.page_view".to_owned(), 3)));
        assert!(metrics.contains(&("events_total.cart_action".to_owned(), 2)));
        assert!(metrics.contains(&("events_total.order_created".to_owned(), 1)));

        assert_eq!(funnel.len(), 1);
        let (_, sessions, carts, checkouts, purchases) = funnel[0];
        assert_eq!(sessions, 3);
        assert_eq!(carts, 2);
        assert_eq!(checkouts, 1);
        assert_eq!(purchases, 1);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_late_arriving_event_is_aggregated_into_its_day(db: PgPool) {
        // Received now, but the event happened well before the window.
        let late_timestamp = Utc::now() - Duration::days(10);
        let event_id = Uuid::now_v7();
        sqlx::query(
            r#"
INSERT INTO raw_events
    (fingerprint, event_id, event_type, event_timestamp, session_id, source,
     service, correlation_id, user_id, entity_id, payload, received_at)
VALUES ($1, $2, 'order_created', $3, 's-late', 'kafka', 'orders',
        NULL, NULL, NULL, '{}'::jsonb, NOW())
            "#,
        )
        .bind(format!("{:0>64}", event_id.simple().to_string()))
        .bind(event_id)
        .bind(late_timestamp)
        .execute(&db)
        .await
        .unwrap();

        let window = RecomputeWindow::covering_last(Duration::hours(24));
        crate::stages::cleaning::CleaningStage
            .run(&db, &window)
            .await
            .unwrap();
        AggregationStage.run(&db, &window).await.unwrap();

        let late_bucket = (late_timestamp).date_naive();
        let count: Option<i64> = sqlx::query_scalar(
            "SELECT value FROM metrics_daily
             WHERE metric_date = $1 AND metric = 'events_total.order_created'",
        )
        .bind(late_bucket)
        .fetch_optional(&db)
        .await
        .unwrap();
        assert_eq!(count, Some(1));

        let purchases: Option<i64> =
            sqlx::query_scalar("SELECT purchase_sessions FROM funnel_daily WHERE metric_date = $1")
                .bind(late_bucket)
                .fetch_optional(&db)
                .await
                .unwrap();
        assert_eq!(purchases, Some(1));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_rerun_with_no_new_data_is_identical(db: PgPool) {
        seed_cleaned_event(&db, "s-1", "page_view").await;
        seed_cleaned_event(&db, "s-1", "checkout").await;

        let stage = AggregationStage;
        let window = RecomputeWindow::covering_last(Duration::hours(1));

        stage.run(&db, &window).await.unwrap();
        let first = snapshot(&db).await;

        stage.run(&db, &window).await.unwrap();
        let second = snapshot(&db).await;

        assert_eq!(first, second);
    }
}
