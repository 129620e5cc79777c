use std::time::{Duration, Instant};

use chrono::Utc;
use sqlx::postgres::PgPool;
use tracing::{error, info, warn};
use uuid::Uuid;

use pipeline_common::health::HealthHandle;

use crate::config::Config;
use crate::lock::{EtlLock, LockOutcome};
use crate::stages::aggregation::AggregationStage;
use crate::stages::cleaning::CleaningStage;
use crate::stages::{RecomputeWindow, StageName, StageTransform};

const LOCK_NAME: &str = "analytics_etl_lock";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Failed,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Failed => "failed",
            RunStatus::Skipped => "skipped",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StageReport {
    pub stage: StageName,
    pub rows_affected: u64,
}

/// What one orchestrator cycle did, for the log line and the run record.
#[derive(Debug)]
pub struct RunSummary {
    pub status: RunStatus,
    pub stages: Vec<StageReport>,
    pub elapsed: Duration,
}

impl RunSummary {
    fn skipped(elapsed: Duration) -> Self {
        Self {
            status: RunStatus::Skipped,
            stages: Vec::new(),
            elapsed,
        }
    }

    pub fn rows_affected(&self) -> u64 {
        self.stages.iter().map(|s| s.rows_affected).sum()
    }
}

/// Runs the enabled stage transforms in dependency order over the recompute
/// window, under the cross-process lock. Cleaning always precedes
/// Aggregation; a stage failure aborts the remaining stages of that run and
/// leaves partial progress in place for the next idempotent cycle.
pub struct Orchestrator {
    pool: PgPool,
    stages: Vec<Box<dyn StageTransform>>,
    window: chrono::Duration,
    lock_timeout: Duration,
    run_type: String,
}

impl Orchestrator {
    pub fn new(pool: PgPool, config: &Config) -> Self {
        let mut stages: Vec<Box<dyn StageTransform>> = Vec::new();
        if config.enable_cleaning {
            stages.push(Box::new(CleaningStage));
        }
        if config.enable_aggregation {
            stages.push(Box::new(AggregationStage));
        }

        let run_type = if stages.is_empty() {
            "disabled".to_owned()
        } else {
            stages
                .iter()
                .map(|s| s.name().as_str())
                .collect::<Vec<_>>()
                .join("+")
        };

        Self {
            pool,
            stages,
            window: chrono::Duration::hours(config.window_hours),
            lock_timeout: config.lock_timeout.0,
            run_type,
        }
    }

    /// Execute one cycle. `Busy` from the lock means another instance is
    /// mid-run and this cycle is skipped entirely; queueing behind it would
    /// only recompute the same window twice.
    pub async fn run_once(&self) -> RunSummary {
        let started = Instant::now();

        if self.stages.is_empty() {
            info!("all stages disabled, nothing to run");
            return RunSummary::skipped(started.elapsed());
        }

        let lock = match EtlLock::acquire(&self.pool, LOCK_NAME, self.lock_timeout).await {
            Ok(LockOutcome::Held(lock)) => lock,
            Ok(LockOutcome::Busy) => {
                info!("another etl run is in progress, skipping this cycle");
                return RunSummary::skipped(started.elapsed());
            }
            Err(e) => {
                error!("failed to contact the warehouse for the etl lock: {e}");
                return RunSummary {
                    status: RunStatus::Failed,
                    stages: Vec::new(),
                    elapsed: started.elapsed(),
                };
            }
        };

        let summary = self.run_stages(started).await;
        lock.release().await;

        metrics::counter!("etl_runs_total", &[("status", summary.status.as_str())]).increment(1);
        metrics::histogram!("etl_run_duration_seconds").record(summary.elapsed.as_secs_f64());

        summary
    }

    async fn run_stages(&self, started: Instant) -> RunSummary {
        let run_id = match self.start_run().await {
            Ok(run_id) => Some(run_id),
            Err(e) => {
                // The run record is bookkeeping; losing it does not justify
                // skipping the actual transforms.
                warn!("failed to record etl run start: {e}");
                None
            }
        };

        let window = RecomputeWindow::covering_last(self.window);
        let mut reports = Vec::new();
        let mut failure: Option<String> = None;

        for stage in &self.stages {
            info!(stage = stage.name().as_str(), "running stage");
            match stage.run(&self.pool, &window).await {
                Ok(rows_affected) => {
                    info!(stage = stage.name().as_str(), rows_affected, "stage finished");
                    reports.push(StageReport {
                        stage: stage.name(),
                        rows_affected,
                    });
                }
                Err(e) => {
                    // Abort the remaining stages: Aggregation must not run
                    // over a window Cleaning has not covered this run.
                    error!(stage = stage.name().as_str(), "stage failed: {e}");
                    failure = Some(e.to_string());
                    break;
                }
            }
        }

        let status = if failure.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Success
        };
        let summary = RunSummary {
            status,
            stages: reports,
            elapsed: started.elapsed(),
        };

        if let Some(run_id) = run_id {
            if let Err(e) = self.finish_run(run_id, &summary, failure.as_deref()).await {
                warn!("failed to finalize etl run record {run_id}: {e}");
            }
        }

        summary
    }

    async fn start_run(&self) -> Result<Uuid, sqlx::Error> {
        sqlx::query_scalar(
            r#"
INSERT INTO etl_runs (run_type, status, started_at)
VALUES ($1, 'running', NOW())
RETURNING run_id
            "#,
        )
        .bind(&self.run_type)
        .fetch_one(&self.pool)
        .await
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        summary: &RunSummary,
        error_message: Option<&str>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
UPDATE etl_runs
SET finished_at = NOW(),
    status = $2,
    rows_affected = $3,
    error_message = $4
WHERE run_id = $1
  AND finished_at IS NULL
            "#,
        )
        .bind(run_id)
        .bind(summary.status.as_str())
        .bind(summary.rows_affected() as i64)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Watch mode: loop `run_once` on a fixed interval. Never returns under
    /// normal operation.
    pub async fn run_watch(&self, interval: Duration, liveness: HealthHandle) {
        let mut ticker = tokio::time::interval(interval);

        loop {
            ticker.tick().await;
            liveness.report_healthy();

            let summary = self.run_once().await;
            info!(
                status = summary.status.as_str(),
                stages = summary.stages.len(),
                rows_affected = summary.rows_affected(),
                elapsed_ms = summary.elapsed.as_millis() as u64,
                "etl cycle finished at {}",
                Utc::now().to_rfc3339(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvMsDuration;
    use chrono::{Duration as ChronoDuration, Utc};
    use uuid::Uuid;

    fn test_config(cleaning: bool, aggregation: bool) -> Config {
        Config {
            host: "127.0.0.1".to_owned(),
            port: 0,
            database_url: String::new(),
            max_pg_connections: 5,
            run_interval_secs: 300,
            window_hours: 24,
            enable_cleaning: cleaning,
            enable_aggregation: aggregation,
            lock_timeout: EnvMsDuration(std::time::Duration::from_millis(50)),
            run_once: true,
        }
    }

    async fn seed_raw_event(db: &sqlx::PgPool, session_id: &str, event_type: &str) {
        let event_id = Uuid::now_v7();
        sqlx::query(
            r#"
INSERT INTO raw_events
    (fingerprint, event_id, event_type, event_timestamp, session_id, source,
     service, correlation_id, user_id, entity_id, payload, received_at)
VALUES ($1, $2, $3, $4, $5, 'kafka', 'orders', NULL, NULL, NULL, '{}'::jsonb, NOW())
            "#,
        )
        .bind(format!("{:0>64}", event_id.simple().to_string()))
        .bind(event_id)
        .bind(event_type)
        .bind(Utc::now() - ChronoDuration::minutes(5))
        .bind(session_id)
        .execute(db)
        .await
        .unwrap();
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_run_once_advances_both_layers(db: sqlx::PgPool) {
        seed_raw_event(&db, "s-1", "order_created").await;
        seed_raw_event(&db, "s-1", "checkout").await;

        let orchestrator = Orchestrator::new(db.clone(), &test_config(true, true));
        let summary = orchestrator.run_once().await;

        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.stages.len(), 2);
        assert_eq!(summary.stages[0].stage, StageName::Cleaning);
        assert_eq!(summary.stages[1].stage, StageName::Aggregation);
        assert!(summary.rows_affected() > 0);

        let cleaned: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cleaned_events")
            .fetch_one(&db)
            .await
            .unwrap();
        let metrics: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics_daily")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(cleaned, 2);
        assert!(metrics > 0);

        let (status, rows): (String, i64) = sqlx::query_as(
            "SELECT status, rows_affected FROM etl_runs ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(status, "success");
        assert_eq!(rows as u64, summary.rows_affected());
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_busy_lock_skips_the_cycle_without_writes(db: sqlx::PgPool) {
        seed_raw_event(&db, "s-1", "order_created").await;

        let held = match EtlLock::acquire(&db, LOCK_NAME, std::time::Duration::from_millis(10))
            .await
            .unwrap()
        {
            LockOutcome::Held(lock) => lock,
            LockOutcome::Busy => panic!("lock should be free"),
        };

        let orchestrator = Orchestrator::new(db.clone(), &test_config(true, true));
        let summary = orchestrator.run_once().await;

        assert_eq!(summary.status, RunStatus::Skipped);
        let cleaned: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cleaned_events")
            .fetch_one(&db)
            .await
            .unwrap();
        assert_eq!(cleaned, 0);

        held.release().await;
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_stage_failure_aborts_the_run_and_releases_the_lock(db: sqlx::PgPool) {
        seed_raw_event(&db, "s-1", "order_created").await;

        // Force the cleaning stage to fail mid-run.
        sqlx::query("DROP TABLE cleaned_sessions")
            .execute(&db)
            .await
            .unwrap();

        let orchestrator = Orchestrator::new(db.clone(), &test_config(true, true));
        let summary = orchestrator.run_once().await;

        assert_eq!(summary.status, RunStatus::Failed);
        // Aggregation never ran.
        assert!(summary.stages.is_empty());

        let (status, error): (String, Option<String>) = sqlx::query_as(
            "SELECT status, error_message FROM etl_runs ORDER BY started_at DESC LIMIT 1",
        )
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(status, "failed");
        assert!(error.unwrap().contains("cleaning"));

        // The lock was released on the failure path.
        assert!(matches!(
            EtlLock::acquire(&db, LOCK_NAME, std::time::Duration::from_millis(10))
                .await
                .unwrap(),
            LockOutcome::Held(_)
        ));
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_aggregation_alone_covers_historical_cleaned_data(db: sqlx::PgPool) {
        // Already-cleaned data may be aggregated without re-cleaning.
        sqlx::query(
            r#"
INSERT INTO cleaned_events
    (event_id, event_type, event_timestamp, time_bucket, session_id, user_id, entity_id)
VALUES ($1, 'page_view', NOW(), (NOW() AT TIME ZONE 'UTC')::date, 's-1', NULL, NULL)
            "#,
        )
        .bind(Uuid::now_v7())
        .execute(&db)
        .await
        .unwrap();

        let orchestrator = Orchestrator::new(db.clone(), &test_config(false, true));
        let summary = orchestrator.run_once().await;

        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.stages.len(), 1);
        assert_eq!(summary.stages[0].stage, StageName::Aggregation);

        let metrics: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM metrics_daily")
            .fetch_one(&db)
            .await
            .unwrap();
        assert!(metrics > 0);
    }
}
