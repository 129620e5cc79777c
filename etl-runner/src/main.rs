//! Scheduled medallion transforms over the warehouse, one instance at a time.
use std::time::Duration;

use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use etl_runner::config::Config;
use etl_runner::error::EtlError;
use etl_runner::orchestrator::{Orchestrator, RunStatus};
use pipeline_common::health::HealthRegistry;
use pipeline_common::metrics::{serve, setup_metrics_recorder, setup_ops_router};

#[tokio::main]
async fn main() -> Result<(), EtlError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    // Store connectivity at startup is the one fatal failure mode.
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await?;

    let orchestrator = Orchestrator::new(pool, &config);

    if config.run_once {
        let summary = orchestrator.run_once().await;
        info!(
            status = summary.status.as_str(),
            rows_affected = summary.rows_affected(),
            "one-shot run finished",
        );
        return match summary.status {
            RunStatus::Failed => Err(EtlError::RunFailed),
            RunStatus::Success | RunStatus::Skipped => Ok(()),
        };
    }

    let liveness = HealthRegistry::new("liveness");
    let interval = Duration::from_secs(config.run_interval_secs);
    // The runner is healthy as long as cycles keep starting on schedule.
    let handle = liveness.register(
        "orchestrator".to_owned(),
        time::Duration::seconds(config.run_interval_secs as i64 * 2),
    );

    let recorder_handle = setup_metrics_recorder();
    let router = setup_ops_router(liveness, recorder_handle);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    orchestrator.run_watch(interval, handle).await;

    Ok(())
}
