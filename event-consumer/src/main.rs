//! Consume e-commerce domain events from Kafka into the raw warehouse layer.
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;

use event_consumer::config::Config;
use event_consumer::consumer::EventConsumer;
use event_consumer::error::ConsumerError;
use pipeline_common::dead_letter::DeadLetterSink;
use pipeline_common::health::HealthRegistry;
use pipeline_common::metrics::{serve, setup_metrics_recorder, setup_ops_router};

#[tokio::main]
async fn main() -> Result<(), ConsumerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    // Store connectivity at startup is the one fatal failure mode.
    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect(&config.database_url)
        .await?;

    let liveness = HealthRegistry::new("liveness");
    let handle = liveness.register("consumer".to_owned(), time::Duration::seconds(30));

    let sink = DeadLetterSink::new(pool.clone());
    let consumer = EventConsumer::new(&config, pool, sink, handle)?;

    let recorder_handle = setup_metrics_recorder();
    let router = setup_ops_router(liveness, recorder_handle);
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    consumer.run().await?;

    Ok(())
}
