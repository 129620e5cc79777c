use pipeline_common::dead_letter::DeadLetterReason;
use thiserror::Error;

/// Errors that terminate the consumer loop. Routine data problems never end
/// up here; they resolve to a dead-letter entry instead.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("failed to connect to the warehouse: {0}")]
    Database(#[from] sqlx::Error),
}

/// A transient store failure during one ingest attempt, tagged with the
/// phase it happened in so exhausted retries dead-letter with the right
/// reason.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("fingerprint claim failed: {0}")]
    Claim(sqlx::Error),
    #[error("raw event insert failed: {0}")]
    Persist(sqlx::Error),
}

impl IngestError {
    pub fn dead_letter_reason(&self) -> DeadLetterReason {
        match self {
            IngestError::Claim(_) => DeadLetterReason::ClaimFailed,
            IngestError::Persist(_) => DeadLetterReason::PersistFailed,
        }
    }
}
