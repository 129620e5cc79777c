use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeZone, Utc};
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{ClientConfig, Message};
use sqlx::postgres::PgPool;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, warn};

use pipeline_common::dead_letter::{DeadLetterReason, DeadLetterSink};
use pipeline_common::event::{normalize, BusinessEvent, EventCategory};
use pipeline_common::fingerprint::{compute_fingerprint, ClaimOutcome, FingerprintGuard, GuardError};
use pipeline_common::health::HealthHandle;
use pipeline_common::retry::RetryPolicy;

use crate::config::Config;
use crate::error::{ConsumerError, IngestError};

/// Terminal outcome of one message. An offset is stored only once the
/// message and every earlier message on its partition reached one of these;
/// an unexpected crash before that point leaves the offset unstored and the
/// broker redelivers.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Ingested,
    Duplicate,
    DeadLettered(DeadLetterReason),
}

/// Tracks per-partition completion of concurrently processed messages.
///
/// Tasks finish in any order, but the broker commit position is a single
/// watermark per partition: storing the offset of a late message while an
/// earlier one is still retrying would let auto-commit skip past the
/// earlier one on a crash. Offsets are therefore only released up to the
/// contiguous frontier of terminal outcomes.
#[derive(Default)]
struct OffsetTracker {
    partitions: Mutex<HashMap<(String, i32), PartitionProgress>>,
}

struct PartitionProgress {
    /// Lowest offset that has not reached a terminal outcome yet.
    next_unresolved: i64,
    /// Terminal offsets above the frontier, waiting for the gap to close.
    resolved: BTreeSet<i64>,
}

impl OffsetTracker {
    /// Record that `offset` entered processing. Messages of one partition
    /// are received in offset order, so the first observed offset seeds the
    /// frontier.
    fn begin(&self, topic: &str, partition: i32, offset: i64) {
        self.partitions
            .lock()
            .expect("offset tracker lock poisoned")
            .entry((topic.to_owned(), partition))
            .or_insert(PartitionProgress {
                next_unresolved: offset,
                resolved: BTreeSet::new(),
            });
    }

    /// Mark `offset` terminal. Returns the highest offset safe to store,
    /// if this completion moved the contiguous frontier.
    fn resolve(&self, topic: &str, partition: i32, offset: i64) -> Option<i64> {
        let mut partitions = self.partitions.lock().expect("offset tracker lock poisoned");
        let progress = partitions.get_mut(&(topic.to_owned(), partition))?;

        progress.resolved.insert(offset);
        let mut advanced = false;
        while progress.resolved.remove(&progress.next_unresolved) {
            progress.next_unresolved += 1;
            advanced = true;
        }

        advanced.then(|| progress.next_unresolved - 1)
    }
}

/// The durable subscription loop: decodes messages, drives them through the
/// fingerprint guard, writes accepted events to the raw layer and routes the
/// rest to the dead-letter sink, all under a bounded in-flight budget.
pub struct EventConsumer {
    consumer: Arc<StreamConsumer>,
    pool: PgPool,
    sink: Arc<DeadLetterSink>,
    retry_policy: RetryPolicy,
    max_in_flight: usize,
    liveness: HealthHandle,
}

impl EventConsumer {
    pub fn new(
        config: &Config,
        pool: PgPool,
        sink: DeadLetterSink,
        liveness: HealthHandle,
    ) -> Result<Self, ConsumerError> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.kafka_hosts)
            .set("group.id", &config.kafka_consumer_group)
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "true")
            // Offsets are stored by us, one message at a time, only after a
            // terminal outcome; auto-commit then persists stored offsets.
            .set("enable.auto.offset.store", "false");

        if config.kafka_tls {
            client_config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }

        let consumer: StreamConsumer = client_config.create()?;
        let topics = config.topics();
        let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&topic_refs)?;

        let retry_policy = RetryPolicy::new(
            config.retry_policy.max_attempts,
            config.retry_policy.backoff_coefficient,
            config.retry_policy.initial_interval.0,
            Some(config.retry_policy.maximum_interval.0),
        );

        Ok(Self {
            consumer: Arc::new(consumer),
            pool,
            sink: Arc::new(sink),
            retry_policy,
            max_in_flight: config.max_in_flight,
            liveness,
        })
    }

    /// Run this consumer to continuously process messages as they arrive.
    pub async fn run(&self) -> Result<(), ConsumerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_in_flight));
        let tracker = Arc::new(OffsetTracker::default());
        info!(budget = self.max_in_flight, "consumer ready");

        loop {
            self.liveness.report_healthy();

            // Take a slot before taking a message, so the number of
            // unacknowledged messages never exceeds the budget.
            let permit = acquire_in_flight_slot(&semaphore, self.max_in_flight).await;

            let message = self.consumer.recv().await?;
            let routing_key = message.topic().to_owned();
            let partition = message.partition();
            let offset = message.offset();
            let message_timestamp = message
                .timestamp()
                .to_millis()
                .and_then(|ms| Utc.timestamp_millis_opt(ms).single());
            let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

            tracker.begin(&routing_key, partition, offset);

            let consumer = self.consumer.clone();
            let tracker = tracker.clone();
            let pool = self.pool.clone();
            let sink = self.sink.clone();
            let retry_policy = self.retry_policy;

            tokio::spawn(async move {
                let outcome = process_message(
                    &pool,
                    &sink,
                    &retry_policy,
                    &routing_key,
                    &payload,
                    message_timestamp,
                )
                .await;

                debug!(routing_key, offset, ?outcome, "message reached terminal outcome");

                // Acknowledge up to the contiguous frontier of terminal
                // outcomes; a still-retrying earlier message holds it back.
                if let Some(stored) = tracker.resolve(&routing_key, partition, offset) {
                    if let Err(e) = consumer.store_offset(&routing_key, partition, stored) {
                        error!("failed to store offset for {routing_key}/{partition}@{stored}: {e}");
                    }
                }

                drop(permit);
            });
        }
    }
}

/// Wait for a slot in the in-flight budget before taking the next message.
async fn acquire_in_flight_slot(semaphore: &Arc<Semaphore>, budget: usize) -> OwnedSemaphorePermit {
    metrics::gauge!("consumer_in_flight_saturation_percent")
        .set(1f64 - semaphore.available_permits() as f64 / budget as f64);

    semaphore
        .clone()
        .acquire_owned()
        .await
        .expect("semaphore has been closed")
}

/// Drive a single message to a terminal outcome. Never returns an error:
/// malformed input and exhausted retries both resolve to a dead-letter entry
/// so the message can be acknowledged without loss of information.
pub async fn process_message(
    pool: &PgPool,
    sink: &DeadLetterSink,
    retry_policy: &RetryPolicy,
    routing_key: &str,
    payload: &[u8],
    message_timestamp: Option<DateTime<Utc>>,
) -> Outcome {
    let category = EventCategory::from_routing_key(routing_key);
    let labels = [("category", category.as_str())];

    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(routing_key, "invalid payload: {e}");
            return dead_letter(sink, routing_key, payload, DeadLetterReason::MalformedPayload)
                .await;
        }
    };

    let fingerprint = compute_fingerprint(routing_key, &value);
    let event = normalize(routing_key, message_timestamp, &value, &fingerprint);

    let mut attempt = 1u32;
    loop {
        match ingest_once(pool, &fingerprint, &event).await {
            Ok(ClaimOutcome::Claimed) => {
                metrics::counter!("events_ingested_total", &labels).increment(1);
                return Outcome::Ingested;
            }
            Ok(ClaimOutcome::AlreadyClaimed) => {
                debug!(routing_key, fingerprint, "duplicate event, skipping");
                metrics::counter!("events_duplicate_total", &labels).increment(1);
                return Outcome::Duplicate;
            }
            Err(e) => {
                if retry_policy.is_exhausted(attempt) {
                    error!(routing_key, attempt, "ingest failed, dead-lettering: {e}");
                    return dead_letter(sink, routing_key, payload, e.dead_letter_reason()).await;
                }
                warn!(routing_key, attempt, "ingest failed, will retry: {e}");
                tokio::time::sleep(retry_policy.retry_interval(attempt)).await;
                attempt += 1;
            }
        }
    }
}

/// One ingest attempt: claim the fingerprint and write the raw event inside
/// a single transaction, so a crash between the two cannot strand a claim
/// without its raw row.
async fn ingest_once(
    pool: &PgPool,
    fingerprint: &str,
    event: &BusinessEvent,
) -> Result<ClaimOutcome, IngestError> {
    let mut tx = pool.begin().await.map_err(IngestError::Claim)?;

    let claim = FingerprintGuard::claim(&mut *tx, fingerprint, &event.source)
        .await
        .map_err(|GuardError::Store(e)| IngestError::Claim(e))?;

    if claim == ClaimOutcome::AlreadyClaimed {
        tx.commit().await.map_err(IngestError::Claim)?;
        return Ok(ClaimOutcome::AlreadyClaimed);
    }

    sqlx::query(
        r#"
INSERT INTO raw_events
    (fingerprint, event_id, event_type, event_timestamp, session_id, source,
     service, correlation_id, user_id, entity_id, payload, received_at)
VALUES
    ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, NOW())
        "#,
    )
    .bind(fingerprint)
    .bind(event.event_id)
    .bind(&event.event_type)
    .bind(event.event_timestamp)
    .bind(&event.session_id)
    .bind(&event.source)
    .bind(&event.service)
    .bind(&event.correlation_id)
    .bind(&event.user_id)
    .bind(&event.entity_id)
    .bind(sqlx::types::Json(&event.payload))
    .execute(&mut *tx)
    .await
    .map_err(IngestError::Persist)?;

    tx.commit().await.map_err(IngestError::Persist)?;

    Ok(ClaimOutcome::Claimed)
}

/// Record a dead letter. The sink must never block the consumer: if even the
/// dead-letter write fails we log and acknowledge anyway, since the entry is
/// diagnostic rather than authoritative.
async fn dead_letter(
    sink: &DeadLetterSink,
    routing_key: &str,
    payload: &[u8],
    reason: DeadLetterReason,
) -> Outcome {
    if let Err(e) = sink.record(routing_key, payload, reason).await {
        error!(routing_key, "failed to record dead letter: {e}");
    }
    Outcome::DeadLettered(reason)
}
