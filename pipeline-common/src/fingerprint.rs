use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Executor, Postgres};
use thiserror::Error;

/// Errors from attempting to claim a fingerprint. A duplicate claim is not an
/// error; it is reported through `ClaimOutcome`.
#[derive(Error, Debug)]
pub enum GuardError {
    #[error("fingerprint claim failed with: {0}")]
    Store(#[from] sqlx::Error),
}

/// Result of a claim attempt. `AlreadyClaimed` is the expected outcome for
/// broker redeliveries and overlapping consumers.
#[derive(Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    AlreadyClaimed,
}

/// Serialize a JSON value with object keys sorted recursively and no
/// whitespace. Two payloads that are structurally equal always produce the
/// same string regardless of the key order the producer emitted.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Compute the deterministic identity of a logical event.
///
/// The fingerprint covers the routing key and the canonicalized payload only.
/// Broker-assigned delivery metadata (message id, delivery timestamp,
/// partition offsets) is deliberately excluded so a redelivery of the same
/// message hashes identically. Producers are expected to include an event
/// timestamp and stable identifiers in the payload, which is what
/// discriminates genuinely distinct events of the same type.
pub fn compute_fingerprint(routing_key: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(routing_key.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_json(payload).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Hash arbitrary bytes to the same 64-char lowercase hex format, used to key
/// dead-letter entries by their raw payload.
pub fn hash_payload(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Atomically claims fingerprints against the durable store. Correctness
/// under concurrent claimants rests entirely on the primary key constraint
/// of `event_fingerprints`.
pub struct FingerprintGuard;

impl FingerprintGuard {
    /// Attempt to claim `fingerprint` for this caller. Takes any Postgres
    /// executor so the claim can share a transaction with the raw-layer
    /// insert that depends on it.
    pub async fn claim<'c, E>(
        executor: E,
        fingerprint: &str,
        source: &str,
    ) -> Result<ClaimOutcome, GuardError>
    where
        E: Executor<'c, Database = Postgres>,
    {
        let result = sqlx::query(
            r#"
INSERT INTO event_fingerprints (fingerprint, claimed_at, source)
VALUES ($1, NOW(), $2)
ON CONFLICT (fingerprint) DO NOTHING
            "#,
        )
        .bind(fingerprint)
        .bind(source)
        .execute(executor)
        .await?;

        if result.rows_affected() == 1 {
            Ok(ClaimOutcome::Claimed)
        } else {
            Ok(ClaimOutcome::AlreadyClaimed)
        }
    }
}
