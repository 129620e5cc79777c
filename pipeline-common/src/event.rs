use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Closed set of routing-key categories we know how to handle, resolved once
/// at decode time. Anything unrecognized falls back to `Other` and is still
/// ingested as a generic business event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventCategory {
    Order,
    Payment,
    Review,
    Cart,
    Checkout,
    Behavior,
    Other,
}

impl EventCategory {
    pub fn from_routing_key(routing_key: &str) -> Self {
        match routing_key.split('.').next().unwrap_or("") {
            "order" => EventCategory::Order,
            "payment" => EventCategory::Payment,
            "review" => EventCategory::Review,
            "cart" => EventCategory::Cart,
            "checkout" => EventCategory::Checkout,
            "behavior" | "tracking" => EventCategory::Behavior,
            _ => EventCategory::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Order => "order",
            EventCategory::Payment => "payment",
            EventCategory::Review => "review",
            EventCategory::Cart => "cart",
            EventCategory::Checkout => "checkout",
            EventCategory::Behavior => "behavior",
            EventCategory::Other => "other",
        }
    }
}

/// A business event normalized from an inbound broker message, ready to be
/// written to the raw layer. Field extraction is best-effort: producers do
/// not share a strict schema, so we look for conventional field names in the
/// payload and its nested containers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusinessEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub event_timestamp: DateTime<Utc>,
    pub session_id: String,
    pub source: String,
    pub service: String,
    pub correlation_id: Option<String>,
    pub user_id: Option<String>,
    pub entity_id: Option<String>,
    pub payload: Value,
}

/// Containers that producers conventionally nest event fields under.
const NESTED_KEYS: [&str; 4] = ["meta", "data", "payload", "event"];

fn candidate_objects(payload: &Value) -> Vec<&serde_json::Map<String, Value>> {
    let mut out = Vec::new();
    if let Some(map) = payload.as_object() {
        out.push(map);
        for key in NESTED_KEYS {
            if let Some(nested) = map.get(key).and_then(Value::as_object) {
                out.push(nested);
            }
        }
    }
    out
}

fn first_nonempty_str(payload: &Value, keys: &[&str]) -> Option<String> {
    for map in candidate_objects(payload) {
        for key in keys {
            let Some(value) = map.get(*key) else {
                continue;
            };
            let s = match value {
                Value::String(s) => s.trim().to_owned(),
                Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if !s.is_empty() {
                return Some(s);
            }
        }
    }
    None
}

fn parse_iso_utc(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn parse_epoch_utc(v: f64) -> Option<DateTime<Utc>> {
    // Values above 1e12 are taken as epoch milliseconds.
    let secs = if v > 1e12 { v / 1000.0 } else { v };
    Utc.timestamp_opt(secs as i64, ((secs.fract()) * 1e9) as u32)
        .single()
}

fn best_effort_timestamp(payload: &Value, message_timestamp: Option<DateTime<Utc>>) -> DateTime<Utc> {
    const KEYS: [&str; 9] = [
        "event_timestamp",
        "eventTimestamp",
        "timestamp",
        "ts",
        "occurred_at",
        "occurredAt",
        "created_at",
        "createdAt",
        "time",
    ];

    for map in candidate_objects(payload) {
        for key in KEYS {
            match map.get(key) {
                Some(Value::String(s)) => {
                    if let Some(dt) = parse_iso_utc(s) {
                        return dt;
                    }
                }
                Some(Value::Number(n)) => {
                    if let Some(dt) = n.as_f64().and_then(parse_epoch_utc) {
                        return dt;
                    }
                }
                _ => {}
            }
        }
    }

    message_timestamp.unwrap_or_else(Utc::now)
}

fn best_effort_user_id(payload: &Value) -> Option<String> {
    let uid = first_nonempty_str(
        payload,
        &["user_id", "userId", "uid", "customer_id", "customerId"],
    )?;
    // Raw emails and oversized identifiers are not usable as stable user keys.
    if uid.contains('@') || uid.len() > 64 {
        return None;
    }
    Some(uid)
}

fn best_effort_entity_id(payload: &Value) -> Option<String> {
    first_nonempty_str(
        payload,
        &[
            "entity_id",
            "entityId",
            "order_id",
            "orderId",
            "payment_id",
            "paymentId",
            "review_id",
            "reviewId",
            "product_id",
            "productId",
            "cart_id",
            "cartId",
            "id",
        ],
    )
}

fn best_effort_service(payload: &Value) -> String {
    let svc = first_nonempty_str(
        payload,
        &["service", "service_name", "serviceName", "producer", "source"],
    );
    truncate(&svc.unwrap_or_else(|| "unknown".to_owned()), 64)
}

fn best_effort_event_type(payload: &Value, routing_key: &str) -> String {
    let et = first_nonempty_str(
        payload,
        &["event_type", "eventType", "type", "name", "event", "action"],
    );
    let fallback = if routing_key.is_empty() {
        "unknown"
    } else {
        routing_key
    };
    truncate(&et.unwrap_or_else(|| fallback.to_owned()), 100)
}

fn best_effort_correlation_id(payload: &Value) -> Option<String> {
    let cid = first_nonempty_str(
        payload,
        &[
            "correlation_id",
            "correlationId",
            "request_id",
            "requestId",
            "trace_id",
            "traceId",
        ],
    )?;
    Some(truncate(&cid, 64))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_owned()
    } else {
        s.chars().take(max).collect()
    }
}

/// Normalize a decoded payload into a `BusinessEvent`.
///
/// `session_fallback` is used when the payload carries neither a session nor
/// a correlation identifier; the consumer passes a fingerprint-derived value
/// so redeliveries of the same message stitch into the same session.
pub fn normalize(
    routing_key: &str,
    message_timestamp: Option<DateTime<Utc>>,
    payload: &Value,
    session_fallback: &str,
) -> BusinessEvent {
    let correlation_id = best_effort_correlation_id(payload);
    let session_id = first_nonempty_str(payload, &["session_id", "sessionId"])
        .or_else(|| correlation_id.clone())
        .unwrap_or_else(|| session_fallback.to_owned());

    BusinessEvent {
        event_id: Uuid::now_v7(),
        event_type: best_effort_event_type(payload, routing_key),
        event_timestamp: best_effort_timestamp(payload, message_timestamp),
        session_id: truncate(&session_id, 100),
        source: "kafka".to_owned(),
        service: best_effort_service(payload),
        correlation_id,
        user_id: best_effort_user_id(payload),
        entity_id: best_effort_entity_id(payload).map(|e| truncate(&e, 100)),
        payload: payload.clone(),
    }
}
