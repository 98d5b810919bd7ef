//! # Event Envelope
//!
//! The unit of work carried on the River.
//!
//! ## Envelope Fields
//!
//! - `id`: Unique identifier, assigned at ingestion and used for deduplication
//! - `subject`: Hierarchical, `.`-separated topic
//! - `payload`: Schema-free JSON object
//! - `causation_id`: The event that caused this one (`None` for root events)
//! - `correlation_id`: Groups a whole causal chain
//! - `timestamp`: When the event was produced
//! - `delivery_attempt`: Stamped by the River on every delivery (starts at 1)
//! - `hop_count`: Causal distance from the root event
//! - `source`: Producer name (external source, binding, or dispatcher)
//!
//! Derived events get deterministic ids (UUIDv5 over the parent id and a
//! producer-chosen key), so re-running a handler republishes the same ids
//! and an event can never be its own cause.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Producer name stamped on events ingested from outside the engine.
pub const EXTERNAL_SOURCE: &str = "source";

/// Immutable event envelope.
///
/// # Examples
///
/// ```rust
/// use river::EventEnvelope;
/// use serde_json::json;
///
/// let root = EventEnvelope::new("contact.created", json!({"value": 42}));
/// assert_eq!(root.correlation_id, root.id);
///
/// let child = root.derive("score-lead", 0, "lead.scored", json!({"score": 85}));
/// assert_eq!(child.causation_id, Some(root.id));
/// assert_eq!(child.correlation_id, root.correlation_id);
/// assert_eq!(child.hop_count, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique event identifier (deduplication key)
    pub id: Uuid,

    /// Subject the event is published on
    pub subject: String,

    /// Event data
    pub payload: Value,

    /// The event that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,

    /// Shared by every event of one causal chain
    pub correlation_id: Uuid,

    /// When the event was produced
    pub timestamp: DateTime<Utc>,

    /// Delivery counter, owned by the River
    #[serde(default = "first_attempt")]
    pub delivery_attempt: u32,

    /// Causal hops from the root event
    #[serde(default)]
    pub hop_count: u32,

    /// Producer name
    #[serde(default = "external_source")]
    pub source: String,
}

fn first_attempt() -> u32 {
    1
}

fn external_source() -> String {
    EXTERNAL_SOURCE.to_string()
}

impl EventEnvelope {
    /// Create a root event with a fresh id.
    ///
    /// The correlation id of a root event is its own id.
    pub fn new(subject: impl Into<String>, payload: Value) -> Self {
        Self::with_id(Uuid::new_v4(), subject, payload)
    }

    /// Create a root event with an explicit id (replays, tests)
    pub fn with_id(id: Uuid, subject: impl Into<String>, payload: Value) -> Self {
        Self {
            id,
            subject: subject.into(),
            payload,
            causation_id: None,
            correlation_id: id,
            timestamp: Utc::now(),
            delivery_attempt: 1,
            hop_count: 0,
            source: external_source(),
        }
    }

    /// Set the correlation id
    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// Set the producer name
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Derive a child event caused by `self`.
    ///
    /// `producer` and `index` select the deterministic child id; the same
    /// producer emitting the same index for the same parent always gets the
    /// same id.
    pub fn derive(
        &self,
        producer: &str,
        index: usize,
        subject: impl Into<String>,
        payload: Value,
    ) -> Self {
        let key = format!("{producer}:{index}");
        Self {
            id: Uuid::new_v5(&self.id, key.as_bytes()),
            subject: subject.into(),
            payload,
            causation_id: Some(self.id),
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
            delivery_attempt: 1,
            hop_count: self.hop_count.saturating_add(1),
            source: producer.to_string(),
        }
    }

    /// Encode for the wire
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode from the wire
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Validate a raw JSON envelope
///
/// # Validation Rules
///
/// - `id`, `correlation_id`: valid UUIDs
/// - `causation_id`: valid UUID when present, and not equal to `id`
/// - `subject`: non-empty string
/// - `timestamp`: RFC 3339
/// - `payload`: JSON object
pub fn validate_envelope_fields(envelope: &Value) -> Result<(), String> {
    let id = envelope
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid id")?;
    let id = Uuid::parse_str(id).map_err(|_| format!("id must be a UUID, got '{id}'"))?;

    let subject = envelope
        .get("subject")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid subject")?;
    if subject.trim().is_empty() {
        return Err("subject cannot be empty".to_string());
    }

    let correlation_id = envelope
        .get("correlation_id")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid correlation_id")?;
    Uuid::parse_str(correlation_id)
        .map_err(|_| format!("correlation_id must be a UUID, got '{correlation_id}'"))?;

    if let Some(causation) = envelope.get("causation_id").filter(|v| !v.is_null()) {
        let causation = causation.as_str().ok_or("causation_id must be a string")?;
        let causation = Uuid::parse_str(causation)
            .map_err(|_| format!("causation_id must be a UUID, got '{causation}'"))?;
        if causation == id {
            return Err("event cannot be its own cause".to_string());
        }
    }

    let timestamp = envelope
        .get("timestamp")
        .and_then(|v| v.as_str())
        .ok_or("Missing or invalid timestamp")?;
    DateTime::parse_from_rfc3339(timestamp)
        .map_err(|_| format!("timestamp must be RFC 3339, got '{timestamp}'"))?;

    if !envelope.get("payload").is_some_and(Value::is_object) {
        return Err("payload must be an object".to_string());
    }

    Ok(())
}
