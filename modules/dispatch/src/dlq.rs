//! Dead-letter diagnostics
//!
//! An execution that cannot succeed ends as one diagnostic event on the
//! dead-letter subject. The diagnostic is caused by the original event, so
//! the causal chain stays traceable.

use river::EventEnvelope;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::outcome::{Outcome, RejectionClass};

/// Producer name stamped on dead-letter envelopes
pub const DEAD_LETTER_SOURCE: &str = "dispatcher";

pub const DEFAULT_DEAD_LETTER_SUBJECT: &str = "river.dead_letter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterClass {
    /// Input or output failed validation
    Rejected,
    /// Provider answer failed its response contract
    ParseRejected,
    /// Transient failures past the attempt ceiling
    RetriesExhausted,
    /// Causal chain deeper than the hop ceiling
    HopLimit,
    /// Broker redelivered past the delivery ceiling
    RedeliveryLimit,
}

impl DeadLetterClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterClass::Rejected => "rejected",
            DeadLetterClass::ParseRejected => "parse_rejected",
            DeadLetterClass::RetriesExhausted => "retries_exhausted",
            DeadLetterClass::HopLimit => "hop_limit",
            DeadLetterClass::RedeliveryLimit => "redelivery_limit",
        }
    }
}

/// Dead-letter payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub original_event_id: Uuid,
    pub original_subject: String,
    pub binding: String,
    pub reason: String,
    pub class: DeadLetterClass,
    /// Executions attempted before giving up
    pub attempts: u32,
    pub correlation_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
}

impl DeadLetter {
    pub fn new(
        original: &EventEnvelope,
        binding: &str,
        class: DeadLetterClass,
        reason: impl Into<String>,
        attempts: u32,
    ) -> Self {
        Self {
            original_event_id: original.id,
            original_subject: original.subject.clone(),
            binding: binding.to_string(),
            reason: reason.into(),
            class,
            attempts,
            correlation_id: original.correlation_id,
            raw_response: None,
        }
    }

    /// Diagnostic for a terminal (non-published) outcome
    pub fn from_outcome(
        original: &EventEnvelope,
        binding: &str,
        outcome: &Outcome,
        attempts: u32,
    ) -> Self {
        match outcome {
            Outcome::Rejected(rejection) => {
                let class = match rejection.class {
                    RejectionClass::Validation => DeadLetterClass::Rejected,
                    RejectionClass::Parse => DeadLetterClass::ParseRejected,
                };
                let mut letter = Self::new(original, binding, class, &rejection.reason, attempts);
                letter.raw_response = rejection.raw_response.clone();
                letter
            }
            other => Self::new(
                original,
                binding,
                DeadLetterClass::RetriesExhausted,
                other.to_string(),
                attempts,
            ),
        }
    }

    /// The envelope to publish on `subject`.
    ///
    /// Its id is derived from the original event and binding, so publishing
    /// the same diagnostic twice yields the same id.
    pub fn to_envelope(&self, original: &EventEnvelope, subject: &str) -> EventEnvelope {
        let payload = serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "original_event_id": self.original_event_id,
                "binding": self.binding,
                "reason": self.reason,
            })
        });
        original
            .derive(&format!("dead-letter/{}", self.binding), 0, subject, payload)
            .with_source(DEAD_LETTER_SOURCE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn diagnostic_links_back_to_original() {
        let original = EventEnvelope::new("crm.contact.created", json!({"value": 42}));
        let letter = DeadLetter::from_outcome(&original, "score", &Outcome::Timeout, 3);
        assert_eq!(letter.class, DeadLetterClass::RetriesExhausted);
        assert_eq!(letter.attempts, 3);

        let envelope = letter.to_envelope(&original, DEFAULT_DEAD_LETTER_SUBJECT);
        assert_eq!(envelope.subject, "river.dead_letter");
        assert_eq!(envelope.causation_id, Some(original.id));
        assert_eq!(envelope.correlation_id, original.correlation_id);
        assert_eq!(envelope.source, DEAD_LETTER_SOURCE);
        assert_eq!(envelope.payload["original_event_id"], json!(original.id));
        assert_eq!(envelope.payload["class"], "retries_exhausted");
        assert_eq!(envelope.payload["attempts"], 3);
        assert!(envelope.payload.get("raw_response").is_none());

        let again = letter.to_envelope(&original, DEFAULT_DEAD_LETTER_SUBJECT);
        assert_eq!(envelope.id, again.id);
    }

    #[test]
    fn parse_rejection_carries_raw_response() {
        let original = EventEnvelope::new("lead.scored", json!({"score": 85}));
        let letter = DeadLetter::from_outcome(
            &original,
            "qualify",
            &Outcome::parse("no option matched", "maybe"),
            1,
        );
        assert_eq!(letter.class, DeadLetterClass::ParseRejected);
        assert_eq!(letter.raw_response.as_deref(), Some("maybe"));
    }
}
