//! Execution outcomes
//!
//! Every executor run ends in exactly one [`Outcome`]. The dispatcher alone
//! decides what an outcome means for the event (ack, retry, dead-letter).

use river::EventEnvelope;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionClass {
    /// Input or script output failed validation
    Validation,
    /// Provider response did not satisfy the response contract
    Parse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Transient,
    Provider,
}

/// Permanent failure, never retried
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub class: RejectionClass,
    pub reason: String,
    /// Raw provider text for parse rejections
    pub raw_response: Option<String>,
}

/// Failure worth retrying
#[derive(Debug, Clone, PartialEq)]
pub struct Failure {
    pub class: FailureClass,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Published(Vec<EventEnvelope>),
    Rejected(Rejection),
    Failed(Failure),
    Timeout,
}

impl Outcome {
    pub fn validation(reason: impl Into<String>) -> Self {
        Outcome::Rejected(Rejection {
            class: RejectionClass::Validation,
            reason: reason.into(),
            raw_response: None,
        })
    }

    pub fn parse(reason: impl Into<String>, raw_response: impl Into<String>) -> Self {
        Outcome::Rejected(Rejection {
            class: RejectionClass::Parse,
            reason: reason.into(),
            raw_response: Some(raw_response.into()),
        })
    }

    pub fn transient(reason: impl Into<String>) -> Self {
        Outcome::Failed(Failure {
            class: FailureClass::Transient,
            reason: reason.into(),
        })
    }

    pub fn provider(reason: impl Into<String>) -> Self {
        Outcome::Failed(Failure {
            class: FailureClass::Provider,
            reason: reason.into(),
        })
    }

    /// Whether the dispatcher may run the binding again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Outcome::Failed(_) | Outcome::Timeout)
    }

    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Published(_) => "published",
            Outcome::Rejected(r) => match r.class {
                RejectionClass::Validation => "rejected_validation",
                RejectionClass::Parse => "rejected_parse",
            },
            Outcome::Failed(f) => match f.class {
                FailureClass::Transient => "failed_transient",
                FailureClass::Provider => "failed_provider",
            },
            Outcome::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Published(events) => write!(f, "published {} event(s)", events.len()),
            Outcome::Rejected(r) => write!(f, "rejected: {}", r.reason),
            Outcome::Failed(failure) => write!(f, "failed: {}", failure.reason),
            Outcome::Timeout => write!(f, "timed out"),
        }
    }
}
