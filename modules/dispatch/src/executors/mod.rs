//! Executors
//!
//! A binding is resolved into one concrete [`Executor`] when its routing
//! generation is loaded. Executors never return errors: every run ends in an
//! [`Outcome`], and the dispatcher decides what happens next.

pub mod contract;
pub mod lua_runtime;
pub mod nim;
pub mod provider;
pub mod treehouse;

use async_trait::async_trait;
use river::EventEnvelope;
use serde_json::Value;

use crate::outcome::Outcome;
use crate::template::Template;

pub use contract::ResponseContract;
pub use lua_runtime::LuaRuntime;
pub use nim::Nim;
pub use provider::{InferenceProvider, InferenceRequest, OpenAiProvider, ProviderError};
pub use treehouse::{
    FsScriptStore, MemoryScriptStore, Script, ScriptError, ScriptInput, ScriptLimits,
    ScriptOutput, ScriptRuntime, ScriptStore, TreeHouse,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorKind {
    Deterministic,
    Decision,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Deterministic => "deterministic",
            ExecutorKind::Decision => "decision",
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    /// Run the handler once against an event
    async fn run(&self, event: &EventEnvelope) -> Outcome;
}

/// Turns handler output payloads into outbound envelopes for one binding
#[derive(Debug, Clone)]
pub struct Emitter {
    binding: String,
    publishes: Template,
}

impl Emitter {
    pub fn new(binding: impl Into<String>, publishes: Template) -> Self {
        Self {
            binding: binding.into(),
            publishes,
        }
    }

    pub fn binding(&self) -> &str {
        &self.binding
    }

    /// Build child envelopes of `parent`, one per payload.
    ///
    /// Payloads must be JSON objects and must carry every field the
    /// `publishes` template references.
    pub fn emit(&self, parent: &EventEnvelope, payloads: Vec<Value>) -> Outcome {
        let mut events = Vec::with_capacity(payloads.len());
        for (index, payload) in payloads.into_iter().enumerate() {
            if !payload.is_object() {
                return Outcome::validation(format!(
                    "outbound payload #{index} is not an object"
                ));
            }
            let subject = match self.publishes.render_subject(&payload) {
                Ok(subject) => subject,
                Err(e) => {
                    return Outcome::validation(format!(
                        "cannot render subject '{}' for payload #{index}: {e}",
                        self.publishes
                    ))
                }
            };
            events.push(parent.derive(&self.binding, index, subject, payload));
        }
        Outcome::Published(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emitter(publishes: &str) -> Emitter {
        Emitter::new("score-lead", Template::parse_subject(publishes).unwrap())
    }

    #[test]
    fn emits_children_with_rendered_subjects() {
        let parent = EventEnvelope::new("crm.contact.created", json!({"value": 42}));
        let outcome = emitter("lead.{{.tier}}").emit(
            &parent,
            vec![json!({"tier": "gold"}), json!({"tier": "silver"})],
        );

        let Outcome::Published(events) = outcome else {
            panic!("expected Published, got {outcome:?}");
        };
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].subject, "lead.gold");
        assert_eq!(events[1].subject, "lead.silver");
        assert!(events.iter().all(|e| e.causation_id == Some(parent.id)));
        assert_ne!(events[0].id, events[1].id);
    }

    #[test]
    fn child_ids_are_stable_across_runs() {
        let parent = EventEnvelope::new("crm.contact.created", json!({}));
        let first = emitter("lead.scored").emit(&parent, vec![json!({"score": 1})]);
        let second = emitter("lead.scored").emit(&parent, vec![json!({"score": 1})]);
        match (first, second) {
            (Outcome::Published(a), Outcome::Published(b)) => assert_eq!(a[0].id, b[0].id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn rejects_non_objects_and_missing_subject_fields() {
        let parent = EventEnvelope::new("crm.contact.created", json!({}));
        assert!(matches!(
            emitter("lead.scored").emit(&parent, vec![json!(5)]),
            Outcome::Rejected(_)
        ));
        assert!(matches!(
            emitter("lead.{{.tier}}").emit(&parent, vec![json!({"score": 5})]),
            Outcome::Rejected(_)
        ));
    }

    #[test]
    fn dotted_value_cannot_widen_the_published_subject() {
        let parent = EventEnvelope::new("crm.contact.created", json!({}));
        let outcome = emitter("lead.{{.tier}}").emit(&parent, vec![json!({"tier": "a.b"})]);
        assert!(matches!(
            outcome,
            Outcome::Rejected(ref r) if r.class == crate::outcome::RejectionClass::Validation
        ));
    }
}
