//! TreeHouse: deterministic script handlers
//!
//! A TreeHouse binding runs one script against the event payload. The script
//! sees only its declared inputs, so the same payload and script always
//! produce the same output. Scripts run on the blocking pool under a hard
//! deadline; the runtime aborts the VM itself once the deadline passes.

use async_trait::async_trait;
use river::EventEnvelope;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::{Emitter, Executor, ExecutorKind};
use crate::outcome::Outcome;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("script not found: {0}")]
    NotFound(String),

    #[error("script path not allowed: {0}")]
    InvalidPath(String),

    #[error("script failed to compile: {0}")]
    Compile(String),

    #[error("script raised an error: {0}")]
    Runtime(String),

    #[error("script returned an unsupported value: {0}")]
    InvalidOutput(String),

    #[error("script exceeded its deadline")]
    Timeout,

    #[error("script exceeded its instruction budget")]
    BudgetExhausted,

    #[error("script exceeded its memory limit ({0} bytes)")]
    MemoryExhausted(usize),
}

/// A loaded script
#[derive(Debug, Clone)]
pub struct Script {
    pub path: String,
    pub source: Arc<str>,
}

impl Script {
    pub fn new(path: impl Into<String>, source: impl Into<Arc<str>>) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
        }
    }
}

/// Where script sources come from
pub trait ScriptStore: Send + Sync {
    fn load(&self, path: &str) -> Result<Script, ScriptError>;
}

/// Scripts on disk, relative to a root directory
#[derive(Debug, Clone)]
pub struct FsScriptStore {
    root: PathBuf,
}

impl FsScriptStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ScriptStore for FsScriptStore {
    fn load(&self, path: &str) -> Result<Script, ScriptError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if path.is_empty() || escapes {
            return Err(ScriptError::InvalidPath(path.to_string()));
        }

        let full = self.root.join(relative);
        let source = std::fs::read_to_string(&full)
            .map_err(|e| ScriptError::NotFound(format!("{}: {e}", full.display())))?;
        Ok(Script::new(path, source))
    }
}

/// Scripts held in memory (tests, embedded configs)
#[derive(Debug, Clone, Default)]
pub struct MemoryScriptStore {
    scripts: HashMap<String, Arc<str>>,
}

impl MemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(mut self, path: impl Into<String>, source: &str) -> Self {
        self.scripts.insert(path.into(), Arc::from(source));
        self
    }
}

impl ScriptStore for MemoryScriptStore {
    fn load(&self, path: &str) -> Result<Script, ScriptError> {
        self.scripts
            .get(path)
            .map(|source| Script::new(path, source.clone()))
            .ok_or_else(|| ScriptError::NotFound(path.to_string()))
    }
}

/// Everything a script may read
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptInput {
    pub payload: Value,
    /// `id`, `subject`, `correlation_id` and `causation_id` of the event
    pub event: Value,
}

impl ScriptInput {
    pub fn from_event(event: &EventEnvelope) -> Self {
        Self {
            payload: event.payload.clone(),
            event: json!({
                "id": event.id.to_string(),
                "subject": event.subject,
                "correlation_id": event.correlation_id.to_string(),
                "causation_id": event.causation_id.map(|id| id.to_string()),
            }),
        }
    }
}

/// Interpreter heap ceiling when a binding does not configure one
pub const DEFAULT_MAX_MEMORY: usize = 64 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct ScriptLimits {
    pub deadline: Instant,
    pub max_instructions: u64,
    /// Heap ceiling in bytes, 0 for none
    pub max_memory: usize,
}

/// What a script asked for
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptOutput {
    /// Zero or more outbound payloads
    Emit(Vec<Value>),
    /// Script classified its own failure as transient
    Retry(String),
    /// Script rejected the input
    Reject(String),
}

/// Sandboxed interpreter contract. Implementations must not perform I/O.
pub trait ScriptRuntime: Send + Sync {
    /// Compile without running
    fn check(&self, script: &Script) -> Result<(), ScriptError>;

    /// Run to completion, aborting at `limits`
    fn execute(
        &self,
        script: &Script,
        input: &ScriptInput,
        limits: &ScriptLimits,
    ) -> Result<ScriptOutput, ScriptError>;
}

/// Deterministic executor for one binding
pub struct TreeHouse {
    runtime: Arc<dyn ScriptRuntime>,
    script: Script,
    timeout: Duration,
    max_instructions: u64,
    max_memory: usize,
    emitter: Emitter,
}

impl TreeHouse {
    pub fn new(
        runtime: Arc<dyn ScriptRuntime>,
        script: Script,
        timeout: Duration,
        max_instructions: u64,
        emitter: Emitter,
    ) -> Self {
        Self {
            runtime,
            script,
            timeout,
            max_instructions,
            max_memory: DEFAULT_MAX_MEMORY,
            emitter,
        }
    }

    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }
}

#[async_trait]
impl Executor for TreeHouse {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Deterministic
    }

    async fn run(&self, event: &EventEnvelope) -> Outcome {
        let runtime = self.runtime.clone();
        let script = self.script.clone();
        let input = ScriptInput::from_event(event);
        let limits = ScriptLimits {
            deadline: Instant::now() + self.timeout,
            max_instructions: self.max_instructions,
            max_memory: self.max_memory,
        };

        let worker =
            tokio::task::spawn_blocking(move || runtime.execute(&script, &input, &limits));

        let result = match tokio::time::timeout(self.timeout, worker).await {
            Err(_) => {
                tracing::warn!(
                    binding = %self.emitter.binding(),
                    script = %self.script.path,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Script abandoned after deadline"
                );
                return Outcome::Timeout;
            }
            Ok(Err(join_err)) => {
                return Outcome::transient(format!("script worker failed: {join_err}"));
            }
            Ok(Ok(result)) => result,
        };

        match result {
            Ok(ScriptOutput::Emit(payloads)) => self.emitter.emit(event, payloads),
            Ok(ScriptOutput::Retry(reason)) => Outcome::transient(reason),
            Ok(ScriptOutput::Reject(reason)) => Outcome::validation(reason),
            Err(ScriptError::Timeout) | Err(ScriptError::BudgetExhausted) => Outcome::Timeout,
            Err(e) => Outcome::validation(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;

    struct Fixed(Result<ScriptOutput, ScriptError>);

    impl ScriptRuntime for Fixed {
        fn check(&self, _script: &Script) -> Result<(), ScriptError> {
            Ok(())
        }

        fn execute(
            &self,
            _script: &Script,
            _input: &ScriptInput,
            _limits: &ScriptLimits,
        ) -> Result<ScriptOutput, ScriptError> {
            self.0.clone()
        }
    }

    /// Echoes the limits it was handed back as a payload
    struct EchoLimits;

    impl ScriptRuntime for EchoLimits {
        fn check(&self, _script: &Script) -> Result<(), ScriptError> {
            Ok(())
        }

        fn execute(
            &self,
            _script: &Script,
            _input: &ScriptInput,
            limits: &ScriptLimits,
        ) -> Result<ScriptOutput, ScriptError> {
            Ok(ScriptOutput::Emit(vec![json!({
                "max_instructions": limits.max_instructions,
                "max_memory": limits.max_memory,
            })]))
        }
    }

    struct Panics;

    impl ScriptRuntime for Panics {
        fn check(&self, _script: &Script) -> Result<(), ScriptError> {
            Ok(())
        }

        fn execute(
            &self,
            _script: &Script,
            _input: &ScriptInput,
            _limits: &ScriptLimits,
        ) -> Result<ScriptOutput, ScriptError> {
            panic!("interpreter bug")
        }
    }

    fn treehouse(runtime: impl ScriptRuntime + 'static) -> TreeHouse {
        TreeHouse::new(
            Arc::new(runtime),
            Script::new("score.lua", "return nil"),
            Duration::from_secs(1),
            1_000_000,
            Emitter::new("score", Template::parse_subject("lead.scored").unwrap()),
        )
    }

    fn event() -> EventEnvelope {
        EventEnvelope::new("crm.contact.created", json!({"value": 42}))
    }

    #[tokio::test]
    async fn maps_script_outputs_to_outcomes() {
        let published = treehouse(Fixed(Ok(ScriptOutput::Emit(vec![json!({"score": 84})]))))
            .run(&event())
            .await;
        assert!(matches!(published, Outcome::Published(ref e) if e.len() == 1));

        let empty = treehouse(Fixed(Ok(ScriptOutput::Emit(vec![])))).run(&event()).await;
        assert_eq!(empty, Outcome::Published(vec![]));

        let retry = treehouse(Fixed(Ok(ScriptOutput::Retry("later".into()))))
            .run(&event())
            .await;
        assert_eq!(retry, Outcome::transient("later"));

        let reject = treehouse(Fixed(Ok(ScriptOutput::Reject("no email".into()))))
            .run(&event())
            .await;
        assert_eq!(reject, Outcome::validation("no email"));

        let runtime_error = treehouse(Fixed(Err(ScriptError::Runtime("boom".into()))))
            .run(&event())
            .await;
        assert!(matches!(runtime_error, Outcome::Rejected(_)));

        let budget = treehouse(Fixed(Err(ScriptError::BudgetExhausted)))
            .run(&event())
            .await;
        assert_eq!(budget, Outcome::Timeout);
    }

    #[tokio::test]
    async fn limits_reach_the_runtime() {
        let outcome = treehouse(EchoLimits).run(&event()).await;
        let Outcome::Published(events) = outcome else {
            panic!("expected Published, got {outcome:?}");
        };
        assert_eq!(
            events[0].payload,
            json!({"max_instructions": 1_000_000, "max_memory": DEFAULT_MAX_MEMORY})
        );

        let outcome = treehouse(EchoLimits).with_max_memory(4096).run(&event()).await;
        let Outcome::Published(events) = outcome else {
            panic!("expected Published, got {outcome:?}");
        };
        assert_eq!(events[0].payload["max_memory"], json!(4096));
    }

    #[tokio::test]
    async fn memory_exhaustion_is_rejected() {
        let outcome = treehouse(Fixed(Err(ScriptError::MemoryExhausted(4096))))
            .run(&event())
            .await;
        assert!(matches!(
            outcome,
            Outcome::Rejected(ref r) if r.class == crate::outcome::RejectionClass::Validation
        ));
    }

    #[tokio::test]
    async fn worker_panic_is_transient() {
        let outcome = treehouse(Panics).run(&event()).await;
        assert!(outcome.is_retryable());
        assert!(!matches!(outcome, Outcome::Timeout));
    }

    #[test]
    fn input_exposes_event_identity() {
        let event = event();
        let input = ScriptInput::from_event(&event);
        assert_eq!(input.payload, json!({"value": 42}));
        assert_eq!(input.event["id"], json!(event.id.to_string()));
        assert_eq!(input.event["subject"], json!("crm.contact.created"));
        assert_eq!(input.event["causation_id"], Value::Null);
    }

    #[test]
    fn fs_store_stays_under_root() {
        let store = FsScriptStore::new(std::env::temp_dir());
        assert!(matches!(
            store.load("../etc/passwd"),
            Err(ScriptError::InvalidPath(_))
        ));
        assert!(matches!(
            store.load("/etc/passwd"),
            Err(ScriptError::InvalidPath(_))
        ));
        assert!(matches!(
            store.load("definitely-missing-script.lua"),
            Err(ScriptError::NotFound(_))
        ));
    }

    #[test]
    fn fs_store_reads_relative_scripts() {
        let dir = std::env::temp_dir().join(format!("treehouse-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(dir.join("leads")).unwrap();
        std::fs::write(dir.join("leads/score.lua"), "return nil").unwrap();

        let script = FsScriptStore::new(&dir).load("leads/score.lua").unwrap();
        assert_eq!(&*script.source, "return nil");

        std::fs::remove_dir_all(dir).unwrap();
    }
}
