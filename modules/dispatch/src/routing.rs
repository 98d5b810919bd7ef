//! Routing table
//!
//! A [`ConfigSnapshot`] is validated and resolved into an immutable
//! [`RoutingTable`] generation. Every binding gets its concrete executor at
//! load time. [`RoutingHandle`] serves the current generation and swaps in a
//! new one atomically on reload; callers that already hold a generation keep
//! using it until they drop it.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use river::subject::{matches_pattern, patterns_overlap, validate_pattern};

use crate::executors::{
    Emitter, Executor, ExecutorKind, InferenceProvider, Nim, ResponseContract, ScriptError,
    ScriptRuntime, ScriptStore, TreeHouse,
};
use crate::executors::treehouse::DEFAULT_MAX_MEMORY;
use crate::template::Template;

// ============================================================================
// Configuration snapshot
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub bindings: Vec<BindingConfig>,
}

impl ConfigSnapshot {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    pub name: String,
    pub subscribes: String,
    pub publishes: String,
    /// Allow publishing onto a subject this binding also subscribes to
    #[serde(default)]
    pub reentrant: bool,
    pub handler: HandlerConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandlerConfig {
    Deterministic {
        script: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
    Decision {
        prompt: String,
        contract: ResponseContract,
        #[serde(default)]
        system: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        reparse_retries: u32,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot parse bindings: {0}")]
    Parse(String),

    #[error("binding name cannot be empty")]
    EmptyName,

    #[error("duplicate binding name '{0}'")]
    DuplicateBinding(String),

    #[error("binding '{binding}': invalid subscription: {reason}")]
    InvalidSubscription { binding: String, reason: String },

    #[error("binding '{binding}': invalid publishes template: {reason}")]
    InvalidPublishes { binding: String, reason: String },

    #[error("binding '{binding}' publishes '{publishes}' which its own subscription '{subscribes}' matches; mark it reentrant to allow this")]
    SelfTrigger {
        binding: String,
        subscribes: String,
        publishes: String,
    },

    #[error("binding '{binding}': {source}")]
    Script {
        binding: String,
        #[source]
        source: ScriptError,
    },

    #[error("binding '{binding}': invalid prompt template: {reason}")]
    InvalidPrompt { binding: String, reason: String },

    #[error("binding '{binding}': invalid response contract: {reason}")]
    InvalidContract { binding: String, reason: String },

    #[error("binding '{binding}' is a decision binding but no inference provider is configured")]
    ProviderUnavailable { binding: String },
}

// ============================================================================
// Handler environment
// ============================================================================

#[derive(Debug, Clone, Copy)]
pub struct HandlerDefaults {
    pub script_timeout: Duration,
    pub inference_timeout: Duration,
    pub max_instructions: u64,
    pub max_memory_bytes: usize,
}

impl Default for HandlerDefaults {
    fn default() -> Self {
        Self {
            script_timeout: Duration::from_secs(2),
            inference_timeout: Duration::from_secs(30),
            max_instructions: 50_000_000,
            max_memory_bytes: DEFAULT_MAX_MEMORY,
        }
    }
}

/// Everything needed to turn handler references into executors
#[derive(Clone)]
pub struct HandlerEnv {
    pub scripts: Arc<dyn ScriptStore>,
    pub runtime: Arc<dyn ScriptRuntime>,
    pub provider: Option<Arc<dyn InferenceProvider>>,
    pub defaults: HandlerDefaults,
}

impl HandlerEnv {
    pub fn new(scripts: Arc<dyn ScriptStore>, runtime: Arc<dyn ScriptRuntime>) -> Self {
        Self {
            scripts,
            runtime,
            provider: None,
            defaults: HandlerDefaults::default(),
        }
    }

    pub fn with_provider(mut self, provider: Arc<dyn InferenceProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_defaults(mut self, defaults: HandlerDefaults) -> Self {
        self.defaults = defaults;
        self
    }
}

// ============================================================================
// Bindings and tables
// ============================================================================

/// A validated binding with its resolved executor
pub struct Binding {
    pub name: String,
    pub subscribes: String,
    pub publishes: Template,
    pub reentrant: bool,
    pub executor: Arc<dyn Executor>,
}

impl Binding {
    pub fn kind(&self) -> ExecutorKind {
        self.executor.kind()
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("name", &self.name)
            .field("subscribes", &self.subscribes)
            .field("publishes", &self.publishes.source())
            .field("reentrant", &self.reentrant)
            .field("kind", &self.kind())
            .finish()
    }
}

/// One immutable routing generation
#[derive(Debug)]
pub struct RoutingTable {
    generation: u64,
    bindings: Vec<Arc<Binding>>,
}

impl RoutingTable {
    /// Validate a snapshot and resolve every binding's executor
    pub fn load(snapshot: &ConfigSnapshot, env: &HandlerEnv) -> Result<Self, ConfigError> {
        Self::build(snapshot, env, 1)
    }

    /// A table with no bindings
    pub fn empty() -> Self {
        Self {
            generation: 0,
            bindings: Vec::new(),
        }
    }

    fn build(
        snapshot: &ConfigSnapshot,
        env: &HandlerEnv,
        generation: u64,
    ) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        let mut bindings = Vec::with_capacity(snapshot.bindings.len());

        for config in &snapshot.bindings {
            if config.name.trim().is_empty() {
                return Err(ConfigError::EmptyName);
            }
            if !names.insert(config.name.as_str()) {
                return Err(ConfigError::DuplicateBinding(config.name.clone()));
            }
            bindings.push(Arc::new(build_binding(config, env)?));
        }

        Ok(Self {
            generation,
            bindings,
        })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn bindings(&self) -> &[Arc<Binding>] {
        &self.bindings
    }

    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Bindings whose subscription matches `subject`, in configuration order
    pub fn resolve(&self, subject: &str) -> Vec<Arc<Binding>> {
        self.bindings
            .iter()
            .filter(|binding| matches_pattern(subject, &binding.subscribes))
            .cloned()
            .collect()
    }
}

fn build_binding(config: &BindingConfig, env: &HandlerEnv) -> Result<Binding, ConfigError> {
    let name = config.name.clone();

    validate_pattern(&config.subscribes).map_err(|reason| ConfigError::InvalidSubscription {
        binding: name.clone(),
        reason,
    })?;

    let publishes =
        Template::parse_subject(&config.publishes).map_err(|e| ConfigError::InvalidPublishes {
            binding: name.clone(),
            reason: e.to_string(),
        })?;

    if !config.reentrant && patterns_overlap(&config.subscribes, &publishes.as_pattern()) {
        return Err(ConfigError::SelfTrigger {
            binding: name,
            subscribes: config.subscribes.clone(),
            publishes: config.publishes.clone(),
        });
    }

    let emitter = Emitter::new(name.clone(), publishes.clone());
    let executor: Arc<dyn Executor> = match &config.handler {
        HandlerConfig::Deterministic { script, timeout_ms } => {
            let script_error = |source| ConfigError::Script {
                binding: name.clone(),
                source,
            };
            let script = env.scripts.load(script).map_err(script_error)?;
            env.runtime.check(&script).map_err(script_error)?;

            Arc::new(TreeHouse::new(
                env.runtime.clone(),
                script,
                timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(env.defaults.script_timeout),
                env.defaults.max_instructions,
                emitter,
            )
            .with_max_memory(env.defaults.max_memory_bytes))
        }
        HandlerConfig::Decision {
            prompt,
            contract,
            system,
            model,
            reparse_retries,
            timeout_ms,
        } => {
            let prompt = Template::parse(prompt).map_err(|e| ConfigError::InvalidPrompt {
                binding: name.clone(),
                reason: e.to_string(),
            })?;
            contract
                .validate()
                .map_err(|reason| ConfigError::InvalidContract {
                    binding: name.clone(),
                    reason,
                })?;
            let provider = env
                .provider
                .clone()
                .ok_or_else(|| ConfigError::ProviderUnavailable {
                    binding: name.clone(),
                })?;

            Arc::new(
                Nim::new(
                    provider,
                    prompt,
                    contract.clone(),
                    timeout_ms
                        .map(Duration::from_millis)
                        .unwrap_or(env.defaults.inference_timeout),
                    emitter,
                )
                .with_system(system.clone())
                .with_model(model.clone())
                .with_reparse_retries(*reparse_retries),
            )
        }
    };

    Ok(Binding {
        name,
        subscribes: config.subscribes.clone(),
        publishes,
        reentrant: config.reentrant,
        executor,
    })
}

// ============================================================================
// Hot reload
// ============================================================================

/// Serves the current routing generation
pub struct RoutingHandle {
    current: ArcSwap<RoutingTable>,
    reload_lock: Mutex<()>,
}

impl RoutingHandle {
    pub fn new(initial: RoutingTable) -> Self {
        Self {
            current: ArcSwap::new(Arc::new(initial)),
            reload_lock: Mutex::new(()),
        }
    }

    /// The whole current generation; hold it for as long as it is needed
    pub fn current(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    /// Build a new generation and swap it in.
    ///
    /// On error nothing changes and the previous generation keeps serving.
    pub fn reload(
        &self,
        snapshot: &ConfigSnapshot,
        env: &HandlerEnv,
    ) -> Result<Arc<RoutingTable>, ConfigError> {
        let _guard = self
            .reload_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let previous = self.current.load();
        let next = match RoutingTable::build(snapshot, env, previous.generation + 1) {
            Ok(table) => Arc::new(table),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    generation = previous.generation,
                    "Routing reload rejected, keeping current generation"
                );
                return Err(e);
            }
        };

        self.current.store(next.clone());
        tracing::info!(
            generation = next.generation,
            bindings = next.len(),
            "Routing generation loaded"
        );
        Ok(next)
    }
}

impl fmt::Debug for RoutingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingHandle")
            .field("generation", &self.current.load().generation)
            .finish()
    }
}
