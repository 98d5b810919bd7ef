//! Shared fixtures for dispatcher integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use dispatch_rs::executors::{
    InferenceProvider, InferenceRequest, MemoryScriptStore, ProviderError, Script, ScriptError,
    ScriptInput, ScriptLimits, ScriptOutput, ScriptRuntime,
};
use dispatch_rs::metrics::Metrics;
use dispatch_rs::{
    ConfigSnapshot, DispatchError, Dispatcher, DispatcherConfig, HandlerEnv, RoutingHandle,
    RoutingTable,
};
use futures::stream::BoxStream;
use river::consumer_retry::RetryConfig;
use river::subject::matches_pattern;
use river::{Delivery, EventEnvelope, InMemoryRiver, River, RiverError, RiverResult};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const GROUP: &str = "dispatch-test";

// ============================================================================
// Script runtime double
// ============================================================================

type Behavior =
    dyn Fn(&Script, &ScriptInput) -> Result<ScriptOutput, ScriptError> + Send + Sync;

#[derive(Debug, Clone)]
pub struct Call {
    pub script: String,
    pub payload: Value,
}

/// Script runtime whose behaviour is a closure; records every execution
pub struct ScriptedRuntime {
    behavior: Box<Behavior>,
    calls: Mutex<Vec<Call>>,
}

impl ScriptedRuntime {
    pub fn new(
        behavior: impl Fn(&Script, &ScriptInput) -> Result<ScriptOutput, ScriptError>
            + Send
            + Sync
            + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            behavior: Box::new(behavior),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl ScriptRuntime for ScriptedRuntime {
    fn check(&self, _script: &Script) -> Result<(), ScriptError> {
        Ok(())
    }

    fn execute(
        &self,
        script: &Script,
        input: &ScriptInput,
        _limits: &ScriptLimits,
    ) -> Result<ScriptOutput, ScriptError> {
        self.calls.lock().unwrap().push(Call {
            script: script.path.clone(),
            payload: input.payload.clone(),
        });
        (self.behavior)(script, input)
    }
}

// ============================================================================
// Inference provider double
// ============================================================================

pub struct ScriptedProvider {
    replies: Mutex<VecDeque<String>>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedProvider {
    pub fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.iter().map(|r| r.to_string()).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl InferenceProvider for ScriptedProvider {
    async fn complete(&self, request: InferenceRequest) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(request.prompt);
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(ProviderError::EmptyResponse)
    }
}

// ============================================================================
// River double that fails publishes
// ============================================================================

/// Delegates to an `InMemoryRiver`, failing publishes on `pattern` while
/// failures remain
pub struct FlakyRiver {
    pub inner: InMemoryRiver,
    pattern: String,
    remaining_failures: AtomicU32,
}

impl FlakyRiver {
    pub fn new(inner: InMemoryRiver, pattern: &str, failures: u32) -> Self {
        Self {
            inner,
            pattern: pattern.to_string(),
            remaining_failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl River for FlakyRiver {
    async fn publish(&self, envelope: &EventEnvelope) -> RiverResult<()> {
        if matches_pattern(&envelope.subject, &self.pattern)
            && self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(RiverError::PublishError("injected failure".to_string()));
        }
        self.inner.publish(envelope).await
    }

    async fn subscribe(
        &self,
        subject: &str,
        consumer_group: &str,
    ) -> RiverResult<BoxStream<'static, Delivery>> {
        self.inner.subscribe(subject, consumer_group).await
    }

    async fn ack(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<()> {
        self.inner.ack(consumer_group, event_id).await
    }

    async fn nack(
        &self,
        consumer_group: &str,
        event_id: Uuid,
        redeliver_after: Duration,
    ) -> RiverResult<()> {
        self.inner.nack(consumer_group, event_id, redeliver_after).await
    }

    async fn extend_lease(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<()> {
        self.inner.extend_lease(consumer_group, event_id).await
    }
}

// ============================================================================
// Configuration helpers
// ============================================================================

pub fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        consumer_group: GROUP.to_string(),
        subscribe_pattern: ">".to_string(),
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
        publish_retry: RetryConfig {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(1),
        },
        nack_delay: Duration::from_millis(10),
        lane_idle_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

pub fn script_binding(name: &str, subscribes: &str, publishes: &str, script: &str) -> Value {
    json!({
        "name": name,
        "subscribes": subscribes,
        "publishes": publishes,
        "handler": {"kind": "deterministic", "script": script}
    })
}

pub fn snapshot(bindings: Vec<Value>) -> ConfigSnapshot {
    serde_json::from_value(json!({ "bindings": bindings })).unwrap()
}

pub fn scripted_env(runtime: Arc<ScriptedRuntime>, scripts: &[&str]) -> HandlerEnv {
    let store = scripts
        .iter()
        .fold(MemoryScriptStore::new(), |store, path| store.with_script(*path, "-- test"));
    HandlerEnv::new(Arc::new(store), runtime)
}

pub fn emit(payload: Value) -> Result<ScriptOutput, ScriptError> {
    Ok(ScriptOutput::Emit(vec![payload]))
}

// ============================================================================
// Running dispatcher
// ============================================================================

pub struct Harness {
    pub dispatcher: Dispatcher,
    pub metrics: Metrics,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), DispatchError>>>,
}

impl Harness {
    pub fn start(river: Arc<dyn River>, table: RoutingTable, config: DispatcherConfig) -> Self {
        Self::start_with_handle(river, Arc::new(RoutingHandle::new(table)), config)
    }

    pub fn start_with_handle(
        river: Arc<dyn River>,
        routing: Arc<RoutingHandle>,
        config: DispatcherConfig,
    ) -> Self {
        let metrics = Metrics::new().unwrap();
        let dispatcher = Dispatcher::new(river, routing, config, metrics.clone()).unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let running = dispatcher.clone();
        let task = tokio::spawn(async move {
            running
                .run_until(async {
                    let _ = rx.await;
                })
                .await
        });
        Self {
            dispatcher,
            metrics,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }
}

/// Poll `condition` until it holds, failing the test after five seconds
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn dead_letters(river: &InMemoryRiver) -> Vec<Value> {
    river
        .published("river.dead_letter")
        .into_iter()
        .map(|envelope| envelope.payload)
        .collect()
}
