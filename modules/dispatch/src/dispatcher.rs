//! Dispatcher
//!
//! Pulls deliveries from the River, routes them through the current routing
//! generation and turns executor outcomes into publish / retry / dead-letter
//! decisions.
//!
//! ## Concurrency
//!
//! Each subject gets a lane: a task that starts executions for that subject
//! strictly in arrival order, at most `limit` at a time. Different subjects
//! run in parallel. An execution keeps its lane permit across in-process
//! retries, so with a limit of 1 a retried event still finishes before the
//! next one on the same subject starts. Lanes exit after an idle period; a
//! replacement lane waits for its predecessor before starting.
//!
//! ## Settlement
//!
//! A delivery is acknowledged once every matched binding has reached a
//! terminal status (published, or dead-lettered). If publishing fails even
//! after retries, the delivery is nacked and comes back later; bindings that
//! already settled are skipped on redelivery through the dedup window.
//!
//! While a delivery executes its lease is extended every `lease_refresh`.
//! If a copy is redelivered anyway, an (event, binding) pair that is still
//! claimed in the in-flight registry is not run a second time; that copy is
//! left for the running one to settle.

use futures::future::join_all;
use futures::StreamExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use river::consumer_retry::{retry_with_backoff, RetryConfig};
use river::subject::{matches_pattern, validate_pattern, validate_subject};
use river::{Delivery, EventEnvelope, River, RiverError};

use crate::dedup::DedupWindow;
use crate::dlq::{DeadLetter, DeadLetterClass, DEFAULT_DEAD_LETTER_SUBJECT};
use crate::inflight::{InFlightRecord, InFlightRegistry, InFlightStatus};
use crate::metrics::Metrics;
use crate::outcome::Outcome;
use crate::routing::{Binding, RoutingHandle};

/// Deliveries routed between sweeps of finished lanes
const LANE_SWEEP_INTERVAL: u64 = 256;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("river error: {0}")]
    River(#[from] RiverError),

    #[error("invalid dispatcher config: {0}")]
    Config(String),
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub consumer_group: String,
    pub subscribe_pattern: String,
    /// Executions in flight per subject
    pub subject_concurrency: usize,
    /// Per-pattern concurrency limits; first match wins
    pub concurrency_overrides: Vec<(String, usize)>,
    /// In-process attempts per binding and the backoff between them
    pub retry: RetryConfig,
    /// Attempts for publishing outbound events and dead letters
    pub publish_retry: RetryConfig,
    /// Broker deliveries after which an event is dead-lettered unexecuted
    pub max_deliveries: u32,
    /// Causal depth after which an event is dead-lettered unexecuted
    pub max_hops: u32,
    pub dead_letter_subject: String,
    /// Redelivery delay requested when settlement fails
    pub nack_delay: Duration,
    pub lane_idle_timeout: Duration,
    pub dedup_ttl: Duration,
    pub dedup_capacity: usize,
    /// Interval between lease extensions while a delivery executes
    pub lease_refresh: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            consumer_group: "dispatcher".to_string(),
            subscribe_pattern: ">".to_string(),
            subject_concurrency: 4,
            concurrency_overrides: Vec::new(),
            retry: RetryConfig::default(),
            publish_retry: RetryConfig {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_secs(2),
            },
            max_deliveries: 10,
            max_hops: 16,
            dead_letter_subject: DEFAULT_DEAD_LETTER_SUBJECT.to_string(),
            nack_delay: Duration::from_secs(5),
            lane_idle_timeout: Duration::from_secs(30),
            dedup_ttl: Duration::from_secs(3600),
            dedup_capacity: 100_000,
            lease_refresh: Duration::from_secs(10),
        }
    }
}

impl DispatcherConfig {
    pub fn concurrency_for(&self, subject: &str) -> usize {
        self.concurrency_overrides
            .iter()
            .find(|(pattern, _)| matches_pattern(subject, pattern))
            .map_or(self.subject_concurrency, |(_, limit)| *limit)
            .max(1)
    }

    fn validate(&self) -> Result<(), DispatchError> {
        if self.consumer_group.trim().is_empty() {
            return Err(DispatchError::Config("consumer group cannot be empty".into()));
        }
        validate_pattern(&self.subscribe_pattern).map_err(DispatchError::Config)?;
        validate_subject(&self.dead_letter_subject).map_err(DispatchError::Config)?;
        for (pattern, _) in &self.concurrency_overrides {
            validate_pattern(pattern).map_err(DispatchError::Config)?;
        }
        if self.retry.max_attempts == 0 || self.publish_retry.max_attempts == 0 {
            return Err(DispatchError::Config("max_attempts must be at least 1".into()));
        }
        if self.lease_refresh.is_zero() {
            return Err(DispatchError::Config("lease_refresh must be positive".into()));
        }
        Ok(())
    }
}

/// How one binding finished for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Settled,
    PublishFailed,
    /// Another copy of the delivery holds the execution
    Busy,
}

struct Lane {
    tx: mpsc::UnboundedSender<Delivery>,
    handle: JoinHandle<()>,
}

struct Inner {
    river: Arc<dyn River>,
    routing: Arc<RoutingHandle>,
    config: DispatcherConfig,
    dedup: DedupWindow,
    in_flight: InFlightRegistry,
    metrics: Metrics,
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl Dispatcher {
    pub fn new(
        river: Arc<dyn River>,
        routing: Arc<RoutingHandle>,
        config: DispatcherConfig,
        metrics: Metrics,
    ) -> Result<Self, DispatchError> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(Inner {
                river,
                routing,
                dedup: DedupWindow::new(config.dedup_ttl, config.dedup_capacity),
                in_flight: InFlightRegistry::new(),
                config,
                metrics,
            }),
        })
    }

    pub fn routing(&self) -> &Arc<RoutingHandle> {
        &self.inner.routing
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    /// Snapshot of executions currently in flight
    pub fn in_flight(&self) -> Vec<InFlightRecord> {
        self.inner.in_flight.snapshot()
    }

    /// Run until the subscription ends
    pub async fn run(&self) -> Result<(), DispatchError> {
        self.run_until(std::future::pending()).await
    }

    /// Run until the subscription ends or `shutdown` resolves, then drain
    /// every lane
    pub async fn run_until(&self, shutdown: impl Future<Output = ()>) -> Result<(), DispatchError> {
        let config = &self.inner.config;
        let mut deliveries = self
            .inner
            .river
            .subscribe(&config.subscribe_pattern, &config.consumer_group)
            .await?;

        self.inner
            .metrics
            .routing_generation
            .set(self.inner.routing.current().generation() as i64);

        tracing::info!(
            consumer_group = %config.consumer_group,
            pattern = %config.subscribe_pattern,
            "Dispatcher started"
        );

        let mut lanes: HashMap<String, Lane> = HashMap::new();
        let mut routed: u64 = 0;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, draining lanes");
                    break;
                }
                next = deliveries.next() => match next {
                    Some(delivery) => {
                        self.route(&mut lanes, delivery);
                        routed += 1;
                        if routed % LANE_SWEEP_INTERVAL == 0 {
                            lanes.retain(|_, lane| !lane.handle.is_finished());
                        }
                    }
                    None => {
                        tracing::warn!("Subscription ended, draining lanes");
                        break;
                    }
                },
            }
        }

        for (subject, lane) in lanes.drain() {
            drop(lane.tx);
            if let Err(e) = lane.handle.await {
                tracing::error!(subject = %subject, error = %e, "Lane task failed");
            }
        }

        tracing::info!("Dispatcher stopped");
        Ok(())
    }

    fn route(&self, lanes: &mut HashMap<String, Lane>, delivery: Delivery) {
        let subject = delivery.envelope.subject.clone();

        // A lane that went idle has closed its receiver; start a new one behind it
        let delivery = match lanes.get(&subject) {
            Some(lane) => match lane.tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(delivery)) => delivery,
            },
            None => delivery,
        };

        let predecessor = lanes.remove(&subject).map(|lane| lane.handle);
        let (tx, rx) = mpsc::unbounded_channel();
        // rx is alive here, so this cannot fail
        let _ = tx.send(delivery);

        let limit = self.inner.config.concurrency_for(&subject);
        let handle = tokio::spawn(run_lane(
            self.inner.clone(),
            subject.clone(),
            rx,
            limit,
            predecessor,
        ));
        lanes.insert(subject, Lane { tx, handle });
    }
}

async fn run_lane(
    inner: Arc<Inner>,
    subject: String,
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    limit: usize,
    predecessor: Option<JoinHandle<()>>,
) {
    if let Some(previous) = predecessor {
        let _ = previous.await;
    }

    let permits = Arc::new(Semaphore::new(limit));
    let idle = inner.config.lane_idle_timeout;

    loop {
        let next = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(next) => next,
            Err(_) => {
                // Refuse new deliveries but finish anything already queued
                rx.close();
                rx.recv().await
            }
        };
        let Some(delivery) = next else { break };

        let Ok(permit) = permits.clone().acquire_owned().await else {
            break;
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            inner.process_delivery(delivery).await;
            drop(permit);
        });
    }

    // Wait for running executions before letting a successor start
    let _ = permits.acquire_many(limit as u32).await;
    tracing::debug!(subject = %subject, "Lane closed");
}

impl Inner {
    async fn process_delivery(&self, delivery: Delivery) {
        let event = delivery.envelope;
        let table = self.routing.current();

        let span = tracing::info_span!(
            "dispatch",
            event_id = %event.id,
            subject = %event.subject,
            correlation_id = %event.correlation_id,
            generation = table.generation(),
            delivery_attempt = event.delivery_attempt,
        );

        async move {
            let bindings = table.resolve(&event.subject);
            if bindings.is_empty() {
                tracing::debug!("No bindings match, acknowledging");
                self.ack(&event).await;
                return;
            }

            let settled = self.dedup.settled(event.id);
            let pending: Vec<Arc<Binding>> = bindings
                .into_iter()
                .filter(|binding| !settled.contains(&binding.name))
                .collect();
            if pending.is_empty() {
                self.metrics.dedup_hits_total.inc();
                tracing::info!("Duplicate delivery, all bindings already settled");
                self.ack(&event).await;
                return;
            }

            let results = if event.hop_count > self.config.max_hops {
                self.reject_all(&event, &pending, DeadLetterClass::HopLimit, format!(
                    "hop count {} exceeds limit {}",
                    event.hop_count, self.config.max_hops
                ))
                .await
            } else if event.delivery_attempt > self.config.max_deliveries {
                self.reject_all(&event, &pending, DeadLetterClass::RedeliveryLimit, format!(
                    "delivered {} times, limit {}",
                    event.delivery_attempt, self.config.max_deliveries
                ))
                .await
            } else {
                let generation = table.generation();
                let runs = join_all(
                    pending
                        .iter()
                        .map(|binding| self.run_binding(&event, binding, generation)),
                );
                self.holding_lease(&event, runs).await
            };

            if results.contains(&Settlement::PublishFailed) {
                self.nack(&event).await;
            } else if results.contains(&Settlement::Busy) {
                self.metrics.overlapping_deliveries_total.inc();
                tracing::info!("Another copy of this delivery is still executing, leaving it to settle");
            } else {
                self.ack(&event).await;
            }
        }
        .instrument(span)
        .await
    }

    async fn run_binding(
        &self,
        event: &EventEnvelope,
        binding: &Binding,
        generation: u64,
    ) -> Settlement {
        let span = tracing::info_span!("execute", binding = %binding.name);
        async move {
            if !self
                .in_flight
                .begin(event.id, &binding.name, &event.subject, generation)
            {
                tracing::debug!("Execution already claimed by another copy");
                return Settlement::Busy;
            }
            // The previous holder may have settled between the dedup check and the claim
            if self.dedup.is_settled(event.id, &binding.name) {
                self.in_flight.forget(event.id, &binding.name);
                return Settlement::Settled;
            }

            let mut attempt: u32 = 0;
            loop {
                attempt += 1;
                self.advance(event, binding, InFlightStatus::Running);

                let started = Instant::now();
                let outcome = binding.executor.run(event).await;
                self.metrics
                    .execution_duration_seconds
                    .with_label_values(&[binding.kind().as_str()])
                    .observe(started.elapsed().as_secs_f64());
                self.metrics
                    .executions_total
                    .with_label_values(&[binding.name.as_str(), outcome.label()])
                    .inc();

                match outcome {
                    Outcome::Published(events) => {
                        for outbound in &events {
                            if let Err(e) = self.publish(outbound).await {
                                return self.publish_failed(event, binding, &e);
                            }
                        }
                        tracing::info!(
                            attempt = attempt,
                            published = events.len(),
                            "Binding succeeded"
                        );
                        self.dedup.settle(event.id, &binding.name);
                        self.advance(event, binding, InFlightStatus::Succeeded);
                        return Settlement::Settled;
                    }
                    Outcome::Rejected(ref rejection) => {
                        tracing::warn!(
                            attempt = attempt,
                            reason = %rejection.reason,
                            "Binding rejected event"
                        );
                        let letter = DeadLetter::from_outcome(event, &binding.name, &outcome, attempt);
                        return self.finish_dead_lettered(event, binding, letter).await;
                    }
                    Outcome::Failed(_) | Outcome::Timeout => {
                        self.advance(event, binding, InFlightStatus::Failed);

                        if attempt >= self.config.retry.max_attempts {
                            tracing::warn!(
                                attempts = attempt,
                                outcome = %outcome,
                                "Retries exhausted"
                            );
                            let letter = DeadLetter::from_outcome(event, &binding.name, &outcome, attempt);
                            return self.finish_dead_lettered(event, binding, letter).await;
                        }

                        let backoff = self.config.retry.backoff_for(attempt);
                        tracing::warn!(
                            attempt = attempt,
                            max_attempts = self.config.retry.max_attempts,
                            backoff_ms = backoff.as_millis() as u64,
                            outcome = %outcome,
                            "Binding failed, retrying"
                        );
                        self.metrics
                            .retries_total
                            .with_label_values(&[binding.name.as_str()])
                            .inc();
                        tokio::time::sleep(backoff).await;
                        self.advance(event, binding, InFlightStatus::Pending);
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Dead-letter every binding without executing it
    async fn reject_all(
        &self,
        event: &EventEnvelope,
        bindings: &[Arc<Binding>],
        class: DeadLetterClass,
        reason: String,
    ) -> Vec<Settlement> {
        let attempts = event.delivery_attempt.saturating_sub(1);
        let mut results = Vec::with_capacity(bindings.len());
        for binding in bindings {
            if self.in_flight.contains(event.id, &binding.name) {
                results.push(Settlement::Busy);
                continue;
            }
            let letter = DeadLetter::new(event, &binding.name, class, reason.clone(), attempts);
            let result = match self.dead_letter(event, letter).await {
                Ok(()) => {
                    self.dedup.settle(event.id, &binding.name);
                    Settlement::Settled
                }
                Err(e) => {
                    self.metrics.publish_failures_total.inc();
                    tracing::error!(binding = %binding.name, error = %e, "Failed to publish dead letter");
                    Settlement::PublishFailed
                }
            };
            results.push(result);
        }
        results
    }

    async fn finish_dead_lettered(
        &self,
        event: &EventEnvelope,
        binding: &Binding,
        letter: DeadLetter,
    ) -> Settlement {
        match self.dead_letter(event, letter).await {
            Ok(()) => {
                self.dedup.settle(event.id, &binding.name);
                self.advance(event, binding, InFlightStatus::DeadLettered);
                Settlement::Settled
            }
            Err(e) => self.publish_failed(event, binding, &e),
        }
    }

    /// Publish a dead-letter diagnostic. Failures of dead-letter events
    /// themselves are only logged.
    async fn dead_letter(&self, event: &EventEnvelope, letter: DeadLetter) -> Result<(), RiverError> {
        if event.subject == self.config.dead_letter_subject {
            tracing::error!(
                binding = %letter.binding,
                class = letter.class.as_str(),
                reason = %letter.reason,
                "Handler failed on a dead-letter event; not dead-lettering again"
            );
            return Ok(());
        }

        let envelope = letter.to_envelope(event, &self.config.dead_letter_subject);
        self.publish(&envelope).await?;

        self.metrics
            .dead_letters_total
            .with_label_values(&[letter.binding.as_str(), letter.class.as_str()])
            .inc();
        tracing::error!(
            event_id = %event.id,
            subject = %event.subject,
            correlation_id = %event.correlation_id,
            binding = %letter.binding,
            class = letter.class.as_str(),
            attempts = letter.attempts,
            reason = %letter.reason,
            dead_letter_id = %envelope.id,
            "Event dead-lettered"
        );
        Ok(())
    }

    fn publish_failed(&self, event: &EventEnvelope, binding: &Binding, error: &RiverError) -> Settlement {
        self.metrics.publish_failures_total.inc();
        self.in_flight.forget(event.id, &binding.name);
        tracing::error!(error = %error, "Publish failed after retries; event will be redelivered");
        Settlement::PublishFailed
    }

    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), RiverError> {
        retry_with_backoff(
            || self.river.publish(envelope),
            &self.config.publish_retry,
            "publish_outbound_event",
        )
        .await
    }

    /// Move the in-flight record. The record is for observers only; the
    /// execution loop keeps its own attempt count.
    fn advance(&self, event: &EventEnvelope, binding: &Binding, next: InFlightStatus) {
        if let Err(e) = self.in_flight.transition(event.id, &binding.name, next) {
            tracing::warn!(error = %e, "In-flight record out of step");
        }
    }

    /// Drive `work` to completion, extending the delivery's lease meanwhile
    async fn holding_lease<T>(&self, event: &EventEnvelope, work: impl Future<Output = T>) -> T {
        tokio::pin!(work);
        let period = self.config.lease_refresh;
        let mut refresh = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        refresh.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                output = &mut work => return output,
                _ = refresh.tick() => {
                    if let Err(e) = self
                        .river
                        .extend_lease(&self.config.consumer_group, event.id)
                        .await
                    {
                        tracing::warn!(event_id = %event.id, error = %e, "Failed to extend delivery lease");
                    }
                }
            }
        }
    }

    async fn ack(&self, event: &EventEnvelope) {
        if let Err(e) = self.river.ack(&self.config.consumer_group, event.id).await {
            tracing::warn!(event_id = %event.id, error = %e, "Failed to acknowledge delivery");
        }
    }

    async fn nack(&self, event: &EventEnvelope) {
        if let Err(e) = self
            .river
            .nack(&self.config.consumer_group, event.id, self.config.nack_delay)
            .await
        {
            tracing::warn!(event_id = %event.id, error = %e, "Failed to nack delivery");
        }
    }
}
