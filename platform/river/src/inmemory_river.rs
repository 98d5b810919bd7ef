//! In-memory implementation of the River for testing and development

use crate::subject::{matches_pattern, validate_pattern, validate_subject};
use crate::{Delivery, EventEnvelope, River, RiverError, RiverResult};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// River implementation backed by an in-process append-only log
///
/// This implementation is suitable for:
/// - Unit and integration tests (no external dependencies)
/// - Local development without a NATS server
///
/// Semantics mirror a durable pull consumer:
/// - Each consumer group has a cursor into the log and a set of leased
///   (delivered but unacknowledged) messages
/// - A lease that is not acknowledged within the visibility timeout is
///   redelivered with an incremented `delivery_attempt`
/// - Due redeliveries are handed out before new messages
/// - Several subscribers on one group compete for messages; distinct groups
///   each see every message
/// - A new group starts at the beginning of the log
///
/// # Example
/// ```rust
/// use river::{EventEnvelope, InMemoryRiver, River};
/// use futures::StreamExt;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let river = InMemoryRiver::new();
/// let mut deliveries = river.subscribe("crm.>", "workers").await?;
///
/// river.publish(&EventEnvelope::new("crm.contact.created", serde_json::json!({}))).await?;
///
/// let delivery = deliveries.next().await.unwrap();
/// assert_eq!(delivery.envelope.subject, "crm.contact.created");
/// assert_eq!(delivery.envelope.delivery_attempt, 1);
/// river.ack("workers", delivery.envelope.id).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryRiver {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<State>,
    // Bumped on every publish/nack/close so idle subscribers re-check the log
    wake: watch::Sender<u64>,
    visibility_timeout: Duration,
}

#[derive(Default)]
struct State {
    log: Vec<Arc<StoredMessage>>,
    groups: HashMap<String, GroupState>,
    closed: bool,
}

struct StoredMessage {
    event_id: Uuid,
    subject: String,
    bytes: Vec<u8>,
}

struct GroupState {
    filter: String,
    cursor: usize,
    // Keyed by log index so iteration is oldest-first
    pending: BTreeMap<usize, PendingDelivery>,
}

struct PendingDelivery {
    event_id: Uuid,
    deliveries: u32,
    visible_at: Instant,
}

enum Step {
    Deliver(Arc<StoredMessage>, u32),
    Wait(Option<Instant>),
    Closed,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake(&self) {
        self.wake.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

impl State {
    fn next_step(&mut self, group: &str, now: Instant, visibility: Duration) -> Step {
        if self.closed {
            return Step::Closed;
        }
        let Some(group) = self.groups.get_mut(group) else {
            return Step::Closed;
        };

        if let Some((&index, pending)) = group
            .pending
            .iter_mut()
            .find(|(_, pending)| pending.visible_at <= now)
        {
            pending.deliveries += 1;
            pending.visible_at = now + visibility;
            return Step::Deliver(self.log[index].clone(), pending.deliveries);
        }

        while group.cursor < self.log.len() {
            let index = group.cursor;
            group.cursor += 1;

            let message = &self.log[index];
            if matches_pattern(&message.subject, &group.filter) {
                group.pending.insert(
                    index,
                    PendingDelivery {
                        event_id: message.event_id,
                        deliveries: 1,
                        visible_at: now + visibility,
                    },
                );
                return Step::Deliver(message.clone(), 1);
            }
        }

        Step::Wait(group.pending.values().map(|p| p.visible_at).min())
    }

    fn pending_entry(
        &mut self,
        consumer_group: &str,
        event_id: Uuid,
    ) -> RiverResult<(&mut GroupState, usize)> {
        let unknown = || RiverError::UnknownDelivery {
            consumer_group: consumer_group.to_string(),
            event_id,
        };
        let group = self.groups.get_mut(consumer_group).ok_or_else(unknown)?;
        let index = group
            .pending
            .iter()
            .find(|(_, pending)| pending.event_id == event_id)
            .map(|(&index, _)| index)
            .ok_or_else(unknown)?;
        Ok((group, index))
    }
}

impl InMemoryRiver {
    /// Create a river with the default 30s visibility timeout
    pub fn new() -> Self {
        Self::with_visibility_timeout(DEFAULT_VISIBILITY_TIMEOUT)
    }

    /// Create a river with a custom visibility timeout
    ///
    /// # Arguments
    /// * `visibility_timeout` - How long a delivery stays leased before it
    ///   is redelivered
    pub fn with_visibility_timeout(visibility_timeout: Duration) -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                wake,
                visibility_timeout,
            }),
        }
    }

    /// Every envelope published so far on subjects matching `pattern`, in
    /// publish order
    pub fn published(&self, pattern: &str) -> Vec<EventEnvelope> {
        let state = self.shared.lock();
        state
            .log
            .iter()
            .filter(|message| matches_pattern(&message.subject, pattern))
            .filter_map(|message| EventEnvelope::from_bytes(&message.bytes).ok())
            .collect()
    }

    /// Number of delivered-but-unacknowledged messages for a group
    pub fn pending_count(&self, consumer_group: &str) -> usize {
        self.shared
            .lock()
            .groups
            .get(consumer_group)
            .map_or(0, |group| group.pending.len())
    }

    /// End every subscription stream
    pub fn close(&self) {
        self.shared.lock().closed = true;
        self.shared.wake();
    }
}

impl Default for InMemoryRiver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl River for InMemoryRiver {
    async fn publish(&self, envelope: &EventEnvelope) -> RiverResult<()> {
        validate_subject(&envelope.subject).map_err(RiverError::InvalidSubject)?;
        let bytes = envelope.to_bytes()?;

        {
            let mut state = self.shared.lock();
            if state.closed {
                return Err(RiverError::PublishError("river is closed".to_string()));
            }
            state.log.push(Arc::new(StoredMessage {
                event_id: envelope.id,
                subject: envelope.subject.clone(),
                bytes,
            }));
        }
        self.shared.wake();

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        consumer_group: &str,
    ) -> RiverResult<BoxStream<'static, Delivery>> {
        validate_pattern(subject).map_err(RiverError::InvalidSubject)?;

        {
            let mut state = self.shared.lock();
            state
                .groups
                .entry(consumer_group.to_string())
                .and_modify(|group| group.filter = subject.to_string())
                .or_insert_with(|| GroupState {
                    filter: subject.to_string(),
                    cursor: 0,
                    pending: BTreeMap::new(),
                });
        }

        let shared = self.shared.clone();
        let group = consumer_group.to_string();
        let mut wake = self.shared.wake.subscribe();

        let stream = async_stream::stream! {
            loop {
                wake.borrow_and_update();
                let step = {
                    let mut state = shared.lock();
                    state.next_step(&group, Instant::now(), shared.visibility_timeout)
                };

                match step {
                    Step::Deliver(message, attempt) => {
                        match EventEnvelope::from_bytes(&message.bytes) {
                            Ok(mut envelope) => {
                                envelope.delivery_attempt = attempt;
                                yield Delivery::new(envelope, group.clone());
                            }
                            Err(e) => {
                                tracing::warn!(
                                    event_id = %message.event_id,
                                    error = %e,
                                    "InMemoryRiver: dropping undecodable message"
                                );
                                let mut state = shared.lock();
                                if let Ok((group, index)) = state.pending_entry(&group, message.event_id) {
                                    group.pending.remove(&index);
                                }
                            }
                        }
                    }
                    Step::Wait(Some(deadline)) => {
                        tokio::select! {
                            _ = wake.changed() => {}
                            _ = tokio::time::sleep_until(deadline) => {}
                        }
                    }
                    Step::Wait(None) => {
                        if wake.changed().await.is_err() {
                            break;
                        }
                    }
                    Step::Closed => break,
                }
            }
        };

        Ok(stream.boxed())
    }

    async fn ack(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<()> {
        let mut state = self.shared.lock();
        let (group, index) = state.pending_entry(consumer_group, event_id)?;
        group.pending.remove(&index);
        Ok(())
    }

    async fn nack(
        &self,
        consumer_group: &str,
        event_id: Uuid,
        redeliver_after: Duration,
    ) -> RiverResult<()> {
        {
            let mut state = self.shared.lock();
            let (group, index) = state.pending_entry(consumer_group, event_id)?;
            if let Some(pending) = group.pending.get_mut(&index) {
                pending.visible_at = Instant::now() + redeliver_after;
            }
        }
        self.shared.wake();
        Ok(())
    }

    async fn extend_lease(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<()> {
        let mut state = self.shared.lock();
        let (group, index) = state.pending_entry(consumer_group, event_id)?;
        if let Some(pending) = group.pending.get_mut(&index) {
            pending.visible_at = Instant::now() + self.shared.visibility_timeout;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn next(stream: &mut BoxStream<'static, Delivery>) -> Delivery {
        tokio::time::timeout(Duration::from_secs(60), stream.next())
            .await
            .expect("timeout")
            .expect("stream ended")
    }

    fn event(subject: &str) -> EventEnvelope {
        EventEnvelope::new(subject, json!({"subject": subject}))
    }

    #[tokio::test]
    async fn test_publish_and_subscribe() {
        let river = InMemoryRiver::new();
        let mut stream = river.subscribe("crm.>", "g").await.unwrap();

        let envelope = event("crm.contact.created");
        river.publish(&envelope).await.unwrap();

        let delivery = next(&mut stream).await;
        assert_eq!(delivery.envelope.id, envelope.id);
        assert_eq!(delivery.envelope.delivery_attempt, 1);
        assert_eq!(delivery.consumer_group, "g");
    }

    #[tokio::test]
    async fn test_multiple_messages_in_order() {
        let river = InMemoryRiver::new();
        let mut stream = river.subscribe("test.>", "g").await.unwrap();

        for i in 0..5 {
            river.publish(&event(&format!("test.msg.{i}"))).await.unwrap();
        }

        for i in 0..5 {
            let delivery = next(&mut stream).await;
            assert_eq!(delivery.envelope.subject, format!("test.msg.{i}"));
        }
    }

    #[tokio::test]
    async fn test_wildcard_filtering() {
        let river = InMemoryRiver::new();
        let mut stream = river.subscribe("crm.events.*", "g").await.unwrap();

        river.publish(&event("crm.events.created")).await.unwrap();
        river.publish(&event("crm.events.contact.created")).await.unwrap();
        river.publish(&event("billing.events.created")).await.unwrap();
        river.publish(&event("crm.events.deleted")).await.unwrap();

        assert_eq!(next(&mut stream).await.envelope.subject, "crm.events.created");
        assert_eq!(next(&mut stream).await.envelope.subject, "crm.events.deleted");

        let result = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(result.is_err(), "should timeout, no more messages");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacked_delivery_is_redelivered_after_visibility_timeout() {
        let river = InMemoryRiver::with_visibility_timeout(Duration::from_secs(5));
        let mut stream = river.subscribe("a.>", "g").await.unwrap();
        river.publish(&event("a.b")).await.unwrap();

        let first = next(&mut stream).await;
        let started = Instant::now();
        let second = next(&mut stream).await;

        assert_eq!(first.envelope.id, second.envelope.id);
        assert_eq!(second.envelope.delivery_attempt, 2);
        assert!(started.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_extended_lease_postpones_redelivery() {
        let river = InMemoryRiver::with_visibility_timeout(Duration::from_secs(5));
        let mut stream = river.subscribe("a.>", "g").await.unwrap();
        river.publish(&event("a.b")).await.unwrap();

        let first = next(&mut stream).await;
        let started = Instant::now();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(4)).await;
            river.extend_lease("g", first.envelope.id).await.unwrap();
        }

        let again = next(&mut stream).await;
        assert_eq!(again.envelope.id, first.envelope.id);
        assert_eq!(again.envelope.delivery_attempt, 2);
        assert!(started.elapsed() >= Duration::from_secs(17));

        river.ack("g", first.envelope.id).await.unwrap();
        assert!(matches!(
            river.extend_lease("g", first.envelope.id).await,
            Err(RiverError::UnknownDelivery { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_delivery_is_not_redelivered() {
        let river = InMemoryRiver::with_visibility_timeout(Duration::from_secs(5));
        let mut stream = river.subscribe("a.>", "g").await.unwrap();
        river.publish(&event("a.b")).await.unwrap();

        let delivery = next(&mut stream).await;
        river.ack("g", delivery.envelope.id).await.unwrap();
        assert_eq!(river.pending_count("g"), 0);

        let result = tokio::time::timeout(Duration::from_secs(60), stream.next()).await;
        assert!(result.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nacked_delivery_comes_back_before_newer_messages() {
        let river = InMemoryRiver::new();
        let mut stream = river.subscribe("a.>", "g").await.unwrap();
        let e1 = event("a.one");
        let e2 = event("a.two");
        river.publish(&e1).await.unwrap();
        river.publish(&e2).await.unwrap();

        let first = next(&mut stream).await;
        assert_eq!(first.envelope.id, e1.id);
        river.nack("g", e1.id, Duration::from_millis(0)).await.unwrap();

        let redelivered = next(&mut stream).await;
        assert_eq!(redelivered.envelope.id, e1.id);
        assert_eq!(redelivered.envelope.delivery_attempt, 2);
        assert_eq!(next(&mut stream).await.envelope.id, e2.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nack_delay_is_honoured() {
        let river = InMemoryRiver::new();
        let mut stream = river.subscribe("a.>", "g").await.unwrap();
        let e1 = event("a.one");
        river.publish(&e1).await.unwrap();

        next(&mut stream).await;
        river.nack("g", e1.id, Duration::from_secs(2)).await.unwrap();

        let started = Instant::now();
        let again = next(&mut stream).await;
        assert_eq!(again.envelope.id, e1.id);
        assert!(started.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_groups_fan_out_and_members_compete() {
        let river = InMemoryRiver::new();
        let mut a1 = river.subscribe("x.>", "a").await.unwrap();
        let mut a2 = river.subscribe("x.>", "a").await.unwrap();
        let mut b = river.subscribe("x.>", "b").await.unwrap();

        river.publish(&event("x.one")).await.unwrap();
        river.publish(&event("x.two")).await.unwrap();

        let first = next(&mut a1).await;
        let second = next(&mut a2).await;
        assert_ne!(first.envelope.id, second.envelope.id);

        assert_eq!(next(&mut b).await.envelope.subject, "x.one");
        assert_eq!(next(&mut b).await.envelope.subject, "x.two");
    }

    #[tokio::test]
    async fn test_resubscribe_resumes_after_last_position() {
        let river = InMemoryRiver::new();
        river.publish(&event("x.one")).await.unwrap();
        river.publish(&event("x.two")).await.unwrap();

        {
            let mut stream = river.subscribe("x.>", "g").await.unwrap();
            let delivery = next(&mut stream).await;
            river.ack("g", delivery.envelope.id).await.unwrap();
        }

        let mut stream = river.subscribe("x.>", "g").await.unwrap();
        assert_eq!(next(&mut stream).await.envelope.subject, "x.two");
    }

    #[tokio::test]
    async fn test_ack_unknown_delivery_fails() {
        let river = InMemoryRiver::new();
        let _stream = river.subscribe("x.>", "g").await.unwrap();

        let result = river.ack("g", Uuid::new_v4()).await;
        assert!(matches!(result, Err(RiverError::UnknownDelivery { .. })));
    }

    #[tokio::test]
    async fn test_invalid_subjects_are_refused() {
        let river = InMemoryRiver::new();

        assert!(river.subscribe("x.>.y", "g").await.is_err());
        assert!(river.publish(&event("x.*")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let river = InMemoryRiver::new();
        let mut stream = river.subscribe("x.>", "g").await.unwrap();

        river.close();

        let ended = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("timeout");
        assert!(ended.is_none());
    }

    #[tokio::test]
    async fn test_published_inspection() {
        let river = InMemoryRiver::new();
        river.publish(&event("lead.scored")).await.unwrap();
        river.publish(&event("lead.qualified")).await.unwrap();

        let scored = river.published("lead.scored");
        assert_eq!(scored.len(), 1);
        assert_eq!(river.published("lead.>").len(), 2);
    }
}
