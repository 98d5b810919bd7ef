//! # River
//!
//! The stream adapter every dispatcher talks to. The River owns durability;
//! this crate only wraps it behind a small contract:
//!
//! - `subscribe(pattern, consumer_group)`: an infinite stream of deliveries,
//!   restartable from the group's last acknowledged position
//! - `ack` / `nack`: settle a delivery, or ask for redelivery after a delay
//! - `publish`: append an envelope; failures go back to the caller
//!
//! Unacknowledged deliveries come back after the visibility timeout. Delivery
//! is at-least-once per consumer group, and publish order is kept only for one
//! publisher's sequential calls.
//!
//! ## Implementations
//!
//! - **NatsRiver**: Production implementation using NATS JetStream
//! - **InMemoryRiver**: Test/dev implementation with the same group semantics
//!
//! ## Usage
//!
//! ```rust,no_run
//! use river::{EventEnvelope, InMemoryRiver, River};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let river: Arc<dyn River> = Arc::new(InMemoryRiver::new());
//!
//! let mut deliveries = river.subscribe("crm.>", "dispatcher").await?;
//! river
//!     .publish(&EventEnvelope::new("crm.contact.created", serde_json::json!({"value": 42})))
//!     .await?;
//!
//! while let Some(delivery) = deliveries.next().await {
//!     river.ack("dispatcher", delivery.envelope.id).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod consumer_retry;
mod envelope;
mod inmemory_river;
mod nats_river;
pub mod subject;

pub use envelope::{validate_envelope_fields, EventEnvelope, EXTERNAL_SOURCE};
pub use inmemory_river::InMemoryRiver;
pub use nats_river::NatsRiver;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// One delivery of an envelope to a consumer group
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The envelope, with `delivery_attempt` stamped by the River
    pub envelope: EventEnvelope,
    /// Consumer group this delivery belongs to
    pub consumer_group: String,
}

impl Delivery {
    pub fn new(envelope: EventEnvelope, consumer_group: impl Into<String>) -> Self {
        Self {
            envelope,
            consumer_group: consumer_group.into(),
        }
    }
}

/// Errors that can occur when talking to the River
#[derive(Debug, thiserror::Error)]
pub enum RiverError {
    #[error("failed to publish message: {0}")]
    PublishError(String),

    #[error("failed to subscribe to subject: {0}")]
    SubscribeError(String),

    #[error("failed to settle delivery: {0}")]
    AckError(String),

    #[error("no outstanding delivery of event {event_id} for consumer group {consumer_group}")]
    UnknownDelivery {
        consumer_group: String,
        event_id: Uuid,
    },

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("invalid subject pattern: {0}")]
    InvalidSubject(String),
}

/// Result type for River operations
pub type RiverResult<T> = Result<T, RiverError>;

/// Stream adapter contract
#[async_trait]
pub trait River: Send + Sync {
    /// Publish an envelope on its subject
    ///
    /// # Returns
    /// * `Ok(())` once the River has accepted the envelope
    /// * `Err(RiverError)` if publishing failed; callers retry
    async fn publish(&self, envelope: &EventEnvelope) -> RiverResult<()>;

    /// Subscribe a consumer group to subjects matching a pattern
    ///
    /// # Arguments
    /// * `subject` - The subject pattern (supports wildcards: `*`, `>`)
    /// * `consumer_group` - Durable group name; members of one group share
    ///   the work, distinct groups each see every message
    async fn subscribe(
        &self,
        subject: &str,
        consumer_group: &str,
    ) -> RiverResult<BoxStream<'static, Delivery>>;

    /// Acknowledge a delivery; it will not be redelivered
    async fn ack(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<()>;

    /// Negatively acknowledge a delivery; it is redelivered after `redeliver_after`
    async fn nack(
        &self,
        consumer_group: &str,
        event_id: Uuid,
        redeliver_after: Duration,
    ) -> RiverResult<()>;

    /// Report that a delivery is still being worked on, restarting its
    /// visibility timeout so it is not handed to another consumer meanwhile
    async fn extend_lease(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<()>;
}

impl fmt::Debug for dyn River {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "River")
    }
}
