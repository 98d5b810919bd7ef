//! NATS JetStream implementation of the River

use crate::subject::{validate_pattern, validate_subject};
use crate::{Delivery, EventEnvelope, River, RiverError, RiverResult};
use async_nats::jetstream::{self, consumer::pull, consumer::AckPolicy, AckKind};
use async_nats::{Client, HeaderMap};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Header JetStream uses for duplicate publish detection
const MSG_ID_HEADER: &str = "Nats-Msg-Id";

type Outstanding = HashMap<(String, Uuid), jetstream::Message>;

/// River implementation using NATS JetStream
///
/// Each consumer group maps onto a durable pull consumer with explicit
/// acknowledgement. JetStream owns persistence and redelivery after
/// `ack_wait`; this adapter remembers outstanding messages so they can be
/// settled by event id.
///
/// # Example
/// ```rust,no_run
/// use river::{NatsRiver, River};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = async_nats::connect("nats://localhost:4222").await?;
/// let river = NatsRiver::connect(client, "RIVER", vec![">".to_string()], Duration::from_secs(30)).await?;
/// let deliveries = river.subscribe("crm.>", "dispatcher").await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct NatsRiver {
    context: jetstream::Context,
    stream_name: String,
    ack_wait: Duration,
    outstanding: Arc<Mutex<Outstanding>>,
}

fn lock(outstanding: &Mutex<Outstanding>) -> MutexGuard<'_, Outstanding> {
    outstanding.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NatsRiver {
    /// Bind to (creating if needed) a JetStream stream
    ///
    /// # Arguments
    /// * `client` - An already-connected `async_nats::Client`
    /// * `stream_name` - JetStream stream holding the River
    /// * `subjects` - Subjects the stream captures
    /// * `ack_wait` - Visibility timeout before unacknowledged messages are redelivered
    pub async fn connect(
        client: Client,
        stream_name: &str,
        subjects: Vec<String>,
        ack_wait: Duration,
    ) -> RiverResult<Self> {
        let context = jetstream::new(client);
        context
            .get_or_create_stream(jetstream::stream::Config {
                name: stream_name.to_string(),
                subjects,
                ..Default::default()
            })
            .await
            .map_err(|e| RiverError::ConnectionError(e.to_string()))?;

        Ok(Self {
            context,
            stream_name: stream_name.to_string(),
            ack_wait,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn take(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<jetstream::Message> {
        lock(&self.outstanding)
            .remove(&(consumer_group.to_string(), event_id))
            .ok_or_else(|| RiverError::UnknownDelivery {
                consumer_group: consumer_group.to_string(),
                event_id,
            })
    }
}

#[async_trait]
impl River for NatsRiver {
    async fn publish(&self, envelope: &EventEnvelope) -> RiverResult<()> {
        validate_subject(&envelope.subject).map_err(RiverError::InvalidSubject)?;
        let payload = envelope.to_bytes()?;

        let mut headers = HeaderMap::new();
        headers.insert(MSG_ID_HEADER, envelope.id.to_string().as_str());

        let ack = self
            .context
            .publish_with_headers(envelope.subject.clone(), headers, payload.into())
            .await
            .map_err(|e| RiverError::PublishError(e.to_string()))?;
        ack.await
            .map_err(|e| RiverError::PublishError(e.to_string()))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        consumer_group: &str,
    ) -> RiverResult<BoxStream<'static, Delivery>> {
        validate_pattern(subject).map_err(RiverError::InvalidSubject)?;

        let stream = self
            .context
            .get_stream(&self.stream_name)
            .await
            .map_err(|e| RiverError::SubscribeError(e.to_string()))?;

        let consumer = stream
            .get_or_create_consumer(
                consumer_group,
                pull::Config {
                    durable_name: Some(consumer_group.to_string()),
                    filter_subject: subject.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: self.ack_wait,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| RiverError::SubscribeError(e.to_string()))?;

        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| RiverError::SubscribeError(e.to_string()))?;

        let outstanding = self.outstanding.clone();
        let group = consumer_group.to_string();

        let deliveries = async_stream::stream! {
            while let Some(next) = messages.next().await {
                let message = match next {
                    Ok(message) => message,
                    Err(e) => {
                        tracing::warn!(consumer_group = %group, error = %e, "JetStream pull failed");
                        continue;
                    }
                };

                let attempt = message
                    .info()
                    .map(|info| u32::try_from(info.delivered).unwrap_or(u32::MAX))
                    .unwrap_or(1);

                match EventEnvelope::from_bytes(&message.payload) {
                    Ok(mut envelope) => {
                        envelope.delivery_attempt = attempt;
                        lock(&outstanding).insert((group.clone(), envelope.id), message);
                        yield Delivery::new(envelope, group.clone());
                    }
                    Err(e) => {
                        tracing::error!(
                            consumer_group = %group,
                            subject = %message.subject,
                            error = %e,
                            "Terminating undecodable message"
                        );
                        if let Err(term_err) = message.ack_with(AckKind::Term).await {
                            tracing::warn!(error = %term_err, "Failed to terminate message");
                        }
                    }
                }
            }
            tracing::warn!(consumer_group = %group, "JetStream message stream ended");
        };

        Ok(deliveries.boxed())
    }

    async fn ack(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<()> {
        let message = self.take(consumer_group, event_id)?;
        message
            .ack()
            .await
            .map_err(|e| RiverError::AckError(e.to_string()))
    }

    async fn nack(
        &self,
        consumer_group: &str,
        event_id: Uuid,
        redeliver_after: Duration,
    ) -> RiverResult<()> {
        let message = self.take(consumer_group, event_id)?;
        message
            .ack_with(AckKind::Nak(Some(redeliver_after)))
            .await
            .map_err(|e| RiverError::AckError(e.to_string()))
    }

    async fn extend_lease(&self, consumer_group: &str, event_id: Uuid) -> RiverResult<()> {
        // The message stays outstanding; it is still settled by ack or nack
        let message = lock(&self.outstanding)
            .get(&(consumer_group.to_string(), event_id))
            .cloned()
            .ok_or_else(|| RiverError::UnknownDelivery {
                consumer_group: consumer_group.to_string(),
                event_id,
            })?;
        message
            .ack_with(AckKind::Progress)
            .await
            .map_err(|e| RiverError::AckError(e.to_string()))
    }
}
