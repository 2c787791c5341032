//! Durable JetStream consumer for the medicine timer queue
//!
//! The queue is a file-backed stream with a durable pull consumer that allows a
//! single unacknowledged message (`max_ack_pending = 1`). Each delivery is
//! processed, then acknowledged or rejected, before the next one is read.

use async_nats::jetstream::{self, consumer::PullConsumer, AckKind};
use async_nats::Client;
use async_trait::async_trait;
use backoff::backoff::Backoff;
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SubscriberConfig;
use crate::error::SubscriberError;
use crate::processor::{ConsumptionOutcome, Disposition, MedicationProcessor, Rejection};
use crate::retry::{retry_with_backoff, RetryConfig};

/// A message handed out by the broker that must be settled exactly once
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<(), SubscriberError>;

    async fn reject(&self, rejection: Rejection) -> Result<(), SubscriberError>;
}

#[async_trait]
impl Delivery for jetstream::Message {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    async fn ack(&self) -> Result<(), SubscriberError> {
        jetstream::Message::ack(self)
            .await
            .map_err(|e| SubscriberError::Acknowledgement(format!("Failed to ack: {}", e)))
    }

    async fn reject(&self, rejection: Rejection) -> Result<(), SubscriberError> {
        let kind = match rejection {
            Rejection::Terminate => AckKind::Term,
            Rejection::Redeliver { delay } => AckKind::Nak(Some(delay)),
        };
        self.ack_with(kind)
            .await
            .map_err(|e| SubscriberError::Acknowledgement(format!("Failed to reject: {}", e)))
    }
}

/// Why a delivery stream stopped yielding messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    Shutdown,
    Disconnected,
}

/// Processes and settles deliveries one at a time
pub struct DeliveryHandler {
    processor: MedicationProcessor,
    redelivery_delay: Duration,
    settle_delay: Duration,
    receive_retry: RetryConfig,
}

impl DeliveryHandler {
    pub fn new(processor: MedicationProcessor) -> Self {
        Self {
            processor,
            redelivery_delay: Duration::from_secs(5),
            settle_delay: Duration::ZERO,
            receive_retry: RetryConfig::default(),
        }
    }

    pub fn with_redelivery_delay(mut self, delay: Duration) -> Self {
        self.redelivery_delay = delay;
        self
    }

    /// Pause between processing and settling a message
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Budget of consecutive receive errors tolerated before giving up
    pub fn with_receive_retry(mut self, retry: RetryConfig) -> Self {
        self.receive_retry = retry;
        self
    }

    /// Process one delivery and settle it with the broker
    pub async fn handle<D: Delivery + ?Sized>(&self, delivery: &D) -> ConsumptionOutcome {
        let outcome = self.processor.process(delivery.payload()).await;

        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }

        let settled = match outcome.disposition(self.redelivery_delay) {
            Disposition::Ack => delivery.ack().await,
            Disposition::Reject(rejection) => {
                debug!(?rejection, %outcome, "Rejecting message");
                delivery.reject(rejection).await
            }
        };

        match settled {
            Ok(()) => debug!(%outcome, "Message settled"),
            // The broker redelivers after ack_wait when a settlement is lost
            Err(e) => error!(%outcome, error = %e, "Failed to settle message"),
        }

        outcome
    }

    /// Drive a stream of deliveries until shutdown, disconnect or too many
    /// consecutive receive errors.
    ///
    /// Shutdown is only observed while waiting for the next delivery, so a
    /// message that has been received is always processed and settled.
    pub async fn consume<S, D, E>(
        &self,
        deliveries: S,
        shutdown: &CancellationToken,
    ) -> Result<StreamExit, SubscriberError>
    where
        S: Stream<Item = Result<D, E>>,
        D: Delivery,
        E: Display,
    {
        let mut deliveries = std::pin::pin!(deliveries);
        let mut backoff = self.receive_retry.to_exponential_backoff();
        let mut consecutive_failures = 0u32;
        let mut handled = 0u64;

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(handled, "🛑 Shutdown requested, no further deliveries accepted");
                    return Ok(StreamExit::Shutdown);
                }
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    consecutive_failures = 0;
                    backoff.reset();
                    self.handle(&delivery).await;
                    handled += 1;
                }
                Some(Err(e)) => {
                    consecutive_failures += 1;
                    if consecutive_failures >= self.receive_retry.max_attempts {
                        error!(
                            consecutive_failures,
                            error = %e,
                            "Giving up on message stream"
                        );
                        return Err(SubscriberError::Connection(format!(
                            "{} consecutive receive errors, last: {}",
                            consecutive_failures, e
                        )));
                    }

                    let delay = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.receive_retry.initial_delay());
                    warn!(
                        consecutive_failures,
                        error = %e,
                        "Error receiving message, retrying in {:?}",
                        delay
                    );

                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(StreamExit::Shutdown),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    warn!(handled, "Message stream ended");
                    return Ok(StreamExit::Disconnected);
                }
            }
        }
    }
}

/// Connect to NATS, retrying with backoff before surfacing the failure
pub async fn connect(config: &SubscriberConfig) -> Result<Client, SubscriberError> {
    info!("🔌 Connecting to NATS at: {}", config.nats_url);

    let client = retry_with_backoff(&config.retry_config(), || async {
        async_nats::ConnectOptions::new()
            .name(&config.service_name)
            .connect(&config.nats_url)
            .await
            .map_err(|e| SubscriberError::Connection(format!("Failed to connect to NATS: {}", e)))
    })
    .await?;

    info!("✅ Connected to NATS");
    Ok(client)
}

/// [`connect`] that gives up as soon as `shutdown` is cancelled, returning
/// `None` in that case
pub async fn connect_until_shutdown(
    config: &SubscriberConfig,
    shutdown: &CancellationToken,
) -> Result<Option<Client>, SubscriberError> {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            info!("Shutdown requested before the NATS connection was established");
            Ok(None)
        }
        client = connect(config) => client.map(Some),
    }
}

/// Durable, file-backed work queue holding medication events
pub fn stream_config(config: &SubscriberConfig) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: config.nats_stream_name.clone(),
        description: Some("Medication timing events".to_string()),
        subjects: vec![config.nats_subject.clone()],
        retention: jetstream::stream::RetentionPolicy::WorkQueue,
        storage: jetstream::stream::StorageType::File,
        discard: jetstream::stream::DiscardPolicy::Old,
        ..Default::default()
    }
}

/// Durable pull consumer with manual acks and a single message in flight
pub fn consumer_config(config: &SubscriberConfig) -> jetstream::consumer::pull::Config {
    jetstream::consumer::pull::Config {
        durable_name: Some(config.nats_consumer_name.clone()),
        description: Some("Medicine timer subscriber".to_string()),
        filter_subject: config.nats_subject.clone(),
        ack_policy: jetstream::consumer::AckPolicy::Explicit,
        ack_wait: config.ack_wait(),
        max_deliver: config.max_deliver,
        max_ack_pending: 1,
        replay_policy: jetstream::consumer::ReplayPolicy::Instant,
        ..Default::default()
    }
}

/// Consumer settings that must match for an existing durable consumer to be
/// reused as-is. Returns the names of the fields that differ.
pub fn consumer_config_drift(
    existing: &jetstream::consumer::Config,
    desired: &jetstream::consumer::pull::Config,
) -> Vec<&'static str> {
    let mut drift = Vec::new();
    if existing.max_ack_pending != desired.max_ack_pending {
        drift.push("max_ack_pending");
    }
    if existing.ack_policy != desired.ack_policy {
        drift.push("ack_policy");
    }
    if existing.filter_subject != desired.filter_subject {
        drift.push("filter_subject");
    }
    if existing.max_deliver != desired.max_deliver {
        drift.push("max_deliver");
    }
    if existing.ack_wait != desired.ack_wait {
        drift.push("ack_wait");
    }
    drift
}

/// Broker operations the consumer loop depends on
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// Handle to the declared queue
    type Queue: Send + Sync;
    type Message: Delivery;
    type ReceiveError: Display;
    type Messages: Stream<Item = Result<Self::Message, Self::ReceiveError>> + Send;

    /// Idempotently declare the durable queue and its consumer
    async fn declare_queue(&self) -> Result<Self::Queue, SubscriberError>;

    async fn open_messages(&self, queue: &Self::Queue) -> Result<Self::Messages, SubscriberError>;

    /// Release the connection; called once when consumption ends
    async fn close(&self);
}

/// JetStream work queue with a durable pull consumer
pub struct JetStreamBroker {
    client: Client,
    jetstream: jetstream::Context,
    config: SubscriberConfig,
}

impl JetStreamBroker {
    pub fn new(client: Client, config: SubscriberConfig) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            config,
        }
    }

    async fn ensure_stream(&self) -> Result<jetstream::stream::Stream, SubscriberError> {
        let stream_name = &self.config.nats_stream_name;

        match self.jetstream.get_stream(stream_name).await {
            Ok(stream) => {
                debug!("📖 Using existing stream: {}", stream_name);
                Ok(stream)
            }
            Err(_) => {
                info!("🆕 Creating stream: {}", stream_name);
                self.jetstream
                    .create_stream(stream_config(&self.config))
                    .await
                    .map_err(|e| {
                        SubscriberError::StreamSetup(format!(
                            "Failed to create stream {}: {}",
                            stream_name, e
                        ))
                    })
            }
        }
    }

    async fn ensure_consumer(
        &self,
        stream: &jetstream::stream::Stream,
    ) -> Result<PullConsumer, SubscriberError> {
        let consumer_name = &self.config.nats_consumer_name;
        let desired = consumer_config(&self.config);

        let existing = match stream
            .get_consumer::<jetstream::consumer::pull::Config>(consumer_name)
            .await
        {
            Ok(consumer) => consumer,
            Err(_) => {
                info!("🆕 Creating consumer: {}", consumer_name);
                return stream.create_consumer(desired).await.map_err(|e| {
                    SubscriberError::StreamSetup(format!(
                        "Failed to create consumer {}: {}",
                        consumer_name, e
                    ))
                });
            }
        };

        let drift = consumer_config_drift(&existing.cached_info().config, &desired);
        if drift.is_empty() {
            debug!("📖 Using existing consumer: {}", consumer_name);
            return Ok(existing);
        }

        warn!(
            consumer = %consumer_name,
            fields = ?drift,
            "Existing consumer settings differ, updating"
        );
        let updated = stream.create_consumer(desired.clone()).await.map_err(|e| {
            SubscriberError::StreamSetup(format!(
                "Failed to update consumer {} ({}): {}",
                consumer_name,
                drift.join(", "),
                e
            ))
        })?;

        let remaining = consumer_config_drift(&updated.cached_info().config, &desired);
        if !remaining.is_empty() {
            return Err(SubscriberError::StreamSetup(format!(
                "Consumer {} still differs after update: {}",
                consumer_name,
                remaining.join(", ")
            )));
        }
        Ok(updated)
    }
}

#[async_trait]
impl QueueBroker for JetStreamBroker {
    type Queue = PullConsumer;
    type Message = jetstream::Message;
    type ReceiveError = jetstream::consumer::pull::MessagesError;
    type Messages = jetstream::consumer::pull::Stream;

    async fn declare_queue(&self) -> Result<PullConsumer, SubscriberError> {
        let stream = self.ensure_stream().await?;
        info!("📡 Stream '{}' ready", self.config.nats_stream_name);

        let consumer = self.ensure_consumer(&stream).await?;
        info!("👂 Consumer '{}' ready", self.config.nats_consumer_name);

        Ok(consumer)
    }

    async fn open_messages(
        &self,
        consumer: &PullConsumer,
    ) -> Result<jetstream::consumer::pull::Stream, SubscriberError> {
        consumer
            .stream()
            .max_messages_per_batch(1)
            .messages()
            .await
            .map_err(|e| {
                SubscriberError::StreamSetup(format!("Failed to open message stream: {}", e))
            })
    }

    async fn close(&self) {
        info!("🔄 Draining NATS connection");
        if let Err(e) = self.client.drain().await {
            warn!(error = %e, "Failed to drain NATS connection");
        }
    }
}

pub struct MessageConsumer<B: QueueBroker = JetStreamBroker> {
    broker: B,
    subject: String,
    retry: RetryConfig,
    handler: DeliveryHandler,
}

impl<B: QueueBroker> MessageConsumer<B> {
    pub fn new(broker: B, config: &SubscriberConfig, processor: MedicationProcessor) -> Self {
        let handler = DeliveryHandler::new(processor)
            .with_redelivery_delay(config.redelivery_delay())
            .with_settle_delay(config.settle_delay())
            .with_receive_retry(config.retry_config());

        Self {
            broker,
            subject: config.nats_subject.clone(),
            retry: config.retry_config(),
            handler,
        }
    }

    /// Consume until `shutdown` is cancelled or the broker is lost for good.
    ///
    /// The broker is closed before returning on every path.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SubscriberError> {
        info!("🎯 Starting medication consumer for subject: {}", self.subject);

        let result = self.consume_until_shutdown(&shutdown).await;
        self.broker.close().await;

        match &result {
            Ok(()) => info!("Consumer stopped gracefully"),
            Err(e) => error!(error = %e, "Consumer stopped"),
        }
        result
    }

    async fn consume_until_shutdown(
        &self,
        shutdown: &CancellationToken,
    ) -> Result<(), SubscriberError> {
        let queue = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            queue = retry_with_backoff(&self.retry, || self.broker.declare_queue()) => queue?,
        };

        loop {
            let messages = tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                messages = retry_with_backoff(&self.retry, || self.broker.open_messages(&queue)) => messages?,
            };

            info!("🔄 Waiting for medication events");
            match self.handler.consume(messages, shutdown).await? {
                StreamExit::Shutdown => return Ok(()),
                StreamExit::Disconnected => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.retry.initial_delay()) => {}
                    }
                    info!("Re-opening message stream");
                }
            }
        }
    }
}
