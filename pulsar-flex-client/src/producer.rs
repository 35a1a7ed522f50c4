//! Producer client for publishing sequenced messages to a topic

use crate::client::Client;
use crate::config::{ProducerConfig, ProducerConfigBuilder, RetryConfig};
use crate::correlator::CorrelationKey;
use crate::error::PulsarFlexError;
use crate::metrics::MetricsSnapshot;
use crate::protocol::{AccessMode, BaseCommand, MessageEntry, ProducerId, ProducerMessage, SendReceipt};
use crate::reconnect;
use crate::retry::ReliableSend;
use crate::session::{Phase, SessionState};
use crate::signal::ActivationSignal;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Shared state of one producer, reachable from spawned reconnect tasks
pub(crate) struct ProducerInner {
    pub(crate) client: Arc<Client>,
    pub(crate) config: ProducerConfig,
    pub(crate) producer_id: ProducerId,
    pub(crate) state: Mutex<SessionState>,
    pub(crate) activation: ActivationSignal,
    /// Serializes create, reconnect and close handshakes
    pub(crate) handshake: tokio::sync::Mutex<()>,
    epoch: AtomicU64,
}

impl ProducerInner {
    pub(crate) fn operation_timeout(&self) -> Duration {
        self.client.config().operation_timeout
    }

    pub(crate) fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::Relaxed);
    }

    /// Run the registration handshake. The caller holds `handshake`.
    pub(crate) async fn register(self: &Arc<Self>) -> Result<(), PulsarFlexError> {
        let fallback = self.state.lock().begin_connect()?;

        let connection = match self.client.connect(&self.config.topic).await {
            Ok(connection) => connection,
            Err(e) => {
                self.state.lock().registration_failed(fallback);
                return Err(e);
            }
        };

        let install_hooks = self.state.lock().connected(connection.clone());
        if install_hooks {
            reconnect::install(self, &connection);
        }

        let request_id = self.client.next_request_id();
        let command = BaseCommand::Producer {
            topic: self.config.topic.clone(),
            producer_id: self.producer_id,
            request_id,
            producer_name: self.state.lock().name_to_request(),
            access_mode: self.config.access_mode,
            epoch: self.epoch.load(Ordering::Relaxed),
        };

        debug!(producer_id = self.producer_id, request_id, topic = %self.config.topic, "Registering producer");

        let response = match connection.request(CorrelationKey::Request(request_id), command) {
            Ok(pending) => pending.wait(self.operation_timeout()).await,
            Err(e) => Err(e),
        };

        match response {
            Ok(BaseCommand::ProducerSuccess {
                producer_name,
                last_sequence_id,
                ..
            }) => {
                let registration = self
                    .state
                    .lock()
                    .registered(producer_name.clone(), last_sequence_id);
                self.client.metrics().record_registration();
                info!(
                    producer_id = self.producer_id,
                    %producer_name,
                    last_sequence_id,
                    ?registration,
                    "Producer registered"
                );
                self.activation.fire();
                Ok(())
            }
            Ok(other) => {
                self.state.lock().registration_failed(fallback);
                Err(PulsarFlexError::protocol(format!(
                    "Unexpected {} response to producer registration",
                    other.name()
                )))
            }
            Err(e) => {
                warn!(producer_id = self.producer_id, "Producer registration failed: {}", e);
                self.state.lock().registration_failed(fallback);
                Err(e)
            }
        }
    }

    async fn deregister(&self) -> Result<(), PulsarFlexError> {
        let Some(connection) = self.state.lock().begin_close() else {
            return Ok(());
        };

        let request_id = self.client.next_request_id();
        let command = BaseCommand::CloseProducer {
            producer_id: self.producer_id,
            request_id,
        };

        match connection
            .request(CorrelationKey::Request(request_id), command)?
            .wait(self.operation_timeout())
            .await?
        {
            BaseCommand::Success { .. } => Ok(()),
            other => Err(PulsarFlexError::protocol(format!(
                "Unexpected {} response to close producer",
                other.name()
            ))),
        }
    }

    async fn send_entries(
        self: &Arc<Self>,
        entries: Vec<MessageEntry>,
        batched: bool,
    ) -> Result<SendReceipt, PulsarFlexError> {
        // Assigned before the first suspension point so ids follow call order
        let sequence_id = self.state.lock().allocate_sequence()?;
        ReliableSend::new(self.clone(), sequence_id, entries, batched)
            .run()
            .await
    }
}

/// High-level producer handle.
///
/// Cloning is cheap; all clones share one registration and one sequence
/// cursor.
#[derive(Clone)]
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl std::fmt::Debug for Producer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Producer")
            .field("producer_id", &self.inner.producer_id)
            .field("topic", &self.inner.config.topic)
            .field("phase", &self.phase())
            .finish()
    }
}

impl Producer {
    /// Create a producer with its own client. Nothing is sent until
    /// [`Producer::create`].
    pub fn new(config: ProducerConfig) -> Result<Self, PulsarFlexError> {
        config.validate()?;
        let client = Arc::new(Client::new(config.client_config.clone())?);
        Self::with_client(client, config)
    }

    /// Create a producer on a shared client
    pub fn with_client(client: Arc<Client>, config: ProducerConfig) -> Result<Self, PulsarFlexError> {
        config.validate()?;

        let producer_id = client.next_producer_id();
        let inner = ProducerInner {
            producer_id,
            state: Mutex::new(SessionState::new(config.producer_name.clone())),
            activation: ActivationSignal::new(),
            handshake: tokio::sync::Mutex::new(()),
            epoch: AtomicU64::new(0),
            client,
            config,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn builder() -> ProducerBuilder {
        ProducerBuilder::new()
    }

    /// Open the transport and register the producer with the broker.
    ///
    /// Safe to call again: a registered producer re-registers under the
    /// broker-assigned name and keeps its sequence cursor.
    pub async fn create(&self) -> Result<(), PulsarFlexError> {
        let _handshake = self.inner.handshake.lock().await;
        let result = self.inner.register().await;

        // A failed re-registration gave up the old one; nothing else will
        // retry it, so parked and future sends must fail fast
        if let Err(e) = &result {
            let mut state = self.inner.state.lock();
            if state.phase() == Phase::Reconnecting {
                state.reconnect_failed(e.to_string());
                drop(state);
                self.inner.activation.fire();
            }
        }
        result
    }

    /// Retire the producer on the broker. The connection stays open for
    /// other users of the client.
    pub async fn close(&self) -> Result<(), PulsarFlexError> {
        let _handshake = self.inner.handshake.lock().await;

        let result = self.inner.deregister().await;
        self.inner.state.lock().closed();
        self.inner.activation.fire();

        match &result {
            Ok(()) => info!(producer_id = self.inner.producer_id, "Producer closed"),
            Err(e) => warn!(producer_id = self.inner.producer_id, "Producer closed with error: {}", e),
        }
        result
    }

    /// Publish one message at the next sequence id
    pub async fn send_message(&self, message: ProducerMessage) -> Result<SendReceipt, PulsarFlexError> {
        let entry = message.to_entry()?;
        self.inner.send_entries(vec![entry], false).await
    }

    /// Publish several messages as one batch occupying a single sequence id
    pub async fn send_batch(
        &self,
        messages: Vec<ProducerMessage>,
    ) -> Result<SendReceipt, PulsarFlexError> {
        if messages.is_empty() {
            return Err(PulsarFlexError::EmptyBatch);
        }
        let entries = messages
            .iter()
            .map(ProducerMessage::to_entry)
            .collect::<Result<Vec<_>, _>>()?;
        self.inner.send_entries(entries, true).await
    }

    pub fn producer_id(&self) -> ProducerId {
        self.inner.producer_id
    }

    /// Broker-assigned name, `None` until the first registration succeeds
    pub fn producer_name(&self) -> Option<String> {
        self.inner.state.lock().producer_name().map(str::to_string)
    }

    pub fn topic(&self) -> &str {
        &self.inner.config.topic
    }

    pub fn access_mode(&self) -> AccessMode {
        self.inner.config.access_mode
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase()
    }

    /// Sequence id the next send will use
    pub fn next_sequence_id(&self) -> u64 {
        self.inner.state.lock().next_sequence_id()
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.inner.client
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.client.metrics().snapshot()
    }
}

/// Builder for Producer
pub struct ProducerBuilder {
    config: ProducerConfigBuilder,
}

impl ProducerBuilder {
    /// Create a new producer builder
    pub fn new() -> Self {
        Self {
            config: ProducerConfigBuilder::new(),
        }
    }

    /// Set the discovery server addresses
    pub fn discovery_servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config = self.config.discovery_servers(servers);
        self
    }

    /// Set the JWT credential
    pub fn jwt<S: Into<String>>(mut self, jwt: S) -> Self {
        self.config = self.config.jwt(jwt);
        self
    }

    pub fn topic<S: Into<String>>(mut self, topic: S) -> Self {
        self.config = self.config.topic(topic);
        self
    }

    pub fn access_mode(mut self, access_mode: AccessMode) -> Self {
        self.config = self.config.access_mode(access_mode);
        self
    }

    pub fn producer_name<S: Into<String>>(mut self, name: S) -> Self {
        self.config = self.config.producer_name(name);
        self
    }

    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.operation_timeout(timeout);
        self
    }

    pub fn send_retry(mut self, retry: RetryConfig) -> Self {
        self.config = self.config.send_retry(retry);
        self
    }

    pub fn reconnect_retry(mut self, retry: RetryConfig) -> Self {
        self.config = self.config.reconnect_retry(retry);
        self
    }

    /// Build the producer without contacting the broker
    pub fn build(self) -> Result<Producer, PulsarFlexError> {
        Producer::new(self.config.build())
    }

    /// Build the producer and register it
    pub async fn create(self) -> Result<Producer, PulsarFlexError> {
        let producer = self.build()?;
        producer.create().await?;
        Ok(producer)
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer() -> Producer {
        ProducerBuilder::new()
            .discovery_servers(vec!["localhost:6650"])
            .topic("t1")
            .access_mode(AccessMode::WaitForExclusive)
            .build()
            .unwrap()
    }

    #[test]
    fn test_producer_builder() {
        let producer = producer();

        assert_eq!(producer.topic(), "t1");
        assert_eq!(producer.access_mode(), AccessMode::WaitForExclusive);
        assert_eq!(producer.phase(), Phase::Created);
        assert_eq!(producer.producer_name(), None);
    }

    #[test]
    fn test_builder_requires_topic() {
        let result = ProducerBuilder::new()
            .discovery_servers(vec!["localhost:6650"])
            .build();
        assert!(matches!(result, Err(PulsarFlexError::InvalidConfig { .. })));
    }

    #[test]
    fn test_producers_on_shared_client_get_distinct_ids() {
        let first = producer();
        let config = ProducerConfigBuilder::new().topic("t2").build();
        let second = Producer::with_client(first.client().clone(), config).unwrap();

        assert_ne!(first.producer_id(), second.producer_id());
    }

    #[tokio::test]
    async fn test_missing_payload_fails_before_any_io() {
        let producer = producer();
        let err = producer
            .send_message(ProducerMessage::default())
            .await
            .unwrap_err();

        assert!(matches!(err, PulsarFlexError::PayloadMissing));
        assert_eq!(producer.metrics().connections_created, 0);
        assert_eq!(producer.metrics().connections_failed, 0);
    }

    #[tokio::test]
    async fn test_empty_batch_rejected() {
        let producer = producer();
        assert!(matches!(
            producer.send_batch(Vec::new()).await,
            Err(PulsarFlexError::EmptyBatch)
        ));
    }

    #[tokio::test]
    async fn test_send_before_create_fails() {
        let producer = producer();
        assert!(matches!(
            producer.send_message(ProducerMessage::new("x")).await,
            Err(PulsarFlexError::NotRegistered)
        ));
        assert_eq!(producer.next_sequence_id(), 0);
    }

    #[tokio::test]
    async fn test_close_before_create_is_local() {
        let producer = producer();
        producer.close().await.unwrap();
        assert_eq!(producer.phase(), Phase::Closed);
    }
}
