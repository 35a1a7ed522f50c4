//! A single broker connection
//!
//! The connection owns an I/O task that writes outbound commands, routes
//! inbound responses to the [`ResponseCorrelator`] and publishes unsolicited
//! broker commands as [`ConnectionEvent`]s. When the task ends for any reason
//! all pending requests fail and the cleanup listeners fire exactly once.

use crate::config::ClientConfig;
use crate::correlator::{CorrelationKey, PendingResponse, ResponseCorrelator};
use crate::error::PulsarFlexError;
use crate::protocol::{BaseCommand, ProducerId, PulsarCodec, PROTOCOL_VERSION};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type CleanupListener = Box<dyn FnOnce() + Send + 'static>;

/// Unsolicited broker commands relevant to producers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker retired the producer and expects it to register again
    ProducerClosed { producer_id: ProducerId },
}

#[derive(Default)]
struct LossState {
    lost: AtomicBool,
    listeners: Mutex<Vec<CleanupListener>>,
}

impl LossState {
    fn add(&self, listener: CleanupListener) {
        let mut listeners = self.listeners.lock();
        if self.lost.load(Ordering::SeqCst) {
            drop(listeners);
            listener();
        } else {
            listeners.push(listener);
        }
    }

    /// Flag the loss first so nothing new is accepted while pending requests
    /// are being failed
    fn mark_lost(&self) {
        let _listeners = self.listeners.lock();
        self.lost.store(true, Ordering::SeqCst);
    }

    fn fire_listeners(&self) {
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener();
        }
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }
}

/// Individual connection to a broker
pub struct Connection {
    id: u64,
    broker: String,
    server_version: String,
    outbound: mpsc::UnboundedSender<BaseCommand>,
    correlator: Arc<ResponseCorrelator>,
    events: broadcast::Sender<ConnectionEvent>,
    loss: Arc<LossState>,
    shutdown: CancellationToken,
    _handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("broker", &self.broker)
            .field("lost", &self.loss.is_lost())
            .finish()
    }
}

impl Connection {
    /// Perform the Connect/Connected handshake on `stream` and start the I/O task
    pub async fn establish<S>(
        id: u64,
        broker: String,
        stream: S,
        config: &ClientConfig,
    ) -> Result<Self, PulsarFlexError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut framed = Framed::new(stream, PulsarCodec::new());

        let (auth_method, auth_data) = match &config.jwt {
            Some(jwt) => (Some("token".to_string()), Some(Bytes::from(jwt.clone()))),
            None => (None, None),
        };
        framed
            .send(BaseCommand::Connect {
                client_version: config.client_version.clone(),
                auth_method,
                auth_data,
                protocol_version: PROTOCOL_VERSION,
            })
            .await?;

        let reply = timeout(config.operation_timeout, framed.next())
            .await
            .map_err(|_| PulsarFlexError::timeout(config.operation_timeout.as_millis() as u64))?;

        let server_version = match reply {
            Some(Ok(BaseCommand::Connected { server_version, .. })) => server_version,
            Some(Ok(BaseCommand::Error { error, message, .. })) => {
                return Err(PulsarFlexError::BrokerRejected {
                    code: error,
                    message,
                })
            }
            Some(Ok(other)) => {
                return Err(PulsarFlexError::protocol(format!(
                    "Expected connected, got {}",
                    other.name()
                )))
            }
            Some(Err(e)) => return Err(e),
            None => {
                return Err(PulsarFlexError::connection(format!(
                    "{} closed the connection during handshake",
                    broker
                )))
            }
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);
        let correlator = Arc::new(ResponseCorrelator::new());
        let loss = Arc::new(LossState::default());
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Self::connection_loop(
            broker.clone(),
            framed,
            outbound_rx,
            correlator.clone(),
            events.clone(),
            loss.clone(),
            shutdown.clone(),
        ));

        debug!(connection_id = id, %broker, %server_version, "Handshake complete");

        Ok(Self {
            id,
            broker,
            server_version,
            outbound,
            correlator,
            events,
            loss,
            shutdown,
            _handle: handle,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn broker(&self) -> &str {
        &self.broker
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Write a command without waiting for any response
    pub(crate) fn send(&self, command: BaseCommand) -> Result<(), PulsarFlexError> {
        if self.loss.is_lost() {
            return Err(PulsarFlexError::ConnectionLost);
        }
        self.outbound
            .send(command)
            .map_err(|_| PulsarFlexError::ConnectionLost)
    }

    /// Register for the response to `key`, then write `command`
    pub fn request(
        &self,
        key: CorrelationKey,
        command: BaseCommand,
    ) -> Result<PendingResponse, PulsarFlexError> {
        let pending = self.correlator.register(key);
        self.send(command)?;
        Ok(pending)
    }

    /// Register a callback that fires once when the connection is lost. If
    /// the connection is already gone the callback runs immediately.
    pub fn add_cleanup_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.loss.add(Box::new(listener));
    }

    /// Subscribe to unsolicited broker commands
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Check if connection is healthy
    pub fn is_healthy(&self) -> bool {
        !self.loss.is_lost() && !self.outbound.is_closed()
    }

    /// Stop the I/O task; cleanup listeners fire as for any other loss
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    async fn connection_loop<S>(
        broker: String,
        mut framed: Framed<S, PulsarCodec>,
        mut outbound_rx: mpsc::UnboundedReceiver<BaseCommand>,
        correlator: Arc<ResponseCorrelator>,
        events: broadcast::Sender<ConnectionEvent>,
        loss: Arc<LossState>,
        shutdown: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("Connection to {} shut down", broker);
                    break;
                }

                command = outbound_rx.recv() => {
                    match command {
                        Some(command) => {
                            debug!("Sending {} to {}", command.name(), broker);
                            if let Err(e) = framed.send(command).await {
                                error!("Failed to send command to {}: {}", broker, e);
                                break;
                            }
                        }
                        None => {
                            debug!("Command channel closed for {}", broker);
                            break;
                        }
                    }
                }

                inbound = framed.next() => {
                    match inbound {
                        Some(Ok(BaseCommand::Ping)) => {
                            if let Err(e) = framed.send(BaseCommand::Pong).await {
                                error!("Failed to answer ping from {}: {}", broker, e);
                                break;
                            }
                        }
                        Some(Ok(BaseCommand::Pong)) => {}
                        Some(Ok(BaseCommand::CloseProducer { producer_id, .. })) => {
                            info!(producer_id, "Broker {} closed producer", broker);
                            let _ = events.send(ConnectionEvent::ProducerClosed { producer_id });
                        }
                        Some(Ok(command)) => {
                            if CorrelationKey::of(&command).is_some() {
                                correlator.complete(command);
                            } else {
                                warn!("Unexpected {} command from {}", command.name(), broker);
                            }
                        }
                        Some(Err(e)) => {
                            error!("Error receiving from {}: {}", broker, e);
                            break;
                        }
                        None => {
                            debug!("Stream closed by {}", broker);
                            break;
                        }
                    }
                }
            }
        }

        loss.mark_lost();
        correlator.fail_all();
        loss.fire_listeners();
        info!("Connection to {} closed", broker);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
