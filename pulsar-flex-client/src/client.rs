//! Transport: broker connection management shared by producers

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::error::PulsarFlexError;
use crate::metrics::ClientMetrics;
use crate::protocol::{ProducerId, RequestId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Client owning the broker connection and the id counters
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    current: Mutex<Option<Arc<Connection>>>,
    connection_ids: AtomicU64,
    producer_ids: AtomicU64,
    request_ids: AtomicU64,
    metrics: Arc<ClientMetrics>,
}

impl Client {
    /// Create a new client; no connection is opened until first use
    pub fn new(config: ClientConfig) -> Result<Self, PulsarFlexError> {
        config.validate()?;

        Ok(Self {
            config,
            current: Mutex::new(None),
            connection_ids: AtomicU64::new(0),
            producer_ids: AtomicU64::new(0),
            request_ids: AtomicU64::new(0),
            metrics: Arc::new(ClientMetrics::default()),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Allocate a producer id, unique for the lifetime of this client
    pub fn next_producer_id(&self) -> ProducerId {
        self.producer_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocate a request id for a create/close exchange
    pub fn next_request_id(&self) -> RequestId {
        self.request_ids.fetch_add(1, Ordering::Relaxed)
    }

    /// Get a connection usable for `topic`, reusing the current one while it
    /// is healthy and otherwise dialing the discovery servers in order
    pub async fn connect(&self, topic: &str) -> Result<Arc<Connection>, PulsarFlexError> {
        let mut current = self.current.lock().await;

        if let Some(conn) = current.as_ref() {
            if conn.is_healthy() {
                return Ok(conn.clone());
            }
            debug!(connection_id = conn.id(), "Discarding lost connection");
        }
        *current = None;

        for server in &self.config.discovery_servers {
            match self.dial(server).await {
                Ok(conn) => {
                    self.metrics.record_connection_created();
                    info!(topic, broker = %server, connection_id = conn.id(), "Connected to broker");
                    let conn = Arc::new(conn);
                    *current = Some(conn.clone());
                    return Ok(conn);
                }
                Err(e) => {
                    self.metrics.record_connection_failed();
                    warn!("Failed to connect to broker {}: {}", server, e);
                }
            }
        }

        Err(PulsarFlexError::NoBrokersAvailable)
    }

    async fn dial(&self, server: &str) -> Result<Connection, PulsarFlexError> {
        debug!("Creating connection to broker: {}", server);

        let stream = timeout(self.config.connection_timeout, TcpStream::connect(server))
            .await
            .map_err(|_| PulsarFlexError::timeout(self.config.connection_timeout.as_millis() as u64))?
            .map_err(|e| {
                PulsarFlexError::connection(format!("Failed to connect to {}: {}", server, e))
            })?;
        stream.set_nodelay(true)?;

        let id = self.connection_ids.fetch_add(1, Ordering::Relaxed);
        Connection::establish(id, server.to_string(), stream, &self.config).await
    }

    /// Close the current connection, if any
    pub async fn close(&self) {
        if let Some(conn) = self.current.lock().await.take() {
            conn.close();
        }
    }
}
