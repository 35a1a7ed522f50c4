//! Matching of asynchronous broker responses to the requests that caused them
//!
//! Responses on a connection may arrive in any order. Create/close exchanges
//! are matched by request id, sends by producer id and sequence id.

use crate::error::PulsarFlexError;
use crate::protocol::{BaseCommand, ProducerId, RequestId, SequenceId};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

type Outcome = Result<BaseCommand, PulsarFlexError>;

/// Key a response is correlated by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    Request(RequestId),
    Send {
        producer_id: ProducerId,
        sequence_id: SequenceId,
    },
}

impl CorrelationKey {
    /// Key of an inbound response, `None` for commands that answer nothing
    pub fn of(command: &BaseCommand) -> Option<Self> {
        match command {
            BaseCommand::ProducerSuccess { request_id, .. }
            | BaseCommand::Success { request_id }
            | BaseCommand::Error { request_id, .. } => Some(CorrelationKey::Request(*request_id)),
            BaseCommand::SendReceipt(receipt) => Some(CorrelationKey::Send {
                producer_id: receipt.producer_id,
                sequence_id: receipt.sequence_id,
            }),
            BaseCommand::SendError {
                producer_id,
                sequence_id,
                ..
            } => Some(CorrelationKey::Send {
                producer_id: *producer_id,
                sequence_id: *sequence_id,
            }),
            _ => None,
        }
    }
}

/// Pending-response table for one connection
#[derive(Debug, Default)]
pub struct ResponseCorrelator {
    pending: DashMap<CorrelationKey, (u64, oneshot::Sender<Outcome>)>,
    tokens: AtomicU64,
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the response for `key`. Must happen before the
    /// request is written so a fast response cannot be missed.
    pub fn register(self: &Arc<Self>, key: CorrelationKey) -> PendingResponse {
        let token = self.tokens.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        if self.pending.insert(key, (token, tx)).is_some() {
            warn!(?key, "Replaced an outstanding registration");
        }

        PendingResponse {
            key,
            token,
            rx,
            correlator: Arc::clone(self),
        }
    }

    /// Deliver an inbound response. Returns false if nobody was waiting.
    pub fn complete(&self, command: BaseCommand) -> bool {
        let Some(key) = CorrelationKey::of(&command) else {
            return false;
        };

        match self.pending.remove(&key) {
            Some((_, (_, tx))) => {
                let _ = tx.send(Ok(command));
                true
            }
            None => {
                debug!(?key, command = command.name(), "No pending request for response");
                false
            }
        }
    }

    /// Fail every pending request, used when the connection goes away
    pub fn fail_all(&self) {
        let keys: Vec<CorrelationKey> = self.pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, (_, tx))) = self.pending.remove(&key) {
                let _ = tx.send(Err(PulsarFlexError::ConnectionLost));
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn cancel(&self, key: CorrelationKey, token: u64) {
        self.pending.remove_if(&key, |_, (t, _)| *t == token);
    }
}

/// Awaitable for one registered response
#[derive(Debug)]
pub struct PendingResponse {
    key: CorrelationKey,
    token: u64,
    rx: oneshot::Receiver<Outcome>,
    correlator: Arc<ResponseCorrelator>,
}

impl PendingResponse {
    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    /// Wait for the response. Error commands become typed errors; no response
    /// within `timeout` fails with `Timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<BaseCommand, PulsarFlexError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Err(_) => Err(PulsarFlexError::timeout(timeout.as_millis() as u64)),
            Ok(Err(_)) => Err(PulsarFlexError::ConnectionLost),
            Ok(Ok(outcome)) => outcome.and_then(into_result),
        }
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        self.correlator.cancel(self.key, self.token);
    }
}

fn into_result(command: BaseCommand) -> Result<BaseCommand, PulsarFlexError> {
    match command {
        BaseCommand::Error { error, message, .. } => Err(PulsarFlexError::BrokerRejected {
            code: error,
            message,
        }),
        BaseCommand::SendError {
            sequence_id,
            error,
            message,
            ..
        } => Err(PulsarFlexError::SendRejected {
            sequence_id,
            code: error,
            message,
        }),
        other => Ok(other),
    }
}
