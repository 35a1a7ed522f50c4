//! Delivery of one logical send with deferred, bounded retries
//!
//! A send that fails transiently is not re-issued right away. It parks until
//! the session is registered again and re-issues the identical entries under
//! the same sequence id, so the broker can deduplicate a copy that did get
//! persisted. Writes are ordered by sequence id: a send only goes out once
//! every older unfinished send has been written under the current
//! registration, so retries never land behind newer ids.
//!
//! ```text
//! wait for turn ─▶ write ──ok────────────────────────────▶ receipt
//!      ▲             │
//!      │             └─transient─▶ back in line (same sequence id)
//!      │                                 │
//!      └─────────────────────────────────┘
//!      │ (operation timeout without progress)
//!      └─────────────────────────────────────────────────▶ Timeout
//! ```

use crate::correlator::{CorrelationKey, PendingResponse};
use crate::error::PulsarFlexError;
use crate::metrics::Timer;
use crate::producer::ProducerInner;
use crate::protocol::{now_millis, BaseCommand, CommandSend, MessageEntry, SendReceipt, SequenceId};
use crate::reconnect::{self, ReconnectCause};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub(crate) struct ReliableSend {
    inner: Arc<ProducerInner>,
    sequence_id: SequenceId,
    entries: Vec<MessageEntry>,
    batched: bool,
    publish_time: u64,
}

impl ReliableSend {
    /// `sequence_id` must come from `SessionState::allocate_sequence`; it is
    /// released when this value is dropped
    pub(crate) fn new(
        inner: Arc<ProducerInner>,
        sequence_id: SequenceId,
        entries: Vec<MessageEntry>,
        batched: bool,
    ) -> Self {
        Self {
            inner,
            sequence_id,
            entries,
            batched,
            publish_time: now_millis(),
        }
    }

    pub(crate) async fn run(self) -> Result<SendReceipt, PulsarFlexError> {
        let timer = Timer::start();
        let policy = &self.inner.config.send_retry;
        let metrics = self.inner.client.metrics();
        let producer_id = self.inner.producer_id;
        let sequence_id = self.sequence_id;
        let mut retries = 0;

        loop {
            let err = match self.attempt().await {
                Ok(receipt) => {
                    let bytes: usize = self.entries.iter().map(|e| e.payload.len()).sum();
                    metrics.record_send(
                        self.entries.len() as u64,
                        bytes as u64,
                        self.batched,
                        timer.elapsed(),
                    );
                    debug!(producer_id, sequence_id, retries, "Send acknowledged");
                    return Ok(receipt);
                }
                Err(e) => e,
            };

            if !err.is_transient() {
                metrics.record_send_error();
                return Err(err);
            }
            if retries >= policy.max_retries {
                error!(producer_id, sequence_id, "Send retries exhausted: {}", err);
                metrics.record_send_error();
                return Err(PulsarFlexError::RetriesExhausted {
                    attempts: retries + 1,
                    last: Box::new(err),
                });
            }

            warn!(producer_id, sequence_id, "Send failed, waiting for producer to become active: {}", err);
            self.inner.state.lock().mark_unwritten(sequence_id);

            // A rejected send on a live registration needs a fresh one before
            // anything can be written again
            if matches!(err, PulsarFlexError::SendRejected { .. }) {
                reconnect::trigger(&self.inner, ReconnectCause::SendRejected);
            }

            retries += 1;
            metrics.record_send_retry();
        }
    }

    async fn attempt(&self) -> Result<SendReceipt, PulsarFlexError> {
        let pending = self.wait_for_turn().await?;

        match pending.wait(self.inner.operation_timeout()).await? {
            BaseCommand::SendReceipt(receipt) => Ok(receipt),
            other => Err(PulsarFlexError::protocol(format!(
                "Unexpected {} response to send",
                other.name()
            ))),
        }
    }

    /// Park until this send may be written, then write it
    async fn wait_for_turn(&self) -> Result<PendingResponse, PulsarFlexError> {
        let limit = self.inner.operation_timeout();

        loop {
            let seen = self.inner.activation.generation();
            if let Some(pending) = self.try_write()? {
                return Ok(pending);
            }
            if !self.inner.activation.wait_after(seen, limit).await {
                return Err(PulsarFlexError::timeout(limit.as_millis() as u64));
            }
        }
    }

    /// The turn check and the write happen under one lock so the connection
    /// sees sends in sequence order
    fn try_write(&self) -> Result<Option<PendingResponse>, PulsarFlexError> {
        let mut state = self.inner.state.lock();
        let Some((connection, producer_name)) = state.send_turn(self.sequence_id)? else {
            return Ok(None);
        };

        let command = BaseCommand::Send(CommandSend {
            producer_id: self.inner.producer_id,
            sequence_id: self.sequence_id,
            producer_name,
            publish_time: self.publish_time,
            batched: self.batched,
            entries: self.entries.clone(),
        });
        let key = CorrelationKey::Send {
            producer_id: self.inner.producer_id,
            sequence_id: self.sequence_id,
        };

        let pending = connection.request(key, command)?;
        state.mark_written(self.sequence_id);
        drop(state);

        self.inner.activation.fire();
        Ok(Some(pending))
    }
}

impl Drop for ReliableSend {
    fn drop(&mut self) {
        self.inner.state.lock().finish(self.sequence_id);
        self.inner.activation.fire();
    }
}
