//! Keeps the logical producer registered across connection churn
//!
//! Hooks are installed once per connection: a cleanup listener for loss of
//! the connection and a watcher for broker-initiated `CloseProducer`. Either
//! moves an active session to `Reconnecting` and spawns a re-registration.
//! In-flight sends are not replayed here. The successful registration puts
//! them back in line and fires the activation signal; each send then writes
//! itself again in sequence order.

use crate::connection::{Connection, ConnectionEvent};
use crate::producer::ProducerInner;
use crate::session::Phase;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReconnectCause {
    ConnectionLost { connection_id: u64 },
    BrokerClosed { connection_id: u64 },
    SendRejected,
}

impl ReconnectCause {
    fn connection_id(self) -> Option<u64> {
        match self {
            ReconnectCause::ConnectionLost { connection_id }
            | ReconnectCause::BrokerClosed { connection_id } => Some(connection_id),
            ReconnectCause::SendRejected => None,
        }
    }
}

pub(crate) fn install(inner: &Arc<ProducerInner>, connection: &Arc<Connection>) {
    let connection_id = connection.id();

    let weak = Arc::downgrade(inner);
    connection.add_cleanup_listener(move || {
        if let Some(inner) = weak.upgrade() {
            trigger(&inner, ReconnectCause::ConnectionLost { connection_id });
        }
    });

    let events = connection.events();
    tokio::spawn(watch_events(Arc::downgrade(inner), events, connection_id));

    debug!(producer_id = inner.producer_id, connection_id, "Reconnect hooks installed");
}

async fn watch_events(
    weak: Weak<ProducerInner>,
    mut events: tokio::sync::broadcast::Receiver<ConnectionEvent>,
    connection_id: u64,
) {
    loop {
        match events.recv().await {
            Ok(ConnectionEvent::ProducerClosed { producer_id }) => {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if producer_id == inner.producer_id {
                    trigger(&inner, ReconnectCause::BrokerClosed { connection_id });
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(connection_id, skipped, "Connection event watcher lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Start a re-registration unless one is already running or the loss is
/// about a connection the session no longer uses
pub(crate) fn trigger(inner: &Arc<ProducerInner>, cause: ReconnectCause) {
    if !inner.state.lock().begin_reconnect(cause.connection_id()) {
        debug!(producer_id = inner.producer_id, ?cause, "Ignoring reconnect trigger");
        return;
    }

    warn!(producer_id = inner.producer_id, ?cause, "Producer lost its registration, reconnecting");
    tokio::spawn(run(inner.clone()));
}

async fn run(inner: Arc<ProducerInner>) {
    let _handshake = inner.handshake.lock().await;

    // Closed, or re-created by the caller, while waiting for the lock
    if inner.state.lock().phase() != Phase::Reconnecting {
        return;
    }

    let metrics = inner.client.metrics();
    metrics.record_reconnect();
    inner.bump_epoch();

    let policy = &inner.config.reconnect_retry;
    let mut retries = 0;

    loop {
        let err = match inner.register().await {
            Ok(()) => {
                info!(producer_id = inner.producer_id, retries, "Producer reconnected");
                return;
            }
            Err(e) => e,
        };

        let retryable = err.is_connection_error()
            || err.is_timeout()
            || err.server_error().map_or(false, |code| code.is_retryable());

        if retryable && retries < policy.max_retries {
            let delay = policy.backoff(retries);
            retries += 1;
            warn!(
                producer_id = inner.producer_id,
                retries,
                delay_ms = delay.as_millis() as u64,
                "Re-registration failed, retrying: {}",
                err
            );
            sleep(delay).await;
            continue;
        }

        error!(producer_id = inner.producer_id, "Reconnect failed: {}", err);
        metrics.record_reconnect_failure();
        inner.state.lock().reconnect_failed(err.to_string());
        inner.activation.fire();
        return;
    }
}
