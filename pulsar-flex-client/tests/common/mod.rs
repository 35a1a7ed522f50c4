//! Scripted in-process broker for integration tests

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use pulsar_flex_client::error::ServerError;
use pulsar_flex_client::protocol::{BaseCommand, CommandSend, PulsarCodec, SendReceipt, PROTOCOL_VERSION};
use pulsar_flex_client::{ProducerBuilder, RetryConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

/// How the broker answers; adjustable while the test runs
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Last sequence id reported for a producer name the broker has not seen
    pub initial_last_sequence_id: i64,
    /// Name handed out when the producer does not request one
    pub assigned_name: String,
    /// Answer registrations with this error
    pub reject_producer: Option<ServerError>,
    /// Drop the connection instead of answering this many sends
    pub drop_on_send: usize,
    /// Answer this many sends with a SendError
    pub send_errors: usize,
    /// Never answer sends
    pub silent_sends: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            initial_last_sequence_id: -1,
            assigned_name: "p-1".to_string(),
            reject_producer: None,
            drop_on_send: 0,
            send_errors: 0,
            silent_sends: false,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    behavior: Mutex<Behavior>,
    received: Mutex<Vec<BaseCommand>>,
    persisted: Mutex<HashMap<String, i64>>,
    connections: Mutex<usize>,
    entry_ids: Mutex<u64>,
}

pub struct MockBroker {
    addr: String,
    state: Arc<BrokerState>,
    disconnect: broadcast::Sender<()>,
    close_producer: broadcast::Sender<u64>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockBroker {
    pub async fn start(behavior: Behavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let state = Arc::new(BrokerState::default());
        *state.behavior.lock() = behavior;
        let (disconnect, _) = broadcast::channel(16);
        let (close_producer, _) = broadcast::channel(16);

        let task = {
            let state = state.clone();
            let disconnect = disconnect.clone();
            let close_producer = close_producer.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    *state.connections.lock() += 1;
                    tokio::spawn(serve(
                        stream,
                        state.clone(),
                        disconnect.subscribe(),
                        close_producer.subscribe(),
                    ));
                }
            })
        };

        Self {
            addr,
            state,
            disconnect,
            close_producer,
            _task: task,
        }
    }

    pub fn addr(&self) -> String {
        self.addr.clone()
    }

    /// Producer builder pointed at this broker with fast retries
    pub fn producer(&self, topic: &str) -> ProducerBuilder {
        ProducerBuilder::new()
            .discovery_servers(vec![self.addr()])
            .topic(topic)
            .operation_timeout(Duration::from_secs(5))
            .send_retry(fast_retry(3))
            .reconnect_retry(fast_retry(3))
    }

    pub fn update(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.state.behavior.lock());
    }

    /// Drop every open connection
    pub fn disconnect_all(&self) {
        let _ = self.disconnect.send(());
    }

    /// Ask the given producer to reconnect
    pub fn close_producer(&self, producer_id: u64) {
        let _ = self.close_producer.send(producer_id);
    }

    pub fn connections(&self) -> usize {
        *self.state.connections.lock()
    }

    pub fn received(&self) -> Vec<BaseCommand> {
        self.state.received.lock().clone()
    }

    pub fn sends(&self) -> Vec<CommandSend> {
        self.received()
            .into_iter()
            .filter_map(|c| match c {
                BaseCommand::Send(send) => Some(send),
                _ => None,
            })
            .collect()
    }

    /// Producer registration commands in arrival order
    pub fn registrations(&self) -> Vec<BaseCommand> {
        self.received()
            .into_iter()
            .filter(|c| matches!(c, BaseCommand::Producer { .. }))
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.received()
            .iter()
            .filter(|c| matches!(c, BaseCommand::CloseProducer { .. }))
            .count()
    }
}

pub fn fast_retry(max_retries: usize) -> RetryConfig {
    RetryConfig {
        max_retries,
        initial_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
        multiplier: 2.0,
        jitter: false,
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("pulsar_flex_client=debug")
        .try_init();
}

/// Poll `condition` until it holds or five seconds pass
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn serve(
    stream: TcpStream,
    state: Arc<BrokerState>,
    mut disconnect: broadcast::Receiver<()>,
    mut close_producer: broadcast::Receiver<u64>,
) {
    let mut framed = Framed::new(stream, PulsarCodec::new());

    loop {
        tokio::select! {
            _ = disconnect.recv() => return,

            producer_id = close_producer.recv() => {
                if let Ok(producer_id) = producer_id {
                    let close = BaseCommand::CloseProducer { producer_id, request_id: u64::MAX };
                    if framed.send(close).await.is_err() {
                        return;
                    }
                }
            }

            frame = framed.next() => {
                let Some(Ok(command)) = frame else {
                    return;
                };
                if !matches!(command, BaseCommand::Connect { .. } | BaseCommand::Pong) {
                    state.received.lock().push(command.clone());
                }

                let reply = match respond(&state, command) {
                    Reply::Send(reply) => reply,
                    Reply::Nothing => continue,
                    Reply::Drop => return,
                };
                if framed.send(reply).await.is_err() {
                    return;
                }
            }
        }
    }
}

enum Reply {
    Send(BaseCommand),
    Nothing,
    Drop,
}

fn respond(state: &BrokerState, command: BaseCommand) -> Reply {
    let mut behavior = state.behavior.lock();

    match command {
        BaseCommand::Connect { .. } => Reply::Send(BaseCommand::Connected {
            server_version: "mock-broker".to_string(),
            protocol_version: PROTOCOL_VERSION,
        }),
        BaseCommand::Producer {
            request_id,
            producer_name,
            ..
        } => {
            if let Some(error) = behavior.reject_producer {
                return Reply::Send(BaseCommand::Error {
                    request_id,
                    error,
                    message: "registration rejected".to_string(),
                });
            }
            let name = producer_name.unwrap_or_else(|| behavior.assigned_name.clone());
            let last_sequence_id = state
                .persisted
                .lock()
                .get(&name)
                .copied()
                .unwrap_or(behavior.initial_last_sequence_id);

            Reply::Send(BaseCommand::ProducerSuccess {
                request_id,
                producer_name: name,
                last_sequence_id,
            })
        }
        BaseCommand::CloseProducer { request_id, .. } => {
            Reply::Send(BaseCommand::Success { request_id })
        }
        BaseCommand::Send(send) => {
            if behavior.drop_on_send > 0 {
                behavior.drop_on_send -= 1;
                return Reply::Drop;
            }
            if behavior.silent_sends {
                return Reply::Nothing;
            }
            if behavior.send_errors > 0 {
                behavior.send_errors -= 1;
                return Reply::Send(BaseCommand::SendError {
                    producer_id: send.producer_id,
                    sequence_id: send.sequence_id,
                    error: ServerError::PersistenceError,
                    message: "ledger fenced".to_string(),
                });
            }

            let mut persisted = state.persisted.lock();
            let last = persisted
                .entry(send.producer_name.clone())
                .or_insert(behavior.initial_last_sequence_id);
            *last = (*last).max(send.sequence_id as i64);

            let mut entry_ids = state.entry_ids.lock();
            let entry_id = *entry_ids;
            *entry_ids += 1;

            Reply::Send(BaseCommand::SendReceipt(SendReceipt {
                producer_id: send.producer_id,
                sequence_id: send.sequence_id,
                ledger_id: 1,
                entry_id,
            }))
        }
        BaseCommand::Ping => Reply::Send(BaseCommand::Pong),
        _ => Reply::Nothing,
    }
}
