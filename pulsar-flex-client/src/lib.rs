//! # pulsar-flex client library
//!
//! An async Rust producer for brokers speaking the Pulsar binary protocol.
//!
//! ## Features
//!
//! - **Sequenced publishing**: every logical send gets exactly one sequence
//!   id, assigned in call order, continuing from the broker's last persisted id
//! - **Batches**: a batch of messages occupies a single sequence slot
//! - **Transparent reconnect**: a lost connection or broker-initiated close
//!   re-registers the producer under the same name
//! - **Deferred retries**: sends that fail mid-reconnect park until the
//!   producer is active again, then retry with a bounded budget
//! - **Async/Await**: built on tokio; nothing blocks a worker thread
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pulsar_flex_client::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let producer = ProducerBuilder::new()
//!         .discovery_servers(vec!["localhost:6650"])
//!         .topic("persistent://public/default/orders")
//!         .access_mode(AccessMode::Shared)
//!         .create()
//!         .await?;
//!
//!     let receipt = producer
//!         .send_message(ProducerMessage::new("Hello Pulsar!").with_property("source", "docs"))
//!         .await?;
//!     println!("Persisted as sequence {}", receipt.sequence_id);
//!
//!     producer.close().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod sequence;
pub mod session;
pub mod signal;

mod reconnect;
mod retry;

pub use client::*;
pub use config::*;
pub use error::*;
pub use producer::*;
pub use protocol::{AccessMode, ProducerMessage, SendReceipt};
pub use session::Phase;

/// Client library result type
pub type Result<T> = std::result::Result<T, PulsarFlexError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
