//! Meridian Client - Producer API
//!
//! This crate implements the client-side publish pipeline of Meridian: it
//! routes messages to partitions, assigns sequence ids, bounds in-flight
//! messages, batches per partition, compresses and optionally encrypts each
//! batch, and resolves every message's handle when the broker answers.
//!
//! The wire protocol lives behind the [`PartitionLookup`], [`Transport`] and
//! [`PartitionConnection`] traits. [`InMemoryBroker`] implements all of them
//! for tests and demos.
//!
//! # Examples
//!
//! ## Producer
//!
//! ```ignore
//! use meridian_client::{InMemoryBroker, OutgoingMessage, ProducerConfig};
//! use std::sync::Arc;
//!
//! let broker = InMemoryBroker::new().with_topic("orders", 4);
//! let producer = ProducerConfig::builder()
//!     .topic("orders")
//!     .batching_max_messages(100)
//!     .create(Arc::new(broker.clone()), Arc::new(broker))
//!     .await?;
//!
//! let id = producer.send(OutgoingMessage::new("order data").key("user123")).await?;
//! println!("Published at {}", id);
//!
//! producer.close().await?;
//! ```
//!
//! ## Encryption
//!
//! ```ignore
//! use meridian_client::{StaticKeyReader, CryptoFailureAction};
//!
//! let keys = StaticKeyReader::new().with_key("orders-key", [7u8; 32]);
//! let producer = ProducerConfig::builder()
//!     .topic("orders")
//!     .crypto_key_reader(Arc::new(keys))
//!     .add_encryption_key("orders-key")
//!     .crypto_failure_action(CryptoFailureAction::Fail)
//!     .create(lookup, transport)
//!     .await?;
//! ```

pub mod batch;
pub mod config;
pub mod crypto;
pub mod error;
pub mod flow_control;
pub mod memory;
pub mod producer;
pub mod retry;
pub mod router;
pub mod sequence;
mod stats;
pub mod transport;

pub use config::{
    CryptoFailureAction, HashingScheme, MessageRoutingMode, ProducerConfig, ProducerConfigBuilder,
    ProducerSettings,
};
pub use crypto::{CryptoKeyReader, EncryptionKeyInfo, MessageCrypto, StaticKeyReader};
pub use error::{ClientError, Result};
pub use flow_control::{Admission, FlowController};
pub use memory::{AckMode, InMemoryBroker};
pub use producer::{OutgoingMessage, Producer, SendHandle};
pub use retry::{retry_with_jittered_backoff, RetryPolicy};
pub use router::{MessageRouter, PartitionRouter};
pub use sequence::SequenceAllocator;
pub use stats::ProducerStatsSnapshot;
pub use transport::{PartitionConnection, PartitionLookup, PartitionMetadata, SendReceipt, Transport};

pub use meridian_core::{BatchFrame, CompressionType, Encryption, MessageId};
