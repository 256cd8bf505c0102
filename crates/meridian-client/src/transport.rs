//! Broker-facing collaborators.
//!
//! The producer core does not speak any wire protocol itself. It talks to the
//! outside world through three seams:
//!
//! ```text
//! ┌──────────┐  resolve(topic)        ┌─────────────────┐
//! │ Producer │ ─────────────────────▶ │ PartitionLookup │  partition count
//! │          │                        └─────────────────┘
//! │          │  connect(topic, p)     ┌─────────────────┐
//! │          │ ─────────────────────▶ │ Transport       │  one connection
//! │          │                        └─────────────────┘  per partition
//! │          │  send(frame)           ┌─────────────────────┐
//! │          │ ─────────────────────▶ │ PartitionConnection │  ack future
//! └──────────┘                        └─────────────────────┘
//! ```
//!
//! ## Ordering Contract
//!
//! [`PartitionConnection::send`] is called synchronously, in flush order, by
//! a single dispatcher per partition. The connection must put frames on the
//! wire in the order it receives them; the returned future resolves when the
//! broker acknowledges the frame. Reconnecting and re-sending formed batches
//! (with their original sequence ids) is the connection's responsibility.

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use meridian_core::BatchFrame;
use std::sync::Arc;

/// Partition layout of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionMetadata {
    /// Number of partitions. Zero means a non-partitioned topic.
    pub partitions: u32,
}

impl PartitionMetadata {
    pub fn new(partitions: u32) -> Self {
        Self { partitions }
    }

    pub fn is_partitioned(&self) -> bool {
        self.partitions > 1
    }

    /// Number of partition connections a producer opens (at least one).
    pub fn connection_count(&self) -> u32 {
        self.partitions.max(1)
    }
}

/// Broker acknowledgment of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReceipt {
    pub ledger_id: u64,
    pub entry_id: u64,
}

impl SendReceipt {
    pub fn new(ledger_id: u64, entry_id: u64) -> Self {
        Self {
            ledger_id,
            entry_id,
        }
    }
}

/// Resolves how many partitions a topic has.
#[async_trait]
pub trait PartitionLookup: Send + Sync {
    /// # Errors
    ///
    /// `ClientError::Transport` when the lookup service is unreachable.
    async fn resolve(&self, topic: &str) -> Result<PartitionMetadata>;
}

/// Opens connections to partition leaders.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, topic: &str, partition: u32) -> Result<Arc<dyn PartitionConnection>>;
}

/// An ordered channel to one partition.
pub trait PartitionConnection: Send + Sync {
    /// Hand a frame over for transmission and get a future for its ack.
    ///
    /// The handoff itself must not block; frames handed over earlier must be
    /// transmitted earlier.
    fn send(&self, frame: BatchFrame) -> BoxFuture<'static, Result<SendReceipt>>;

    /// Release the connection. Unacknowledged frames may fail.
    fn close(&self);
}
