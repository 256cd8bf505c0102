//! Error types for Meridian client operations.
//!
//! This module defines every error a producer can surface, either directly
//! from `create()`/`send_async()` or through a message's completion handle.
//!
//! ## Error Handling Strategy
//!
//! - **Fatal at creation**: `Configuration`, `Transport` (lookup unreachable)
//! - **Caller may retry**: `QueueFull`, `Timeout`, `Transport`
//! - **Terminal for the message**: `Encryption`, `Interrupted`, `AlreadyClosed`
//!
//! The core never retries a message on its own. Reconnecting and re-sending
//! already formed batches is the transport's job.
//!
//! ## Examples
//!
//! ```ignore
//! use meridian_client::{ClientError, OutgoingMessage};
//!
//! match producer.send(OutgoingMessage::new("order data")).await {
//!     Ok(id) => println!("Published as {}", id),
//!     Err(ClientError::QueueFull { partition }) => {
//!         eprintln!("Partition {} is saturated, backing off", partition);
//!     }
//!     Err(ClientError::Timeout(after)) => eprintln!("No ack after {:?}", after),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Comprehensive error type for Meridian producer operations.
///
/// The enum is `Clone` because one failure (a rejected batch, an encryption
/// failure) resolves the handle of every member message with the same error.
///
/// ## Error Categories
///
/// - **Configuration**: `Configuration`
/// - **Backpressure**: `QueueFull`, `Interrupted`
/// - **Delivery**: `Timeout`, `Transport`
/// - **Processing**: `Encryption`, `Codec`
/// - **Routing**: `InvalidPartition`
/// - **Lifecycle**: `AlreadyClosed`
/// - **Unknown**: `Internal`
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// Invalid producer configuration.
    ///
    /// ## Causes
    /// - Topic not set, or blank
    /// - `CustomPartition` routing without a router
    /// - Encryption keys configured without a key reader
    ///
    /// ## Resolution
    /// - Review builder configuration; this error is raised before any
    ///   network activity
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The pending-message queue is full and `block_if_queue_full` is off.
    ///
    /// ## Resolution
    /// - Retry after some in-flight messages complete
    /// - Raise `max_pending_messages`, or enable `block_if_queue_full`
    #[error("Pending message queue is full for partition {partition}")]
    QueueFull { partition: u32 },

    /// No acknowledgment arrived within `send_timeout`.
    ///
    /// The flow-control slot of the message is freed. The message is not
    /// retried automatically.
    #[error("Message not acknowledged within {0:?}")]
    Timeout(Duration),

    /// Data key generation, key lookup or key wrapping failed while the
    /// crypto failure action is `Fail`.
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Connection or broker-reported failure.
    ///
    /// Wraps the underlying cause when the collaborator provided one.
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Arc<dyn std::error::Error + Send + Sync>>,
    },

    /// A blocked send was cancelled, or the producer closed while it was
    /// waiting for a free slot.
    #[error("Interrupted while waiting for a pending-queue slot")]
    Interrupted,

    /// A router returned a partition outside `[0, partition_count)`.
    #[error("Partition {0} does not exist (partition count: {1})")]
    InvalidPartition(u32, u32),

    /// The producer was closed before or while the message was enqueued.
    #[error("Producer is already closed")]
    AlreadyClosed,

    /// Encoding or compressing a batch failed.
    #[error("Codec error: {0}")]
    Codec(String),

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Transport error without an underlying cause.
    pub fn transport(message: impl Into<String>) -> Self {
        ClientError::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Transport error wrapping the collaborator's own error.
    pub fn transport_with(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        ClientError::Transport {
            message: message.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Whether the caller can reasonably try the same operation again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::QueueFull { .. } | ClientError::Timeout(_) | ClientError::Transport { .. }
        )
    }
}

impl From<meridian_core::Error> for ClientError {
    fn from(err: meridian_core::Error) -> Self {
        ClientError::Codec(err.to_string())
    }
}
