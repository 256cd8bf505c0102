//! Batching Logic for the Meridian Producer
//!
//! This module accumulates messages per partition so that many messages share
//! one frame and one acknowledgment. It also holds [`Completion`], the
//! single-resolution result slot every accepted message carries until it is
//! acked, failed or timed out.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  send_async(...) │ Producer API
//! └────────┬─────────┘
//!          │ PendingMessage { entry, completion }
//!          ▼
//! ┌──────────────────────────────┐
//! │  BatchContainer              │ One per partition
//! │  - messages: Vec<Pending>    │
//! │  - size_bytes: usize         │
//! │  - generation: u64           │
//! └────────┬─────────────────────┘
//!          │
//!          ├─→ Flush on count (batching_max_messages)
//!          ├─→ Flush on bytes (batching_max_bytes, overflow flushes first)
//!          ├─→ Flush on time  (batching_max_publish_delay, timer per batch)
//!          ├─→ Flush on explicit flush() / close()
//!          │
//!          ▼
//! ┌──────────────────────────────┐
//! │  Batch                       │ taken atomically under the partition lock
//! └──────────────────────────────┘
//! ```
//!
//! ## States
//!
//! A container is `Empty` or `Accumulating`. Flushing is not a resting state:
//! the batch is moved out in the same critical section that decided to flush,
//! so a concurrent sender always sees either the old batch or an empty one.
//!
//! ## Timer Generations
//!
//! Every batch gets a generation number. The delay timer remembers the
//! generation it was armed for and only flushes if that batch is still the one
//! accumulating, so a timer that lost a race with a count or byte flush is a
//! no-op.
//!
//! ## Thread Safety
//!
//! `BatchContainer` is NOT thread-safe. The producer keeps it behind the
//! partition mutex. `Completion` is shared and safe to resolve from any task.

use crate::error::Result;
use crate::flow_control::Admission;
use meridian_core::{MessageEntry, MessageId};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tracing::{debug, trace};

const PENDING: u8 = 0;
const SUCCEEDED: u8 = 1;
const FAILED: u8 = 2;

/// Single-resolution result slot for one message.
///
/// The ack path, the failure path and the timeout sweep may race to resolve
/// the same message. A compare-and-swap on `state` decides the winner; only
/// the winner releases the flow-control slot and delivers the result, so a
/// slot is freed exactly once and a handle never sees two outcomes.
pub struct Completion {
    sequence_id: u64,
    partition: u32,
    state: AtomicU8,
    sender: Mutex<Option<oneshot::Sender<Result<MessageId>>>>,
    admission: Mutex<Option<Admission>>,
    terminal: Notify,
}

impl Completion {
    /// Create a pending completion and the receiver its handle awaits.
    pub fn new(
        sequence_id: u64,
        partition: u32,
        admission: Option<Admission>,
    ) -> (Arc<Self>, oneshot::Receiver<Result<MessageId>>) {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Self {
            sequence_id,
            partition,
            state: AtomicU8::new(PENDING),
            sender: Mutex::new(Some(tx)),
            admission: Mutex::new(admission),
            terminal: Notify::new(),
        });
        (completion, rx)
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn is_terminal(&self) -> bool {
        self.state.load(Ordering::Acquire) != PENDING
    }

    /// Resolve the message with `result`.
    ///
    /// # Returns
    ///
    /// `true` if this call made the transition, `false` if the message was
    /// already terminal (the result is discarded).
    pub fn complete(&self, result: Result<MessageId>) -> bool {
        let target = if result.is_ok() { SUCCEEDED } else { FAILED };
        if self
            .state
            .compare_exchange(PENDING, target, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // Free the slot before waking the caller, so a caller that sends
        // again right after its handle resolves finds the slot available
        let admission = self
            .admission
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(admission);

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sender) = sender {
            // The caller may have dropped its handle; the outcome still counts
            let _ = sender.send(result);
        }
        self.terminal.notify_waiters();
        true
    }

    /// Wait until the message is terminal, without consuming its result.
    pub async fn wait_terminal(&self) {
        loop {
            let notified = self.terminal.notified();
            if self.is_terminal() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("sequence_id", &self.sequence_id)
            .field("partition", &self.partition)
            .field("terminal", &self.is_terminal())
            .finish()
    }
}

/// A message accepted by the producer and waiting in a batch.
#[derive(Debug)]
pub struct PendingMessage {
    pub entry: MessageEntry,
    pub completion: Arc<Completion>,
}

impl PendingMessage {
    pub fn new(entry: MessageEntry, completion: Arc<Completion>) -> Self {
        Self { entry, completion }
    }

    /// Bytes this message contributes to the batch payload.
    pub fn size_bytes(&self) -> usize {
        self.entry.encoded_len()
    }
}

/// Batch taken out of a container, ready to be encoded.
#[derive(Debug)]
pub struct Batch {
    pub generation: u64,
    pub messages: Vec<PendingMessage>,
    pub size_bytes: usize,
    pub created_at: Instant,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Remove members that already reached a terminal state (timed out while
    /// waiting in the batch).
    ///
    /// # Returns
    ///
    /// Number of members removed.
    pub fn drop_completed(&mut self) -> usize {
        let before = self.messages.len();
        self.messages.retain(|m| !m.completion.is_terminal());
        let removed = before - self.messages.len();
        if removed > 0 {
            self.size_bytes = self.messages.iter().map(PendingMessage::size_bytes).sum();
        }
        removed
    }
}

/// Whether a container holds messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Empty,
    Accumulating,
}

/// Outcome of [`BatchContainer::add`].
#[derive(Debug, Default)]
pub struct AddResult {
    /// Batches that must be sent now, in order
    pub ready: Vec<Batch>,

    /// Generation of the batch this message opened, if it is still
    /// accumulating (the caller arms the delay timer for it)
    pub opened: Option<u64>,
}

/// Per-partition message accumulator.
///
/// # Examples
///
/// ```ignore
/// let mut container = BatchContainer::new(5, 128 * 1024, Duration::from_millis(1));
///
/// let result = container.add(pending);
/// for batch in result.ready {
///     // ... encode and hand to the partition connection ...
/// }
/// if let Some(generation) = result.opened {
///     // ... arm the delay timer for `generation` ...
/// }
/// ```
#[derive(Debug)]
pub struct BatchContainer {
    messages: Vec<PendingMessage>,
    size_bytes: usize,
    created_at: Instant,
    generation: u64,
    max_messages: usize,
    max_bytes: usize,
    max_delay: Duration,
}

impl BatchContainer {
    /// Create an empty container.
    ///
    /// # Arguments
    ///
    /// * `max_messages` - Count trigger (1 disables batching)
    /// * `max_bytes` - Byte trigger
    /// * `max_delay` - Time trigger, measured from the first message
    pub fn new(max_messages: usize, max_bytes: usize, max_delay: Duration) -> Self {
        let max_messages = max_messages.max(1);
        Self {
            messages: Vec::with_capacity(max_messages.min(1024)),
            size_bytes: 0,
            created_at: Instant::now(),
            generation: 0,
            max_messages,
            max_bytes: max_bytes.max(1),
            max_delay,
        }
    }

    /// Append a message and flush whatever the triggers demand.
    ///
    /// If the message would push a non-empty batch past `max_bytes`, the
    /// current batch is flushed first and the message starts the next one.
    /// A message larger than `max_bytes` on its own is sent as a batch of one.
    pub fn add(&mut self, message: PendingMessage) -> AddResult {
        let mut result = AddResult::default();
        let message_bytes = message.size_bytes();

        if !self.messages.is_empty() && self.size_bytes + message_bytes > self.max_bytes {
            trace!(
                size_bytes = self.size_bytes,
                message_bytes = message_bytes,
                max_bytes = self.max_bytes,
                "Batch would overflow, flushing first"
            );
            result.ready.extend(self.take());
        }

        let opens_batch = self.messages.is_empty();
        if opens_batch {
            self.created_at = Instant::now();
        }

        self.size_bytes += message_bytes;
        self.messages.push(message);
        trace!(
            message_count = self.messages.len(),
            size_bytes = self.size_bytes,
            "Appended message to batch"
        );

        if self.messages.len() >= self.max_messages || self.size_bytes >= self.max_bytes {
            result.ready.extend(self.take());
        } else if opens_batch {
            result.opened = Some(self.generation);
        }

        result
    }

    /// Move the accumulating batch out, leaving the container empty.
    pub fn take(&mut self) -> Option<Batch> {
        if self.messages.is_empty() {
            return None;
        }

        let batch = Batch {
            generation: self.generation,
            messages: std::mem::take(&mut self.messages),
            size_bytes: std::mem::replace(&mut self.size_bytes, 0),
            created_at: self.created_at,
        };
        self.generation += 1;

        debug!(
            message_count = batch.messages.len(),
            size_bytes = batch.size_bytes,
            generation = batch.generation,
            "Took batch from container"
        );
        Some(batch)
    }

    /// Take the batch only if `generation` is still accumulating.
    ///
    /// Used by the delay timer; returns `None` when the batch it was armed
    /// for has already been flushed by another trigger.
    pub fn take_generation(&mut self, generation: u64) -> Option<Batch> {
        if self.generation != generation {
            return None;
        }
        self.take()
    }

    pub fn state(&self) -> BatchState {
        if self.messages.is_empty() {
            BatchState::Empty
        } else {
            BatchState::Accumulating
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }
}
