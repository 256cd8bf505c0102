//! In-memory broker for tests and demos.
//!
//! `InMemoryBroker` implements both [`PartitionLookup`] and [`Transport`]
//! without any network. Frames are recorded in arrival order and acked
//! according to the configured [`AckMode`], which lets tests exercise the
//! producer's batching, ordering, timeout and failure paths
//! deterministically.
//!
//! ```ignore
//! let broker = InMemoryBroker::new().with_topic("orders", 4);
//! let producer = ProducerConfig::builder()
//!     .topic("orders")
//!     .create(Arc::new(broker.clone()), Arc::new(broker.clone()))
//!     .await?;
//!
//! producer.send(OutgoingMessage::new("hello")).await?;
//! assert_eq!(broker.frames().len(), 1);
//! ```

use crate::error::{ClientError, Result};
use crate::transport::{PartitionConnection, PartitionLookup, PartitionMetadata, SendReceipt, Transport};
use async_trait::async_trait;
use futures::future::{self, BoxFuture, FutureExt};
use meridian_core::{BatchFrame, MessageEntry};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// How the broker answers frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Ack every frame as soon as it is received
    #[default]
    Immediate,
    /// Hold acks until [`InMemoryBroker::release_acks`] or
    /// [`InMemoryBroker::fail_held`]
    Manual,
    /// Never ack; the future stays pending until the connection closes
    Never,
}

type AckSender = oneshot::Sender<Result<SendReceipt>>;

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, u32>,
    ack_mode: AckMode,
    frames: Vec<BatchFrame>,
    next_entry_id: HashMap<(String, u32), u64>,
    held: VecDeque<(SendReceipt, AckSender)>,
    parked: Vec<AckSender>,
    failing_lookups: usize,
    failing_sends: usize,
    lookups: usize,
    connections_opened: usize,
    connections_closed: usize,
}

#[derive(Default)]
struct BrokerInner {
    state: Mutex<BrokerState>,
    unreachable: AtomicBool,
}

impl BrokerInner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Loopback broker. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `topic` with `partitions` partitions (0 = non-partitioned).
    /// Unknown topics resolve as non-partitioned.
    pub fn with_topic(self, topic: impl Into<String>, partitions: u32) -> Self {
        self.create_topic(topic, partitions);
        self
    }

    pub fn with_ack_mode(self, mode: AckMode) -> Self {
        self.set_ack_mode(mode);
        self
    }

    pub fn create_topic(&self, topic: impl Into<String>, partitions: u32) {
        self.inner.state().topics.insert(topic.into(), partitions);
    }

    pub fn set_ack_mode(&self, mode: AckMode) {
        self.inner.state().ack_mode = mode;
    }

    /// Make lookups and connects fail with a transport error.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Fail the next `n` lookups with a transport error.
    pub fn fail_next_lookups(&self, n: usize) {
        self.inner.state().failing_lookups = n;
    }

    /// Reject the next `n` frames with a transport error.
    pub fn fail_next_sends(&self, n: usize) {
        self.inner.state().failing_sends = n;
    }

    /// Ack up to `n` held frames, oldest first.
    ///
    /// # Returns
    ///
    /// Number of acks released.
    pub fn release_acks(&self, n: usize) -> usize {
        let released: Vec<_> = {
            let mut state = self.inner.state();
            let n = n.min(state.held.len());
            state.held.drain(..n).collect()
        };
        let count = released.len();
        for (receipt, tx) in released {
            let _ = tx.send(Ok(receipt));
        }
        count
    }

    /// Ack every held frame.
    pub fn release_all_acks(&self) -> usize {
        self.release_acks(usize::MAX)
    }

    /// Fail up to `n` held frames, oldest first.
    pub fn fail_held(&self, n: usize, message: &str) -> usize {
        let failed: Vec<_> = {
            let mut state = self.inner.state();
            let n = n.min(state.held.len());
            state.held.drain(..n).collect()
        };
        let count = failed.len();
        for (_, tx) in failed {
            let _ = tx.send(Err(ClientError::transport(message)));
        }
        count
    }

    pub fn held_acks(&self) -> usize {
        self.inner.state().held.len()
    }

    /// Every frame received, in arrival order.
    pub fn frames(&self) -> Vec<BatchFrame> {
        self.inner.state().frames.clone()
    }

    pub fn frames_for(&self, partition: u32) -> Vec<BatchFrame> {
        self.inner
            .state()
            .frames
            .iter()
            .filter(|f| f.partition == partition)
            .cloned()
            .collect()
    }

    /// Decoded entries of every plaintext frame, in arrival order.
    /// Sealed frames are skipped.
    pub fn entries(&self) -> Result<Vec<MessageEntry>> {
        let mut entries = Vec::new();
        for frame in self.frames().iter().filter(|f| !f.is_sealed()) {
            entries.extend(frame.entries()?);
        }
        Ok(entries)
    }

    pub fn lookups(&self) -> usize {
        self.inner.state().lookups
    }

    pub fn connections_opened(&self) -> usize {
        self.inner.state().connections_opened
    }

    pub fn connections_closed(&self) -> usize {
        self.inner.state().connections_closed
    }

    fn check_reachable(&self, what: &str) -> Result<()> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(ClientError::transport(format!("{} unreachable", what)));
        }
        Ok(())
    }
}

impl std::fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state();
        f.debug_struct("InMemoryBroker")
            .field("topics", &state.topics)
            .field("ack_mode", &state.ack_mode)
            .field("frames", &state.frames.len())
            .field("held", &state.held.len())
            .finish()
    }
}

#[async_trait]
impl PartitionLookup for InMemoryBroker {
    async fn resolve(&self, topic: &str) -> Result<PartitionMetadata> {
        self.check_reachable("lookup service")?;

        let mut state = self.inner.state();
        state.lookups += 1;
        if state.failing_lookups > 0 {
            state.failing_lookups -= 1;
            return Err(ClientError::transport("lookup service temporarily unavailable"));
        }

        let partitions = state.topics.get(topic).copied().unwrap_or(0);
        debug!(topic = topic, partitions = partitions, "Resolved topic");
        Ok(PartitionMetadata::new(partitions))
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn connect(&self, topic: &str, partition: u32) -> Result<Arc<dyn PartitionConnection>> {
        self.check_reachable("broker")?;
        self.inner.state().connections_opened += 1;

        Ok(Arc::new(MemoryConnection {
            broker: Arc::clone(&self.inner),
            topic: topic.to_string(),
            partition,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    broker: Arc<BrokerInner>,
    topic: String,
    partition: u32,
    closed: AtomicBool,
}

impl PartitionConnection for MemoryConnection {
    fn send(&self, frame: BatchFrame) -> BoxFuture<'static, Result<SendReceipt>> {
        if self.closed.load(Ordering::SeqCst) {
            return future::ready(Err(ClientError::transport("connection closed"))).boxed();
        }

        let mut state = self.broker.state();
        trace!(
            topic = %self.topic,
            partition = self.partition,
            sequence_id = frame.sequence_id,
            num_messages = frame.num_messages,
            "Broker received frame"
        );
        state.frames.push(frame);

        if state.failing_sends > 0 {
            state.failing_sends -= 1;
            return future::ready(Err(ClientError::transport("broker rejected frame"))).boxed();
        }

        let entry_id = state
            .next_entry_id
            .entry((self.topic.clone(), self.partition))
            .or_insert(0);
        let receipt = SendReceipt::new(self.partition as u64 + 1, *entry_id);
        *entry_id += 1;

        match state.ack_mode {
            AckMode::Immediate => future::ready(Ok(receipt)).boxed(),
            AckMode::Manual => {
                let (tx, rx) = oneshot::channel();
                state.held.push_back((receipt, tx));
                await_ack(rx)
            }
            AckMode::Never => {
                let (tx, rx) = oneshot::channel();
                state.parked.push(tx);
                await_ack(rx)
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut state = self.broker.state();
        state.connections_closed += 1;
        if state.connections_closed >= state.connections_opened {
            // Dropping the senders fails every ack still waiting
            state.parked.clear();
        }
    }
}

fn await_ack(rx: oneshot::Receiver<Result<SendReceipt>>) -> BoxFuture<'static, Result<SendReceipt>> {
    async move {
        rx.await
            .unwrap_or_else(|_| Err(ClientError::transport("connection closed before ack")))
    }
    .boxed()
}
