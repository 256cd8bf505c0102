//! Producer API for publishing messages to a Meridian topic.
//!
//! The producer ties the pipeline together: it routes each message to a
//! partition, bounds in-flight messages, batches per partition, encodes,
//! compresses and optionally encrypts each batch, hands it to the partition
//! connection and resolves every message's handle when the broker answers.
//!
//! ## Architecture
//!
//! ```text
//!  send_async(msg)
//!       │
//!       ├─→ PartitionRouter      pick partition
//!       ├─→ FlowController       admit (may wait, no lock held)
//!       │
//!       ▼  partition lock
//! ┌──────────────────────────────────────┐
//! │ SequenceAllocator  assign id         │
//! │ BatchContainer     accumulate        │──┐ count / bytes trigger
//! └──────────────────────────────────────┘  │
//!       ▲ delay timer, flush(), close()  ───┤
//!                                           ▼
//!                          encode → compress → encrypt → BatchFrame
//!                                           │ mpsc (flush order)
//!                                           ▼
//!                          dispatcher task ── connection.send(frame)
//!                                           │ FuturesOrdered (ack order)
//!                                           ▼
//!                          Completion::complete → handle resolves, slot freed
//! ```
//!
//! ## Background Tasks
//!
//! - One dispatcher per partition, alive until `close()`
//! - One delay timer per accumulating batch
//! - One timeout sweep (when `send_timeout` is non-zero)
//!
//! ## Examples
//!
//! ```ignore
//! use meridian_client::{OutgoingMessage, ProducerConfig};
//!
//! let producer = ProducerConfig::builder()
//!     .topic("orders")
//!     .create(lookup, transport)
//!     .await?;
//!
//! // Fire and collect later
//! let handle = producer.send_async(OutgoingMessage::new("order data").key("user123")).await;
//! let id = handle.await?;
//!
//! // Or wait right away
//! let id = producer.send(OutgoingMessage::new("more data")).await?;
//!
//! producer.close().await?;
//! ```

use crate::batch::{Batch, BatchContainer, Completion, PendingMessage};
use crate::config::{validate_topic, CryptoFailureAction, ProducerConfig, ProducerConfigBuilder};
use crate::crypto::MessageCrypto;
use crate::error::{ClientError, Result};
use crate::flow_control::FlowController;
use crate::retry::retry_with_jittered_backoff;
use crate::router::PartitionRouter;
use crate::sequence::SequenceAllocator;
use crate::stats::{ProducerStats, ProducerStatsSnapshot};
use crate::transport::{PartitionConnection, PartitionLookup, SendReceipt, Transport};
use bytes::{Bytes, BytesMut};
use futures::future::BoxFuture;
use futures::stream::{FuturesOrdered, StreamExt};
use meridian_core::{BatchFrame, Encryption, MessageEntry, MessageId};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

const OPEN: u8 = 0;
const CLOSING: u8 = 1;
const CLOSED: u8 = 2;

const MAX_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// A message to publish.
///
/// # Examples
///
/// ```ignore
/// let message = OutgoingMessage::new("order data")
///     .key("user123")
///     .property("source", "checkout")
///     .event_time(1_700_000_000_000);
/// ```
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    payload: Bytes,
    key: Option<String>,
    properties: BTreeMap<String, String>,
    event_time: Option<u64>,
    sequence_id: Option<u64>,
}

impl OutgoingMessage {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            key: None,
            properties: BTreeMap::new(),
            event_time: None,
            sequence_id: None,
        }
    }

    /// Partition key. Keyed messages always land on the same partition under
    /// round-robin routing.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Application event time, ms since epoch.
    pub fn event_time(mut self, millis: u64) -> Self {
        self.event_time = Some(millis);
        self
    }

    /// Use this sequence id instead of the next one from the partition's
    /// counter. The counter is not advanced.
    pub fn sequence_id(mut self, id: u64) -> Self {
        self.sequence_id = Some(id);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    fn into_entry(self, sequence_id: u64) -> MessageEntry {
        MessageEntry {
            sequence_id,
            key: self.key,
            event_time: self.event_time,
            properties: self.properties,
            payload: self.payload,
        }
    }
}

impl From<&'static str> for OutgoingMessage {
    fn from(payload: &'static str) -> Self {
        Self::new(payload)
    }
}

impl From<Vec<u8>> for OutgoingMessage {
    fn from(payload: Vec<u8>) -> Self {
        Self::new(payload)
    }
}

enum HandleState {
    Waiting(oneshot::Receiver<Result<MessageId>>),
    Failed(Option<ClientError>),
}

/// Completion handle for one message.
///
/// Resolves to the broker-assigned [`MessageId`] or to the error that
/// ended the message. Rejections that happen before the message is enqueued
/// (queue full, producer closed, interrupted wait) resolve immediately.
///
/// Dropping the handle does not cancel the message.
pub struct SendHandle {
    sequence_id: Option<u64>,
    partition: Option<u32>,
    state: HandleState,
}

impl SendHandle {
    fn pending(sequence_id: u64, partition: u32, rx: oneshot::Receiver<Result<MessageId>>) -> Self {
        Self {
            sequence_id: Some(sequence_id),
            partition: Some(partition),
            state: HandleState::Waiting(rx),
        }
    }

    fn failed(err: ClientError) -> Self {
        Self {
            sequence_id: None,
            partition: None,
            state: HandleState::Failed(Some(err)),
        }
    }

    /// Sequence id assigned to the message, `None` if it was rejected before
    /// being enqueued.
    pub fn sequence_id(&self) -> Option<u64> {
        self.sequence_id
    }

    /// Partition the message was routed to, `None` if it was rejected before
    /// being enqueued.
    pub fn partition(&self) -> Option<u32> {
        self.partition
    }
}

impl Future for SendHandle {
    type Output = Result<MessageId>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            HandleState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(ClientError::AlreadyClosed))),
            HandleState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or_else(|| {
                ClientError::Internal("send handle polled after completion".to_string())
            }))),
        }
    }
}

impl std::fmt::Debug for SendHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendHandle")
            .field("sequence_id", &self.sequence_id)
            .field("partition", &self.partition)
            .field("failed", &matches!(self.state, HandleState::Failed(_)))
            .finish()
    }
}

/// A flushed batch on its way to the dispatcher.
struct FlushedBatch {
    frame: BatchFrame,
    members: Vec<Arc<Completion>>,
}

struct PartitionState {
    container: BatchContainer,
    timer: Option<JoinHandle<()>>,
    /// Enqueued messages in enqueue order, with their ack deadline
    outstanding: VecDeque<(Option<Instant>, Arc<Completion>)>,
    dispatch: Option<mpsc::UnboundedSender<FlushedBatch>>,
    closed: bool,
}

impl PartitionState {
    fn abort_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn prune_outstanding(&mut self) {
        while self
            .outstanding
            .front()
            .is_some_and(|(_, c)| c.is_terminal())
        {
            self.outstanding.pop_front();
        }
    }

    fn unfinished(&self) -> Vec<Arc<Completion>> {
        self.outstanding
            .iter()
            .filter(|(_, c)| !c.is_terminal())
            .map(|(_, c)| Arc::clone(c))
            .collect()
    }
}

struct PartitionProducer {
    index: u32,
    /// Assigned under `state`'s lock so each batch covers a contiguous range
    sequence: SequenceAllocator,
    state: Mutex<PartitionState>,
    connection: Arc<dyn PartitionConnection>,
}

impl PartitionProducer {
    fn lock(&self) -> MutexGuard<'_, PartitionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ProducerInner {
    config: ProducerConfig,
    producer_name: String,
    partition_count: u32,
    router: PartitionRouter,
    flow: FlowController,
    crypto: Option<MessageCrypto>,
    partitions: Vec<PartitionProducer>,
    stats: Arc<ProducerStats>,
    state: AtomicU8,
    closed: Notify,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Publishes messages to one topic.
///
/// ## Lifecycle
///
/// 1. **Creation**: [`Producer::create`] or [`ProducerConfigBuilder::create`]
/// 2. **Usage**: [`send_async`](Self::send_async) / [`send`](Self::send)
/// 3. **Cleanup**: [`close`](Self::close) flushes and waits for every
///    outstanding message
///
/// ## Thread Safety
///
/// Producer is thread-safe and can be shared across tasks using `Arc`:
///
/// ```ignore
/// let producer = Arc::new(producer);
/// let tasks: Vec<_> = (0..10).map(|i| {
///     let producer = Arc::clone(&producer);
///     tokio::spawn(async move {
///         producer.send(OutgoingMessage::new(format!("msg {}", i))).await
///     })
/// }).collect();
/// ```
pub struct Producer {
    inner: Arc<ProducerInner>,
}

impl Producer {
    /// Resolve the topic's partitions, connect to each partition and start
    /// the background tasks.
    ///
    /// Lookup and connect are retried with jittered backoff according to
    /// `config.lookup_retry()`.
    ///
    /// # Errors
    ///
    /// - `ClientError::Configuration`: invalid topic or routing setup
    /// - `ClientError::Transport`: lookup or connect still failing after
    ///   retries
    pub async fn create(
        config: ProducerConfig,
        lookup: Arc<dyn PartitionLookup>,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        validate_topic(config.topic())?;
        let topic = config.topic();
        let policy = config.lookup_retry();

        let lookup_ref = lookup.as_ref();
        let metadata = retry_with_jittered_backoff(policy, move || lookup_ref.resolve(topic)).await?;
        let partition_count = metadata.partitions;
        debug!(
            topic = topic,
            partitions = partition_count,
            partitioned = metadata.is_partitioned(),
            "Resolved topic partitions"
        );

        let router = PartitionRouter::new(&config, partition_count)?;

        let transport_ref = transport.as_ref();
        let mut connections: Vec<Arc<dyn PartitionConnection>> =
            Vec::with_capacity(metadata.connection_count() as usize);
        for partition in 0..metadata.connection_count() {
            let connected =
                retry_with_jittered_backoff(policy, move || transport_ref.connect(topic, partition))
                    .await;
            match connected {
                Ok(connection) => connections.push(connection),
                Err(e) => {
                    error!(topic = topic, partition = partition, error = %e, "Failed to connect partition");
                    for connection in &connections {
                        connection.close();
                    }
                    return Err(e);
                }
            }
        }

        let producer_name = config
            .producer_name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("meridian-{}", Uuid::new_v4()));

        let crypto = match config.crypto_key_reader() {
            Some(reader) if config.encryption_enabled() => Some(MessageCrypto::new(
                Arc::clone(reader),
                config.encryption_keys().iter().cloned(),
            )),
            _ => None,
        };

        let flow = FlowController::new(
            partition_count,
            config.max_pending_messages(),
            config.max_pending_messages_across_partitions(),
            config.block_if_queue_full(),
        );

        let stats = Arc::new(ProducerStats::new());
        let shutdown = CancellationToken::new();
        let batched = config.batching_enabled();

        let mut tasks = Vec::with_capacity(connections.len() + 1);
        let mut partitions = Vec::with_capacity(connections.len());
        for (index, connection) in connections.into_iter().enumerate() {
            let index = index as u32;
            let (tx, rx) = mpsc::unbounded_channel();
            tasks.push(tokio::spawn(run_dispatcher(
                index,
                Arc::clone(&connection),
                rx,
                Arc::clone(&stats),
                shutdown.clone(),
                batched,
            )));
            partitions.push(PartitionProducer {
                index,
                sequence: SequenceAllocator::new(config.initial_sequence_id()),
                state: Mutex::new(PartitionState {
                    container: BatchContainer::new(
                        config.batching_max_messages(),
                        config.batching_max_bytes(),
                        config.batching_max_publish_delay(),
                    ),
                    timer: None,
                    outstanding: VecDeque::new(),
                    dispatch: Some(tx),
                    closed: false,
                }),
                connection,
            });
        }

        let inner = Arc::new(ProducerInner {
            producer_name,
            partition_count,
            router,
            flow,
            crypto,
            partitions,
            stats,
            state: AtomicU8::new(OPEN),
            closed: Notify::new(),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let send_timeout = inner.config.send_timeout();
        if !send_timeout.is_zero() {
            tasks.push(spawn_timeout_sweep(
                Arc::downgrade(&inner),
                send_timeout,
                inner.shutdown.clone(),
            ));
        }
        *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner) = tasks;

        info!(
            topic = inner.config.topic(),
            producer_name = %inner.producer_name,
            partitions = partition_count,
            routing_mode = ?inner.config.routing_mode(),
            batching = inner.config.batching_enabled(),
            encryption_keys = ?inner.crypto.as_ref().map(MessageCrypto::key_names),
            "Producer created"
        );

        Ok(Self { inner })
    }

    /// Enqueue a message and return its completion handle.
    ///
    /// Waits only while the pending queue is full and `block_if_queue_full`
    /// is set. Every failure, including an immediate rejection, is delivered
    /// through the handle.
    pub async fn send_async(&self, message: OutgoingMessage) -> SendHandle {
        self.enqueue(message, None).await
    }

    /// Like [`send_async`](Self::send_async), but `cancel` aborts a wait for a
    /// free slot with `ClientError::Interrupted`.
    pub async fn send_async_cancellable(
        &self,
        message: OutgoingMessage,
        cancel: &CancellationToken,
    ) -> SendHandle {
        self.enqueue(message, Some(cancel)).await
    }

    /// Publish a message and wait for its acknowledgment.
    pub async fn send(&self, message: OutgoingMessage) -> Result<MessageId> {
        self.send_async(message).await.await
    }

    /// Flush every partition and wait until all messages enqueued before this
    /// call are terminal.
    ///
    /// Individual message failures are reported through their handles, not
    /// here.
    pub async fn flush(&self) -> Result<()> {
        if self.is_closed() {
            return Err(ClientError::AlreadyClosed);
        }

        let mut waiting = Vec::new();
        for partition in &self.inner.partitions {
            let mut state = partition.lock();
            if let Some(batch) = state.container.take() {
                state.abort_timer();
                self.inner.dispatch_batch(partition, &mut state, batch);
            }
            waiting.extend(state.unfinished());
        }

        debug!(
            topic = self.inner.config.topic(),
            outstanding = waiting.len(),
            "Flushed producer, waiting for outstanding messages"
        );
        for completion in waiting {
            completion.wait_terminal().await;
        }
        Ok(())
    }

    /// Close the producer.
    ///
    /// New sends are rejected with `AlreadyClosed` and blocked sends are
    /// interrupted. Every partition is flushed, then the call waits until all
    /// outstanding messages are acked, failed or timed out before stopping
    /// the background tasks and closing the connections.
    ///
    /// Calling `close` again, concurrently or later, waits for the first call
    /// to finish and returns `Ok(())`.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        if inner
            .state
            .compare_exchange(OPEN, CLOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            loop {
                let notified = inner.closed.notified();
                if inner.state.load(Ordering::Acquire) == CLOSED {
                    return Ok(());
                }
                notified.await;
            }
        }

        info!(
            topic = inner.config.topic(),
            producer_name = %inner.producer_name,
            pending = inner.flow.pending_total(),
            "Closing producer"
        );

        inner.flow.close();
        for partition in &inner.partitions {
            let mut state = partition.lock();
            state.closed = true;
            state.abort_timer();
            if let Some(batch) = state.container.take() {
                inner.dispatch_batch(partition, &mut state, batch);
            }
        }

        inner.flow.wait_idle().await;

        inner.shutdown.cancel();
        for partition in &inner.partitions {
            partition.lock().dispatch = None;
        }
        let tasks = std::mem::take(&mut *inner.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    warn!(error = %e, "Producer background task failed");
                }
            }
        }
        for partition in &inner.partitions {
            partition.connection.close();
        }

        inner.state.store(CLOSED, Ordering::Release);
        inner.closed.notify_waiters();

        let stats = inner.stats.snapshot();
        info!(
            topic = inner.config.topic(),
            producer_name = %inner.producer_name,
            messages_acked = stats.messages_acked,
            messages_failed = stats.messages_failed,
            "Producer closed"
        );
        Ok(())
    }

    pub fn topic(&self) -> &str {
        self.inner.config.topic()
    }

    pub fn producer_name(&self) -> &str {
        &self.inner.producer_name
    }

    /// Partition count reported by the lookup (0 for a non-partitioned topic).
    pub fn partition_count(&self) -> u32 {
        self.inner.partition_count
    }

    /// Highest sequence id handed out by any partition's counter.
    pub fn last_sequence_id(&self) -> Option<u64> {
        self.inner
            .partitions
            .iter()
            .filter_map(|p| p.sequence.last_allocated())
            .max()
    }

    /// Messages accepted and not yet terminal.
    pub fn pending_messages(&self) -> usize {
        self.inner.flow.pending_total()
    }

    pub fn stats(&self) -> ProducerStatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn config(&self) -> &ProducerConfig {
        &self.inner.config
    }

    /// True once `close` has started.
    pub fn is_closed(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) != OPEN
    }

    async fn enqueue(&self, message: OutgoingMessage, cancel: Option<&CancellationToken>) -> SendHandle {
        match self.try_enqueue(message, cancel).await {
            Ok(handle) => handle,
            Err(e) => {
                debug!(topic = self.inner.config.topic(), error = %e, "Message rejected");
                SendHandle::failed(e)
            }
        }
    }

    async fn try_enqueue(
        &self,
        message: OutgoingMessage,
        cancel: Option<&CancellationToken>,
    ) -> Result<SendHandle> {
        let inner = &self.inner;
        if self.is_closed() {
            return Err(ClientError::AlreadyClosed);
        }

        let partition = inner.router.route(message.key.as_deref())?;
        let producer = inner
            .partitions
            .get(partition as usize)
            .ok_or(ClientError::InvalidPartition(partition, inner.partition_count))?;

        let admission = inner.flow.admit(partition, cancel).await?;

        let mut state = producer.lock();
        if state.closed {
            return Err(ClientError::AlreadyClosed);
        }

        let sequence_id = producer.sequence.resolve(message.sequence_id);
        let (completion, rx) = Completion::new(sequence_id, partition, Some(admission));

        let send_timeout = inner.config.send_timeout();
        let deadline = (!send_timeout.is_zero()).then(|| Instant::now() + send_timeout);
        state.prune_outstanding();
        state
            .outstanding
            .push_back((deadline, Arc::clone(&completion)));
        inner.stats.record_enqueued();

        trace!(
            topic = inner.config.topic(),
            partition = partition,
            sequence_id = sequence_id,
            "Enqueued message"
        );

        let added = state
            .container
            .add(PendingMessage::new(message.into_entry(sequence_id), completion));
        for batch in added.ready {
            state.abort_timer();
            inner.dispatch_batch(producer, &mut state, batch);
        }
        if let Some(generation) = added.opened {
            state.abort_timer();
            state.timer = Some(spawn_flush_timer(
                Arc::clone(inner),
                partition,
                generation,
                state.container.max_delay(),
            ));
        }

        Ok(SendHandle::pending(sequence_id, partition, rx))
    }
}

impl ProducerInner {
    /// Encode, compress and encrypt `batch`, then queue it for the
    /// partition dispatcher. Runs under the partition lock so frames leave
    /// in flush order.
    fn dispatch_batch(&self, partition: &PartitionProducer, state: &mut PartitionState, mut batch: Batch) {
        let expired = batch.drop_completed();
        if batch.is_empty() {
            debug!(
                partition = partition.index,
                expired = expired,
                "Dropped batch, every member already completed"
            );
            return;
        }

        let frame = match self.build_frame(partition.index, &batch) {
            Ok(frame) => frame,
            Err(e) => {
                error!(
                    topic = self.config.topic(),
                    partition = partition.index,
                    batch_size = batch.len(),
                    error = %e,
                    "Failed to build batch frame"
                );
                let failed = batch
                    .messages
                    .iter()
                    .filter(|m| m.completion.complete(Err(e.clone())))
                    .count();
                self.stats.record_failed(failed as u64);
                return;
            }
        };

        debug!(
            topic = self.config.topic(),
            partition = partition.index,
            sequence_id = frame.sequence_id,
            batch_size = frame.num_messages,
            payload_bytes = frame.payload.len(),
            age_ms = batch.created_at.elapsed().as_millis() as u64,
            "Flushing batch"
        );
        self.stats.record_batch(frame.payload.len());

        let members = batch.messages.into_iter().map(|m| m.completion).collect();
        let flushed = FlushedBatch { frame, members };
        let undelivered = match &state.dispatch {
            Some(tx) => tx.send(flushed).err().map(|e| e.0),
            None => Some(flushed),
        };
        if let Some(flushed) = undelivered {
            let failed = flushed
                .members
                .iter()
                .filter(|c| c.complete(Err(ClientError::AlreadyClosed)))
                .count();
            self.stats.record_failed(failed as u64);
        }
    }

    fn build_frame(&self, partition: u32, batch: &Batch) -> Result<BatchFrame> {
        let (first, last) = match (batch.messages.first(), batch.messages.last()) {
            (Some(first), Some(last)) => (first.entry.sequence_id, last.entry.sequence_id),
            _ => return Err(ClientError::Internal("cannot frame an empty batch".to_string())),
        };

        let mut raw = BytesMut::with_capacity(batch.size_bytes);
        for message in &batch.messages {
            message.entry.encode(&mut raw);
        }
        let raw = raw.freeze();

        let compression = self.config.compression();
        let compressed = compression.compress(&raw)?;

        let (encryption, payload) = match &self.crypto {
            None => (Encryption::None, compressed),
            Some(crypto) => match crypto.encrypt(&compressed) {
                Ok((metadata, sealed)) => (Encryption::Sealed(metadata), sealed),
                Err(e) => {
                    self.stats.record_encryption_failure();
                    match self.config.crypto_failure_action() {
                        CryptoFailureAction::Fail => return Err(e),
                        CryptoFailureAction::Send => {
                            warn!(
                                topic = self.config.topic(),
                                partition = partition,
                                sequence_id = first,
                                error = %e,
                                "Encryption failed, sending batch unencrypted"
                            );
                            (Encryption::Bypassed, compressed)
                        }
                    }
                }
            },
        };

        Ok(BatchFrame {
            producer_name: self.producer_name.clone(),
            topic: self.config.topic().to_string(),
            partition,
            sequence_id: first,
            highest_sequence_id: last,
            num_messages: batch.len() as u32,
            publish_time: now_millis(),
            compression,
            uncompressed_size: raw.len() as u32,
            encryption,
            payload,
        })
    }

    /// Fail every message whose ack deadline has passed.
    fn expire_timed_out(&self, now: Instant) {
        let send_timeout = self.config.send_timeout();
        for partition in &self.partitions {
            let mut expired = Vec::new();
            {
                let mut state = partition.lock();
                while let Some((deadline, completion)) = state.outstanding.front() {
                    if completion.is_terminal() {
                        state.outstanding.pop_front();
                    } else if deadline.is_some_and(|d| d <= now) {
                        if let Some((_, completion)) = state.outstanding.pop_front() {
                            expired.push(completion);
                        }
                    } else {
                        break;
                    }
                }
            }

            for completion in expired {
                if completion.complete(Err(ClientError::Timeout(send_timeout))) {
                    self.stats.record_timed_out();
                    warn!(
                        topic = self.config.topic(),
                        partition = partition.index,
                        sequence_id = completion.sequence_id(),
                        timeout_ms = send_timeout.as_millis() as u64,
                        "Message timed out waiting for acknowledgment"
                    );
                }
            }
        }
    }
}

impl Drop for ProducerInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for partition in &self.partitions {
            partition.lock().abort_timer();
        }
    }
}

impl ProducerConfigBuilder {
    /// Build the configuration and create a producer from it.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let broker = InMemoryBroker::new().with_topic("orders", 4);
    /// let producer = ProducerConfig::builder()
    ///     .topic("orders")
    ///     .create(Arc::new(broker.clone()), Arc::new(broker))
    ///     .await?;
    /// ```
    pub async fn create(
        self,
        lookup: Arc<dyn PartitionLookup>,
        transport: Arc<dyn Transport>,
    ) -> Result<Producer> {
        Producer::create(self.build()?, lookup, transport).await
    }
}

fn spawn_flush_timer(
    inner: Arc<ProducerInner>,
    partition: u32,
    generation: u64,
    delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;

        let Some(producer) = inner.partitions.get(partition as usize) else {
            return;
        };
        let mut state = producer.lock();
        if let Some(batch) = state.container.take_generation(generation) {
            // This task is the timer; dropping the handle detaches it
            state.timer = None;
            trace!(partition = partition, generation = generation, "Publish delay elapsed");
            inner.dispatch_batch(producer, &mut state, batch);
        }
    })
}

fn spawn_timeout_sweep(
    inner: Weak<ProducerInner>,
    send_timeout: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let period = send_timeout
        .min(MAX_SWEEP_INTERVAL)
        .max(Duration::from_millis(1));

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.expire_timed_out(Instant::now());
        }
    })
}

/// Hands frames to `connection` in flush order and resolves members in the
/// same order as the acks are queued.
async fn run_dispatcher(
    partition: u32,
    connection: Arc<dyn PartitionConnection>,
    mut batches: mpsc::UnboundedReceiver<FlushedBatch>,
    stats: Arc<ProducerStats>,
    shutdown: CancellationToken,
    batched: bool,
) {
    type InFlight = BoxFuture<'static, (Result<SendReceipt>, Vec<Arc<Completion>>)>;
    let mut in_flight: FuturesOrdered<InFlight> = FuturesOrdered::new();
    let mut open = true;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            received = batches.recv(), if open => match received {
                Some(FlushedBatch { frame, members }) => {
                    let ack = connection.send(frame);
                    in_flight.push_back(Box::pin(async move { (ack.await, members) }));
                }
                None => open = false,
            },
            Some((result, members)) = in_flight.next(), if !in_flight.is_empty() => {
                resolve_batch(partition, result, &members, &stats, batched);
            }
            else => break,
        }
    }

    trace!(partition = partition, "Dispatcher stopped");
}

fn resolve_batch(
    partition: u32,
    result: Result<SendReceipt>,
    members: &[Arc<Completion>],
    stats: &ProducerStats,
    batched: bool,
) {
    match result {
        Ok(receipt) => {
            let acked = members
                .iter()
                .enumerate()
                .filter(|(index, completion)| {
                    let batch_index = batched.then_some(*index as u32);
                    completion.complete(Ok(MessageId::new(
                        receipt.ledger_id,
                        receipt.entry_id,
                        partition,
                        batch_index,
                    )))
                })
                .count();
            stats.record_acked(acked as u64);
            trace!(
                partition = partition,
                entry_id = receipt.entry_id,
                batch_size = members.len(),
                "Batch acknowledged"
            );
        }
        Err(e) => {
            error!(
                partition = partition,
                batch_size = members.len(),
                error = %e,
                "Batch failed"
            );
            let failed = members
                .iter()
                .filter(|completion| completion.complete(Err(e.clone())))
                .count();
            stats.record_failed(failed as u64);
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
