//! Flow control for in-flight messages.
//!
//! Bounds the number of messages that have been accepted by `send` but have
//! not yet reached a terminal state (acked, failed, timed out).
//!
//! ## Architecture
//!
//! ```text
//!            admit(partition)
//!                  │
//!                  ▼
//! ┌───────────────────────────────────┐
//! │ partition semaphore  (max_pending) │  one per partition
//! └─────────────────┬─────────────────┘
//!                   ▼
//! ┌───────────────────────────────────┐
//! │ aggregate semaphore (max_across)  │  partitioned topics only
//! └─────────────────┬─────────────────┘
//!                   ▼
//!              Admission  ──drop/release()──▶ both slots freed
//! ```
//!
//! The `Admission` guard travels with the message and is dropped exactly once,
//! at terminal completion. Nothing is released when a message merely moves
//! into a batch.
//!
//! ## Backpressure
//!
//! - `block_if_queue_full = false`: a full queue fails fast with `QueueFull`
//! - `block_if_queue_full = true`: the caller waits for a slot. The wait holds
//!   no partition lock, so the ack path that frees slots is never blocked by
//!   it. A cancellation token or `close()` aborts the wait with `Interrupted`.

use crate::error::{ClientError, Result};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct FlowShared {
    partitions: Vec<Arc<Semaphore>>,
    aggregate: Option<Arc<Semaphore>>,
    pending: Vec<AtomicUsize>,
    total: AtomicUsize,
    idle: Notify,
}

/// Per-partition and cross-partition bounds on in-flight messages.
pub struct FlowController {
    shared: Arc<FlowShared>,
    block_if_full: bool,
}

impl FlowController {
    /// Create a controller for `partition_count` partitions.
    ///
    /// A bound of zero means unbounded. The aggregate bound only applies when
    /// the topic has more than one partition.
    pub fn new(
        partition_count: u32,
        max_pending_messages: usize,
        max_pending_across_partitions: usize,
        block_if_full: bool,
    ) -> Self {
        let slots = partition_count.max(1) as usize;
        let partitions = (0..slots)
            .map(|_| Arc::new(Semaphore::new(bound(max_pending_messages))))
            .collect();
        let aggregate = (partition_count > 1 && max_pending_across_partitions > 0)
            .then(|| Arc::new(Semaphore::new(bound(max_pending_across_partitions))));

        Self {
            shared: Arc::new(FlowShared {
                partitions,
                aggregate,
                pending: (0..slots).map(|_| AtomicUsize::new(0)).collect(),
                total: AtomicUsize::new(0),
                idle: Notify::new(),
            }),
            block_if_full,
        }
    }

    /// Reserve one slot on `partition` (and on the aggregate bound).
    ///
    /// # Errors
    ///
    /// - `QueueFull` when a bound is reached and blocking is disabled
    /// - `Interrupted` when a blocked wait is cancelled or the controller closes
    /// - `AlreadyClosed` when the controller was closed and blocking is disabled
    pub async fn admit(
        &self,
        partition: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<Admission> {
        let slots = self.shared.partitions.len() as u32;
        let semaphore = self
            .shared
            .partitions
            .get(partition as usize)
            .ok_or(ClientError::InvalidPartition(partition, slots))?;

        let partition_permit = self
            .acquire(Arc::clone(semaphore), partition, cancel)
            .await?;

        // A failure here drops `partition_permit`, so nothing leaks
        let aggregate_permit = match &self.shared.aggregate {
            Some(aggregate) => Some(self.acquire(Arc::clone(aggregate), partition, cancel).await?),
            None => None,
        };

        self.shared.pending[partition as usize].fetch_add(1, Ordering::AcqRel);
        self.shared.total.fetch_add(1, Ordering::AcqRel);

        Ok(Admission {
            partition,
            _partition_permit: partition_permit,
            _aggregate_permit: aggregate_permit,
            shared: Arc::clone(&self.shared),
        })
    }

    async fn acquire(
        &self,
        semaphore: Arc<Semaphore>,
        partition: u32,
        cancel: Option<&CancellationToken>,
    ) -> Result<OwnedSemaphorePermit> {
        match Arc::clone(&semaphore).try_acquire_owned() {
            Ok(permit) => return Ok(permit),
            Err(TryAcquireError::Closed) if self.block_if_full => {
                return Err(ClientError::Interrupted)
            }
            Err(TryAcquireError::Closed) => return Err(ClientError::AlreadyClosed),
            Err(TryAcquireError::NoPermits) if !self.block_if_full => {
                return Err(ClientError::QueueFull { partition })
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        debug!(partition = partition, "Pending queue full, waiting for a free slot");

        let acquire = semaphore.acquire_owned();
        match cancel {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(ClientError::Interrupted),
                permit = acquire => permit.map_err(|_| ClientError::Interrupted),
            },
            None => acquire.await.map_err(|_| ClientError::Interrupted),
        }
    }

    /// Messages in flight on `partition`.
    pub fn pending(&self, partition: u32) -> usize {
        self.shared
            .pending
            .get(partition as usize)
            .map_or(0, |p| p.load(Ordering::Acquire))
    }

    /// Messages in flight on all partitions.
    pub fn pending_total(&self) -> usize {
        self.shared.total.load(Ordering::Acquire)
    }

    /// Wait until every admitted message has been released.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.pending_total() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Reject further admissions and interrupt blocked callers.
    ///
    /// Outstanding admissions stay valid and are released as usual.
    pub fn close(&self) {
        for semaphore in &self.shared.partitions {
            semaphore.close();
        }
        if let Some(aggregate) = &self.shared.aggregate {
            aggregate.close();
        }
    }
}

fn bound(max: usize) -> usize {
    if max == 0 {
        Semaphore::MAX_PERMITS
    } else {
        max.min(Semaphore::MAX_PERMITS)
    }
}

/// A reserved flow-control slot.
///
/// Dropping the guard (or calling [`release`](Self::release)) frees the slot.
/// Ownership makes a double release impossible.
pub struct Admission {
    partition: u32,
    _partition_permit: OwnedSemaphorePermit,
    _aggregate_permit: Option<OwnedSemaphorePermit>,
    shared: Arc<FlowShared>,
}

impl Admission {
    pub fn partition(&self) -> u32 {
        self.partition
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.shared.pending[self.partition as usize].fetch_sub(1, Ordering::AcqRel);
        if self.shared.total.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.shared.idle.notify_waiters();
        }
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("partition", &self.partition)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_non_blocking_queue_full() {
        let flow = FlowController::new(1, 1, 0, false);

        let first = flow.admit(0, None).await.unwrap();
        assert_eq!(flow.pending(0), 1);

        let err = flow.admit(0, None).await.unwrap_err();
        assert!(matches!(err, ClientError::QueueFull { partition: 0 }));

        first.release();
        assert_eq!(flow.pending(0), 0);
        assert!(flow.admit(0, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_aggregate_bound_across_partitions() {
        let flow = FlowController::new(2, 10, 1, false);

        let _held = flow.admit(0, None).await.unwrap();
        let err = flow.admit(1, None).await.unwrap_err();
        assert!(matches!(err, ClientError::QueueFull { partition: 1 }));

        // The partition slot taken before the aggregate check was returned
        assert_eq!(flow.pending(1), 0);
        assert_eq!(flow.pending_total(), 1);
    }

    #[tokio::test]
    async fn test_single_partition_has_no_aggregate_bound() {
        let flow = FlowController::new(1, 3, 1, false);
        let _a = flow.admit(0, None).await.unwrap();
        let _b = flow.admit(0, None).await.unwrap();
        assert_eq!(flow.pending_total(), 2);
    }

    #[tokio::test]
    async fn test_zero_means_unbounded() {
        let flow = FlowController::new(1, 0, 0, false);
        let held: Vec<_> = futures::future::join_all((0..5000).map(|_| flow.admit(0, None)))
            .await
            .into_iter()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(held.len(), 5000);
    }

    #[tokio::test]
    async fn test_blocking_admit_resumes_after_release() {
        let flow = Arc::new(FlowController::new(1, 1, 0, true));
        let first = flow.admit(0, None).await.unwrap();

        let waiter = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.admit(0, None).await.map(|a| a.partition()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        first.release();
        let partition = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(partition, 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_interrupted_without_leak() {
        let flow = Arc::new(FlowController::new(2, 1, 0, true));
        let _first = flow.admit(1, None).await.unwrap();
        let token = CancellationToken::new();

        let waiter = {
            let flow = Arc::clone(&flow);
            let token = token.clone();
            tokio::spawn(async move { flow.admit(1, Some(&token)).await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(ClientError::Interrupted)));
        assert_eq!(flow.pending(1), 1);
        assert_eq!(flow.pending_total(), 1);
    }

    #[tokio::test]
    async fn test_close_interrupts_waiters() {
        let flow = Arc::new(FlowController::new(1, 1, 0, true));
        let held = flow.admit(0, None).await.unwrap();

        let waiter = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.admit(0, None).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        flow.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(ClientError::Interrupted)
        ));

        // Existing admissions still release normally after close
        held.release();
        assert_eq!(flow.pending_total(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle() {
        let flow = Arc::new(FlowController::new(1, 10, 0, false));
        let a = flow.admit(0, None).await.unwrap();
        let b = flow.admit(0, None).await.unwrap();

        let idle = {
            let flow = Arc::clone(&flow);
            tokio::spawn(async move { flow.wait_idle().await })
        };

        a.release();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!idle.is_finished());

        b.release();
        tokio::time::timeout(Duration::from_secs(1), idle)
            .await
            .unwrap()
            .unwrap();
    }
}
