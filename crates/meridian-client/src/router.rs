//! Partition routing.
//!
//! The router picks a destination partition for every message. The policy is
//! fixed when the producer is created and dispatched once per send:
//!
//! | Policy       | Key present                 | Key absent             |
//! |--------------|-----------------------------|------------------------|
//! | `Single`     | fixed index                 | fixed index            |
//! | `RoundRobin` | `hash(key) mod count`       | rotating counter       |
//! | `Custom`     | caller function             | caller function        |
//!
//! A topic with 0 or 1 partitions always routes to index 0, whatever the
//! policy.

use crate::config::{HashingScheme, MessageRoutingMode, ProducerConfig};
use crate::error::{ClientError, Result};
use rand::Rng;
use siphasher::sip::SipHasher;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Caller-supplied routing function.
///
/// Any `Fn(Option<&str>, u32) -> u32` closure is a router.
pub trait MessageRouter: Send + Sync {
    /// Return a partition index in `[0, partition_count)`.
    fn choose_partition(&self, key: Option<&str>, partition_count: u32) -> u32;
}

impl<F> MessageRouter for F
where
    F: Fn(Option<&str>, u32) -> u32 + Send + Sync,
{
    fn choose_partition(&self, key: Option<&str>, partition_count: u32) -> u32 {
        self(key, partition_count)
    }
}

/// Routing policy resolved for one producer.
pub enum RoutingPolicy {
    Single(u32),
    RoundRobin {
        scheme: HashingScheme,
        counter: AtomicU64,
    },
    Custom(Arc<dyn MessageRouter>),
}

/// Chooses a partition per message for a topic of fixed partition count.
pub struct PartitionRouter {
    policy: RoutingPolicy,
    partition_count: u32,
}

impl PartitionRouter {
    /// Resolve the policy described by `config` for `partition_count`.
    ///
    /// `SinglePartition` draws its index here, once; `RoundRobinPartition`
    /// starts its counter at a random offset so that many short-lived
    /// producers do not all hit partition 0 first.
    pub fn new(config: &ProducerConfig, partition_count: u32) -> Result<Self> {
        let mut rng = rand::thread_rng();
        let policy = match config.routing_mode() {
            MessageRoutingMode::SinglePartition => {
                let index = if partition_count > 1 {
                    rng.gen_range(0..partition_count)
                } else {
                    0
                };
                RoutingPolicy::Single(index)
            }
            MessageRoutingMode::RoundRobinPartition => RoutingPolicy::RoundRobin {
                scheme: config.hashing_scheme(),
                counter: AtomicU64::new(rng.gen_range(0..u32::MAX as u64)),
            },
            MessageRoutingMode::CustomPartition => {
                let router = config.custom_router().ok_or_else(|| {
                    ClientError::Configuration(
                        "CustomPartition routing requires a message router".to_string(),
                    )
                })?;
                RoutingPolicy::Custom(Arc::clone(router))
            }
        };
        Ok(Self::from_policy(policy, partition_count))
    }

    pub fn from_policy(policy: RoutingPolicy, partition_count: u32) -> Self {
        Self {
            policy,
            partition_count,
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.partition_count
    }

    /// Pick the partition for a message with optional `key`.
    ///
    /// # Errors
    ///
    /// `InvalidPartition` when a custom router answers out of range.
    pub fn route(&self, key: Option<&str>) -> Result<u32> {
        let count = self.partition_count;
        if count <= 1 {
            return Ok(0);
        }

        match &self.policy {
            RoutingPolicy::Single(index) => Ok(*index),
            RoutingPolicy::RoundRobin { scheme, counter } => match key {
                Some(k) => Ok(hash_key(*scheme, k) % count),
                None => {
                    let next = counter.fetch_add(1, Ordering::Relaxed);
                    Ok((next % count as u64) as u32)
                }
            },
            RoutingPolicy::Custom(router) => {
                let index = router.choose_partition(key, count);
                if index >= count {
                    return Err(ClientError::InvalidPartition(index, count));
                }
                Ok(index)
            }
        }
    }
}

/// Non-negative 31-bit hash of `key` under `scheme`.
pub fn hash_key(scheme: HashingScheme, key: &str) -> u32 {
    let hash = match scheme {
        HashingScheme::JavaStringHash => java_string_hash(key) as u32,
        HashingScheme::Murmur3_32Hash => murmur3_32(key.as_bytes(), 0),
        HashingScheme::SipHash => {
            let mut hasher = SipHasher::new();
            hasher.write(key.as_bytes());
            hasher.finish() as u32
        }
    };
    hash & i32::MAX as u32
}

/// `String.hashCode()` as computed over UTF-16 code units.
fn java_string_hash(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |h, unit| h.wrapping_mul(31).wrapping_add(unit as i32))
}

fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    const C1: u32 = 0xcc9e_2d51;
    const C2: u32 = 0x1b87_3593;

    let mut h = seed;
    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let mut k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
        h = h.rotate_left(13).wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        k = k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2);
        h ^= k;
    }

    h ^= data.len() as u32;
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
