//! Producer configuration.
//!
//! A [`ProducerConfig`] is built once through [`ProducerConfigBuilder`] and is
//! immutable afterwards: a running producer never observes a configuration
//! change. The builder is `Clone`, so one template can derive many producers;
//! because the key set and properties are owned collections, a clone never
//! aliases the original.
//!
//! ## Configuration Fields
//!
//! - `topic`: Required. Topic to publish to.
//! - `producer_name`: Optional. Generated when the producer is created.
//! - `send_timeout`: Max time from enqueue to ack (default: 30s, zero disables)
//! - `max_pending_messages`: Per-partition in-flight bound (default: 1000)
//! - `max_pending_messages_across_partitions`: Aggregate bound (default: 50000)
//! - `block_if_queue_full`: Suspend instead of failing when full (default: false)
//! - `routing_mode`: Partition routing policy (default: RoundRobinPartition)
//! - `hashing_scheme`: Key hash for routing (default: JavaStringHash)
//! - `compression`: Batch payload codec (default: None)
//! - `batching_enabled`: Group messages into batches (default: true)
//! - `batching_max_messages`: Count trigger (default: 1000)
//! - `batching_max_publish_delay`: Time trigger (default: 1ms)
//! - `batching_max_bytes`: Size trigger (default: 128KB)
//! - `initial_sequence_id`: First sequence id handed out (default: 0)
//! - `encryption_keys` + `crypto_key_reader`: Enable batch encryption
//! - `crypto_failure_action`: Fail or send plaintext on crypto failure (default: Fail)
//! - `properties`: Producer-level string properties
//! - `lookup_retry`: Backoff for partition lookup at creation (default: 3 retries)
//!
//! ## Examples
//!
//! ```ignore
//! use meridian_client::{ProducerConfig, MessageRoutingMode};
//! use std::time::Duration;
//!
//! let config = ProducerConfig::builder()
//!     .topic("orders")
//!     .routing_mode(MessageRoutingMode::RoundRobinPartition)
//!     .batching_max_messages(500)
//!     .batching_max_publish_delay(Duration::from_millis(5))
//!     .send_timeout(Duration::from_secs(10))
//!     .build()?;
//! ```

use crate::crypto::CryptoKeyReader;
use crate::error::{ClientError, Result};
use crate::retry::RetryPolicy;
use crate::router::MessageRouter;
use meridian_core::CompressionType;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PENDING_MESSAGES: usize = 1000;
pub const DEFAULT_MAX_PENDING_MESSAGES_ACROSS_PARTITIONS: usize = 50_000;
pub const DEFAULT_BATCHING_MAX_MESSAGES: usize = 1000;
pub const DEFAULT_BATCHING_MAX_PUBLISH_DELAY: Duration = Duration::from_millis(1);
pub const DEFAULT_BATCHING_MAX_BYTES: usize = 128 * 1024;

/// How messages are spread over a partitioned topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRoutingMode {
    /// Every message goes to one partition picked at producer creation
    SinglePartition,
    /// Keyed messages hash to a partition, unkeyed ones rotate
    #[default]
    RoundRobinPartition,
    /// A caller-supplied [`MessageRouter`] decides
    CustomPartition,
}

/// Hash function used to map a message key to a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashingScheme {
    /// 31-based polynomial hash over UTF-16 code units
    #[default]
    JavaStringHash,
    /// Murmur3 32-bit, seed 0, over UTF-8 bytes
    Murmur3_32Hash,
    /// SipHash-2-4 with zero keys, over UTF-8 bytes
    SipHash,
}

/// What to do with a batch when encryption fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CryptoFailureAction {
    /// Fail every message of the batch with an encryption error
    #[default]
    Fail,
    /// Send the batch unencrypted, marked so receivers skip decryption
    Send,
}

/// Validated, immutable producer configuration.
///
/// Created by [`ProducerConfigBuilder::build`]. There are no setters: derive
/// a new configuration from a cloned builder instead.
#[derive(Clone)]
pub struct ProducerConfig {
    topic: String,
    producer_name: Option<String>,
    send_timeout: Duration,
    max_pending_messages: usize,
    max_pending_messages_across_partitions: usize,
    block_if_queue_full: bool,
    routing_mode: MessageRoutingMode,
    custom_router: Option<Arc<dyn MessageRouter>>,
    hashing_scheme: HashingScheme,
    compression: CompressionType,
    batching_enabled: bool,
    batching_max_messages: usize,
    batching_max_publish_delay: Duration,
    batching_max_bytes: usize,
    initial_sequence_id: u64,
    crypto_key_reader: Option<Arc<dyn CryptoKeyReader>>,
    encryption_keys: BTreeSet<String>,
    crypto_failure_action: CryptoFailureAction,
    properties: BTreeMap<String, String>,
    lookup_retry: RetryPolicy,
}

impl ProducerConfig {
    pub fn builder() -> ProducerConfigBuilder {
        ProducerConfigBuilder::new()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn producer_name(&self) -> Option<&str> {
        self.producer_name.as_deref()
    }

    /// Zero means acknowledgments are awaited forever.
    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Zero means unbounded.
    pub fn max_pending_messages(&self) -> usize {
        self.max_pending_messages
    }

    /// Zero means unbounded.
    pub fn max_pending_messages_across_partitions(&self) -> usize {
        self.max_pending_messages_across_partitions
    }

    pub fn block_if_queue_full(&self) -> bool {
        self.block_if_queue_full
    }

    pub fn routing_mode(&self) -> MessageRoutingMode {
        self.routing_mode
    }

    pub fn custom_router(&self) -> Option<&Arc<dyn MessageRouter>> {
        self.custom_router.as_ref()
    }

    pub fn hashing_scheme(&self) -> HashingScheme {
        self.hashing_scheme
    }

    pub fn compression(&self) -> CompressionType {
        self.compression
    }

    pub fn batching_enabled(&self) -> bool {
        self.batching_enabled
    }

    /// Count trigger actually in force: 1 when batching is disabled.
    pub fn batching_max_messages(&self) -> usize {
        if self.batching_enabled {
            self.batching_max_messages
        } else {
            1
        }
    }

    pub fn batching_max_publish_delay(&self) -> Duration {
        self.batching_max_publish_delay
    }

    pub fn batching_max_bytes(&self) -> usize {
        self.batching_max_bytes
    }

    pub fn initial_sequence_id(&self) -> u64 {
        self.initial_sequence_id
    }

    pub fn crypto_key_reader(&self) -> Option<&Arc<dyn CryptoKeyReader>> {
        self.crypto_key_reader.as_ref()
    }

    pub fn encryption_keys(&self) -> &BTreeSet<String> {
        &self.encryption_keys
    }

    /// Encryption runs only with a key reader and at least one key.
    pub fn encryption_enabled(&self) -> bool {
        self.crypto_key_reader.is_some() && !self.encryption_keys.is_empty()
    }

    pub fn crypto_failure_action(&self) -> CryptoFailureAction {
        self.crypto_failure_action
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Retry policy for partition lookup and connecting at creation.
    pub fn lookup_retry(&self) -> &RetryPolicy {
        &self.lookup_retry
    }
}

impl fmt::Debug for ProducerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProducerConfig")
            .field("topic", &self.topic)
            .field("producer_name", &self.producer_name)
            .field("send_timeout", &self.send_timeout)
            .field("max_pending_messages", &self.max_pending_messages)
            .field(
                "max_pending_messages_across_partitions",
                &self.max_pending_messages_across_partitions,
            )
            .field("block_if_queue_full", &self.block_if_queue_full)
            .field("routing_mode", &self.routing_mode)
            .field("custom_router", &self.custom_router.is_some())
            .field("hashing_scheme", &self.hashing_scheme)
            .field("compression", &self.compression)
            .field("batching_enabled", &self.batching_enabled)
            .field("batching_max_messages", &self.batching_max_messages)
            .field("batching_max_publish_delay", &self.batching_max_publish_delay)
            .field("batching_max_bytes", &self.batching_max_bytes)
            .field("initial_sequence_id", &self.initial_sequence_id)
            .field("crypto_key_reader", &self.crypto_key_reader.is_some())
            .field("encryption_keys", &self.encryption_keys)
            .field("crypto_failure_action", &self.crypto_failure_action)
            .field("properties", &self.properties)
            .field("lookup_retry", &self.lookup_retry)
            .finish()
    }
}

/// Builder for [`ProducerConfig`].
///
/// All fields have defaults except `topic`, which must be set before
/// [`build`](Self::build).
///
/// # Examples
///
/// ```ignore
/// let template = ProducerConfig::builder()
///     .compression(CompressionType::Lz4)
///     .property("app", "billing");
///
/// // Each clone is independent of the template
/// let orders = template.clone().topic("orders").build()?;
/// let refunds = template.clone().topic("refunds").property("team", "finance").build()?;
/// ```
#[derive(Clone)]
pub struct ProducerConfigBuilder {
    config: ProducerConfig,
}

impl ProducerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: ProducerConfig {
                topic: String::new(),
                producer_name: None,
                send_timeout: DEFAULT_SEND_TIMEOUT,
                max_pending_messages: DEFAULT_MAX_PENDING_MESSAGES,
                max_pending_messages_across_partitions:
                    DEFAULT_MAX_PENDING_MESSAGES_ACROSS_PARTITIONS,
                block_if_queue_full: false,
                routing_mode: MessageRoutingMode::default(),
                custom_router: None,
                hashing_scheme: HashingScheme::default(),
                compression: CompressionType::None,
                batching_enabled: true,
                batching_max_messages: DEFAULT_BATCHING_MAX_MESSAGES,
                batching_max_publish_delay: DEFAULT_BATCHING_MAX_PUBLISH_DELAY,
                batching_max_bytes: DEFAULT_BATCHING_MAX_BYTES,
                initial_sequence_id: 0,
                crypto_key_reader: None,
                encryption_keys: BTreeSet::new(),
                crypto_failure_action: CryptoFailureAction::default(),
                properties: BTreeMap::new(),
                lookup_retry: RetryPolicy::default(),
            },
        }
    }

    /// Set the topic (required).
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.config.topic = topic.into();
        self
    }

    pub fn producer_name(mut self, name: impl Into<String>) -> Self {
        self.config.producer_name = Some(name.into());
        self
    }

    /// Time allowed between enqueue and acknowledgment. `Duration::ZERO`
    /// disables the timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.config.send_timeout = timeout;
        self
    }

    pub fn max_pending_messages(mut self, max: usize) -> Self {
        self.config.max_pending_messages = max;
        self
    }

    pub fn max_pending_messages_across_partitions(mut self, max: usize) -> Self {
        self.config.max_pending_messages_across_partitions = max;
        self
    }

    pub fn block_if_queue_full(mut self, block: bool) -> Self {
        self.config.block_if_queue_full = block;
        self
    }

    pub fn routing_mode(mut self, mode: MessageRoutingMode) -> Self {
        self.config.routing_mode = mode;
        self
    }

    /// Install a custom router. Switches the routing mode to
    /// `CustomPartition`.
    pub fn message_router(mut self, router: Arc<dyn MessageRouter>) -> Self {
        self.config.custom_router = Some(router);
        self.config.routing_mode = MessageRoutingMode::CustomPartition;
        self
    }

    pub fn hashing_scheme(mut self, scheme: HashingScheme) -> Self {
        self.config.hashing_scheme = scheme;
        self
    }

    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn batching_enabled(mut self, enabled: bool) -> Self {
        self.config.batching_enabled = enabled;
        self
    }

    pub fn batching_max_messages(mut self, max: usize) -> Self {
        self.config.batching_max_messages = max;
        self
    }

    pub fn batching_max_publish_delay(mut self, delay: Duration) -> Self {
        self.config.batching_max_publish_delay = delay;
        self
    }

    pub fn batching_max_bytes(mut self, max: usize) -> Self {
        self.config.batching_max_bytes = max;
        self
    }

    pub fn initial_sequence_id(mut self, id: u64) -> Self {
        self.config.initial_sequence_id = id;
        self
    }

    pub fn crypto_key_reader(mut self, reader: Arc<dyn CryptoKeyReader>) -> Self {
        self.config.crypto_key_reader = Some(reader);
        self
    }

    /// Add one recipient key name. Each batch data key is wrapped once per
    /// key.
    pub fn add_encryption_key(mut self, key_name: impl Into<String>) -> Self {
        self.config.encryption_keys.insert(key_name.into());
        self
    }

    pub fn crypto_failure_action(mut self, action: CryptoFailureAction) -> Self {
        self.config.crypto_failure_action = action;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.properties.insert(key.into(), value.into());
        self
    }

    pub fn properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.config.properties.extend(properties);
        self
    }

    pub fn lookup_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.lookup_retry = policy;
        self
    }

    /// Apply every field present in `settings` on top of this builder.
    pub fn settings(mut self, settings: ProducerSettings) -> Self {
        let c = &mut self.config;
        if let Some(topic) = settings.topic {
            c.topic = topic;
        }
        if settings.producer_name.is_some() {
            c.producer_name = settings.producer_name;
        }
        if let Some(ms) = settings.send_timeout_ms {
            c.send_timeout = Duration::from_millis(ms);
        }
        if let Some(max) = settings.max_pending_messages {
            c.max_pending_messages = max;
        }
        if let Some(max) = settings.max_pending_messages_across_partitions {
            c.max_pending_messages_across_partitions = max;
        }
        if let Some(block) = settings.block_if_queue_full {
            c.block_if_queue_full = block;
        }
        if let Some(mode) = settings.routing_mode {
            c.routing_mode = mode;
        }
        if let Some(scheme) = settings.hashing_scheme {
            c.hashing_scheme = scheme;
        }
        if let Some(compression) = settings.compression {
            c.compression = compression;
        }
        if let Some(enabled) = settings.batching_enabled {
            c.batching_enabled = enabled;
        }
        if let Some(max) = settings.batching_max_messages {
            c.batching_max_messages = max;
        }
        if let Some(ms) = settings.batching_max_publish_delay_ms {
            c.batching_max_publish_delay = Duration::from_millis(ms);
        }
        if let Some(max) = settings.batching_max_bytes {
            c.batching_max_bytes = max;
        }
        if let Some(id) = settings.initial_sequence_id {
            c.initial_sequence_id = id;
        }
        c.encryption_keys.extend(settings.encryption_keys);
        if let Some(action) = settings.crypto_failure_action {
            c.crypto_failure_action = action;
        }
        c.properties.extend(settings.properties);
        if let Some(retries) = settings.lookup_max_retries {
            c.lookup_retry.max_retries = retries;
        }
        self
    }

    /// Validate and freeze the configuration.
    ///
    /// # Errors
    ///
    /// `ClientError::Configuration` when the topic is unset or malformed,
    /// custom routing has no router, batching thresholds are zero, or
    /// encryption keys are set without a key reader.
    pub fn build(self) -> Result<ProducerConfig> {
        let config = self.config;

        validate_topic(&config.topic)?;

        if config.routing_mode == MessageRoutingMode::CustomPartition
            && config.custom_router.is_none()
        {
            return Err(ClientError::Configuration(
                "CustomPartition routing requires a message router".to_string(),
            ));
        }

        if config.batching_enabled && config.batching_max_messages == 0 {
            return Err(ClientError::Configuration(
                "batching_max_messages must be at least 1".to_string(),
            ));
        }

        if config.batching_max_bytes == 0 {
            return Err(ClientError::Configuration(
                "batching_max_bytes must be at least 1".to_string(),
            ));
        }

        if !config.encryption_keys.is_empty() && config.crypto_key_reader.is_none() {
            return Err(ClientError::Configuration(
                "encryption keys are set but no crypto key reader is configured".to_string(),
            ));
        }

        Ok(config)
    }
}

impl Default for ProducerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn validate_topic(topic: &str) -> Result<()> {
    if topic.trim().is_empty() {
        return Err(ClientError::Configuration(
            "Topic name must be set on the producer builder".to_string(),
        ));
    }
    if topic.chars().any(char::is_whitespace) {
        return Err(ClientError::Configuration(format!(
            "Invalid topic name '{}': whitespace is not allowed",
            topic
        )));
    }
    Ok(())
}

/// Plain producer tunables as they appear in a TOML file.
///
/// Durations are milliseconds. Runtime handles (custom router, key reader)
/// cannot be expressed here and are attached on the builder.
///
/// ```toml
/// topic = "orders"
/// send_timeout_ms = 10000
/// routing_mode = "round_robin_partition"
/// compression = "lz4"
/// batching_max_messages = 500
///
/// [properties]
/// app = "billing"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProducerSettings {
    pub topic: Option<String>,
    pub producer_name: Option<String>,
    pub send_timeout_ms: Option<u64>,
    pub max_pending_messages: Option<usize>,
    pub max_pending_messages_across_partitions: Option<usize>,
    pub block_if_queue_full: Option<bool>,
    pub routing_mode: Option<MessageRoutingMode>,
    pub hashing_scheme: Option<HashingScheme>,
    pub compression: Option<CompressionType>,
    pub batching_enabled: Option<bool>,
    pub batching_max_messages: Option<usize>,
    pub batching_max_publish_delay_ms: Option<u64>,
    pub batching_max_bytes: Option<usize>,
    pub initial_sequence_id: Option<u64>,
    pub encryption_keys: Vec<String>,
    pub crypto_failure_action: Option<CryptoFailureAction>,
    pub properties: BTreeMap<String, String>,
    pub lookup_max_retries: Option<usize>,
}

impl ProducerSettings {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ClientError::Configuration(format!("invalid producer settings: {}", e)))
    }

    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            ClientError::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }
}
