//! End-to-end batch encryption.
//!
//! Each flushed batch is sealed with a fresh random data key. The data key is
//! then wrapped once per configured recipient key, so any recipient holding
//! one of the named keys can open the batch.
//!
//! ## Scheme
//!
//! ```text
//!  data key (32 random bytes) ──AES-256-GCM──▶ payload ciphertext ‖ tag
//!       │
//!       └─ for each recipient key name:
//!            KEK = HKDF-SHA256(salt, key material, info = key name)
//!            wrapped = nonce ‖ AES-256-GCM(KEK, data key) ‖ tag
//! ```
//!
//! Recipient key material comes from a [`CryptoKeyReader`]. Wrapping is
//! symmetric: the same material that wraps a data key on the producer unwraps
//! it on the receiver.

use crate::error::{ClientError, Result};
use bytes::Bytes;
use meridian_core::{EncryptionMetadata, WrappedDataKey};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hkdf::{Salt, HKDF_SHA256};
use ring::rand::{SecureRandom, SystemRandom};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Algorithm name recorded in [`EncryptionMetadata`].
pub const ALGORITHM: &str = "AES-256-GCM";

const KEY_LEN: usize = 32;
const TAG_LEN: usize = 16;
const WRAP_SALT: &[u8] = b"meridian-key-wrap-v1";

/// Key material and metadata for one named recipient key.
#[derive(Clone)]
pub struct EncryptionKeyInfo {
    key: Vec<u8>,
    metadata: BTreeMap<String, String>,
}

impl EncryptionKeyInfo {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

impl fmt::Debug for EncryptionKeyInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptionKeyInfo")
            .field("key", &"[REDACTED]")
            .field("metadata", &self.metadata)
            .finish()
    }
}

/// Source of recipient key material.
///
/// Called on the flush path for every batch, so implementations should
/// answer from memory or a cache.
pub trait CryptoKeyReader: Send + Sync {
    /// Material for `key_name`, or `None` when the key is unknown.
    fn get_key(&self, key_name: &str) -> Option<EncryptionKeyInfo>;
}

/// In-memory [`CryptoKeyReader`] backed by a map of named keys.
///
/// # Examples
///
/// ```ignore
/// let reader = StaticKeyReader::new().with_key("billing", b"0123456789abcdef".to_vec());
/// reader.remove_key("billing"); // subsequent batches fail to encrypt
/// ```
#[derive(Default)]
pub struct StaticKeyReader {
    keys: RwLock<HashMap<String, EncryptionKeyInfo>>,
}

impl StaticKeyReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(self, key_name: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        self.add_key(key_name, EncryptionKeyInfo::new(key));
        self
    }

    pub fn add_key(&self, key_name: impl Into<String>, info: EncryptionKeyInfo) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key_name.into(), info);
    }

    pub fn remove_key(&self, key_name: &str) -> Option<EncryptionKeyInfo> {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key_name)
    }
}

impl CryptoKeyReader for StaticKeyReader {
    fn get_key(&self, key_name: &str) -> Option<EncryptionKeyInfo> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key_name)
            .cloned()
    }
}

impl fmt::Debug for StaticKeyReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.keys.read().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<&String> = keys.keys().collect();
        names.sort();
        f.debug_struct("StaticKeyReader")
            .field("keys", &names)
            .finish()
    }
}

/// HKDF output length marker
struct WrapKeyLen;

impl ring::hkdf::KeyType for WrapKeyLen {
    fn len(&self) -> usize {
        KEY_LEN
    }
}

/// Seals batch payloads for a fixed set of recipient keys.
pub struct MessageCrypto {
    reader: Arc<dyn CryptoKeyReader>,
    key_names: Vec<String>,
    rng: SystemRandom,
}

impl MessageCrypto {
    pub fn new(reader: Arc<dyn CryptoKeyReader>, key_names: impl IntoIterator<Item = String>) -> Self {
        Self {
            reader,
            key_names: key_names.into_iter().collect(),
            rng: SystemRandom::new(),
        }
    }

    pub fn key_names(&self) -> &[String] {
        &self.key_names
    }

    /// Seal `payload` under a new data key.
    ///
    /// # Returns
    ///
    /// The metadata receivers need (nonce and one wrapped key per recipient)
    /// and the ciphertext with its authentication tag appended.
    ///
    /// # Errors
    ///
    /// `ClientError::Encryption` when randomness is unavailable, a recipient
    /// key is unknown to the reader, or sealing fails.
    pub fn encrypt(&self, payload: &[u8]) -> Result<(EncryptionMetadata, Bytes)> {
        if self.key_names.is_empty() {
            return Err(ClientError::Encryption(
                "no encryption keys configured".to_string(),
            ));
        }

        let mut data_key = [0u8; KEY_LEN];
        self.rng
            .fill(&mut data_key)
            .map_err(|_| ClientError::Encryption("data key generation failed".to_string()))?;

        let mut keys = Vec::with_capacity(self.key_names.len());
        for key_name in &self.key_names {
            let info = self.reader.get_key(key_name).ok_or_else(|| {
                ClientError::Encryption(format!("key '{}' is not available", key_name))
            })?;
            let wrapped = self.wrap_data_key(key_name, info.key(), &data_key)?;
            keys.push(WrappedDataKey {
                key_name: key_name.clone(),
                wrapped_key: wrapped,
                metadata: info.metadata,
            });
        }

        let nonce = self.nonce()?;
        let sealed = seal(&data_key, nonce, payload)?;

        Ok((
            EncryptionMetadata {
                algorithm: ALGORITHM.to_string(),
                nonce: Bytes::copy_from_slice(&nonce),
                keys,
            },
            sealed,
        ))
    }

    /// Open a payload sealed by [`encrypt`](Self::encrypt).
    ///
    /// Tries each wrapped key the reader knows about, in frame order.
    pub fn decrypt(
        metadata: &EncryptionMetadata,
        payload: &[u8],
        reader: &dyn CryptoKeyReader,
    ) -> Result<Bytes> {
        if metadata.algorithm != ALGORITHM {
            return Err(ClientError::Encryption(format!(
                "unsupported algorithm '{}'",
                metadata.algorithm
            )));
        }

        let mut last_error = None;
        for wrapped in &metadata.keys {
            let Some(info) = reader.get_key(&wrapped.key_name) else {
                continue;
            };
            match unwrap_data_key(&wrapped.key_name, info.key(), &wrapped.wrapped_key) {
                Ok(data_key) => return open(&data_key, &metadata.nonce, payload),
                Err(e) => last_error = Some(e),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            ClientError::Encryption("none of the batch keys is available".to_string())
        }))
    }

    fn nonce(&self) -> Result<[u8; NONCE_LEN]> {
        let mut nonce = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce)
            .map_err(|_| ClientError::Encryption("nonce generation failed".to_string()))?;
        Ok(nonce)
    }

    fn wrap_data_key(&self, key_name: &str, material: &[u8], data_key: &[u8]) -> Result<Bytes> {
        let kek = derive_wrapping_key(key_name, material)?;
        let nonce = self.nonce()?;
        let sealed = seal(&kek, nonce, data_key)?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + sealed.len());
        wrapped.extend_from_slice(&nonce);
        wrapped.extend_from_slice(&sealed);
        Ok(Bytes::from(wrapped))
    }
}

impl fmt::Debug for MessageCrypto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCrypto")
            .field("key_names", &self.key_names)
            .finish()
    }
}

fn derive_wrapping_key(key_name: &str, material: &[u8]) -> Result<[u8; KEY_LEN]> {
    if material.is_empty() {
        return Err(ClientError::Encryption(format!(
            "key '{}' has empty key material",
            key_name
        )));
    }

    let salt = Salt::new(HKDF_SHA256, WRAP_SALT);
    let prk = salt.extract(material);
    let info = [key_name.as_bytes()];
    let okm = prk
        .expand(&info, WrapKeyLen)
        .map_err(|_| ClientError::Encryption("key derivation failed".to_string()))?;

    let mut kek = [0u8; KEY_LEN];
    okm.fill(&mut kek)
        .map_err(|_| ClientError::Encryption("key expansion failed".to_string()))?;
    Ok(kek)
}

fn unwrap_data_key(key_name: &str, material: &[u8], wrapped: &[u8]) -> Result<[u8; KEY_LEN]> {
    if wrapped.len() != NONCE_LEN + KEY_LEN + TAG_LEN {
        return Err(ClientError::Encryption(format!(
            "wrapped key for '{}' has invalid length {}",
            key_name,
            wrapped.len()
        )));
    }

    let kek = derive_wrapping_key(key_name, material)?;
    let (nonce, sealed) = wrapped.split_at(NONCE_LEN);
    let opened = open(&kek, nonce, sealed)?;

    let mut data_key = [0u8; KEY_LEN];
    data_key.copy_from_slice(&opened);
    Ok(data_key)
}

fn aead_key(key: &[u8]) -> Result<LessSafeKey> {
    let unbound = UnboundKey::new(&AES_256_GCM, key)
        .map_err(|_| ClientError::Encryption("invalid key length".to_string()))?;
    Ok(LessSafeKey::new(unbound))
}

fn seal(key: &[u8], nonce: [u8; NONCE_LEN], plaintext: &[u8]) -> Result<Bytes> {
    let key = aead_key(key)?;
    let mut buf = Vec::with_capacity(plaintext.len() + TAG_LEN);
    buf.extend_from_slice(plaintext);

    let tag = key
        .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buf)
        .map_err(|_| ClientError::Encryption("seal failed".to_string()))?;
    buf.extend_from_slice(tag.as_ref());
    Ok(Bytes::from(buf))
}

fn open(key: &[u8], nonce: &[u8], ciphertext: &[u8]) -> Result<Bytes> {
    let key = aead_key(key)?;
    let nonce = Nonce::try_assume_unique_for_key(nonce)
        .map_err(|_| ClientError::Encryption("invalid nonce".to_string()))?;

    let mut buf = ciphertext.to_vec();
    let plaintext_len = key
        .open_in_place(nonce, Aad::empty(), &mut buf)
        .map_err(|_| ClientError::Encryption("authentication failed".to_string()))?
        .len();
    buf.truncate(plaintext_len);
    Ok(Bytes::from(buf))
}
