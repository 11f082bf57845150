//! Encrypted write-back key-value storage.
//!
//! Values are accepted into memory by [`EncryptedStore::put`] and marked dirty.
//! [`EncryptedStore::flush`] encrypts every dirty value (see [`crypto`]) and
//! writes it to the [`Backend`]. Reads never touch the backend; durable records
//! are only consulted by the diagnostic and `restore` paths.

pub mod backend;
pub mod crypto;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::config::StorageConfig;
use crate::error::StorageError;

pub use backend::{Backend, MemoryBackend, SledBackend};
pub use crypto::Sealer;

/// Bit set in [`EncryptedStore::status`] when the key is resident in memory.
pub const IN_MEMORY: u8 = 0b01;
/// Bit set in [`EncryptedStore::status`] when the key has a durable record.
pub const ON_DISK: u8 = 0b10;

#[derive(Default)]
struct Cache {
    values: HashMap<String, Vec<u8>>,
    dirty: HashSet<String>,
}

pub struct EncryptedStore<B = SledBackend> {
    cache: Mutex<Cache>,
    flushing: AtomicBool,
    sealer: Sealer,
    backend: B,
}

impl EncryptedStore<SledBackend> {
    /// Opens (or creates) the sled database named by `config.path`.
    pub fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let sealer = Sealer::from_pem(&config.public_key_pem, config.modulus_bits)?;
        let backend = SledBackend::open(&config.path)?;
        Ok(Self::with_backend(sealer, backend))
    }
}

impl<B: Backend> EncryptedStore<B> {
    pub fn with_backend(sealer: Sealer, backend: B) -> Self {
        Self {
            cache: Mutex::new(Cache::default()),
            flushing: AtomicBool::new(false),
            sealer,
            backend,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Stores `value` in memory and marks `key` dirty. No I/O.
    pub fn put(&self, key: impl Into<String>, value: impl Into<Vec<u8>>) {
        let key = key.into();
        let mut cache = self.lock();
        cache.values.insert(key.clone(), value.into());
        cache.dirty.insert(key);
    }

    /// In-memory value for `key`. Never touches the backend.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.lock().values.get(key).cloned()
    }

    /// Number of distinct keys resident in memory.
    pub fn count(&self) -> usize {
        self.lock().values.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.lock().dirty.len()
    }

    pub fn is_dirty(&self, key: &str) -> bool {
        self.lock().dirty.contains(key)
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::SeqCst)
    }

    /// Encrypts and durably writes every dirty value.
    ///
    /// Only one flush may run at a time per engine. Nothing counts as durable
    /// before the backend sync, so if writing any key fails the flush stops
    /// there and every key in the batch stays dirty.
    pub async fn flush(&self) -> Result<(), StorageError> {
        let _guard = FlushGuard::acquire(&self.flushing)?;

        let batch: Vec<(String, Vec<u8>)> = {
            let cache = self.lock();
            cache
                .dirty
                .iter()
                .filter_map(|key| cache.values.get(key).map(|value| (key.clone(), value.clone())))
                .collect()
        };
        if batch.is_empty() {
            return Ok(());
        }

        for (key, value) in &batch {
            let blob = self.sealer.seal(value)?;
            if let Err(source) = self.backend.write(key, blob).await {
                warn!(%key, error = %source, "flush aborted");
                return Err(StorageError::Flush {
                    key: key.clone(),
                    source,
                });
            }
        }
        self.backend.sync().await?;

        let mut cache = self.lock();
        for (key, value) in batch {
            // A put that landed while this flush was running keeps its dirty mark.
            if cache.values.get(&key) == Some(&value) {
                cache.dirty.remove(&key);
            }
        }
        debug!(remaining = cache.dirty.len(), "flush complete");
        Ok(())
    }

    pub async fn has_stored(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.backend.read(key).await?.is_some())
    }

    /// Raw ciphertext of the durable record for `key`.
    pub async fn get_stored(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.backend.read(key).await?)
    }

    /// Bit mask of [`IN_MEMORY`] and [`ON_DISK`].
    pub async fn status(&self, key: &str) -> Result<u8, StorageError> {
        let mut mask = 0;
        if self.lock().values.contains_key(key) {
            mask |= IN_MEMORY;
        }
        if self.backend.read(key).await?.is_some() {
            mask |= ON_DISK;
        }
        Ok(mask)
    }

    /// Re-admits an already durable value into memory without marking it dirty.
    ///
    /// `signature` must be [`crypto::sign_value`] of `value` by the holder of
    /// the private key matching this engine's public key.
    pub async fn restore(&self, key: &str, value: Vec<u8>, signature: &[u8]) -> Result<(), StorageError> {
        if self.lock().values.contains_key(key) {
            return Err(StorageError::AlreadyStored);
        }
        if self.backend.read(key).await?.is_none() {
            return Err(StorageError::NoSuchValue);
        }
        if !self.sealer.verify(&value, signature) {
            return Err(StorageError::InvalidSignature);
        }

        let mut cache = self.lock();
        if cache.values.contains_key(key) {
            return Err(StorageError::AlreadyStored);
        }
        cache.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Durable records whose keys are not resident in memory.
    pub async fn get_encrypted(&self) -> Result<BTreeMap<String, Vec<u8>>, StorageError> {
        let entries = self.backend.entries().await?;
        let cache = self.lock();
        Ok(entries
            .into_iter()
            .filter(|(key, _)| !cache.values.contains_key(key))
            .collect())
    }

    /// Syncs the backend and releases it.
    pub async fn close(self) -> Result<(), StorageError> {
        self.backend.sync().await?;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Cache> {
        self.cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, StorageError> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| StorageError::FlushInProgress)?;
        Ok(Self(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
