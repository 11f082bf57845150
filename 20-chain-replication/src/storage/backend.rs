//! Durable backing stores for [`super::EncryptedStore`].
//!
//! One record per key; the value is the opaque encrypted blob. Methods return
//! futures (RPITIT) so the engine can await disk I/O inside `flush`.

use std::collections::BTreeMap;
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

pub trait Backend: Send + Sync + 'static {
    /// Stores `blob` under `key`, replacing any previous record.
    fn write(&self, key: &str, blob: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send;

    fn read(&self, key: &str) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send;

    /// All durable records, ordered by key.
    fn entries(&self) -> impl Future<Output = io::Result<Vec<(String, Vec<u8>)>>> + Send;

    /// Makes every preceding `write` durable.
    fn sync(&self) -> impl Future<Output = io::Result<()>> + Send;
}

/// On-disk store backed by sled.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }
}

impl Backend for SledBackend {
    async fn write(&self, key: &str, blob: Vec<u8>) -> io::Result<()> {
        self.db.insert(key.as_bytes(), blob)?;
        Ok(())
    }

    async fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.db.get(key.as_bytes())?.map(|value| value.to_vec()))
    }

    async fn entries(&self) -> io::Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        for entry in self.db.iter() {
            let (key, value) = entry?;
            let key = String::from_utf8(key.to_vec())
                .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
            entries.push((key, value.to_vec()));
        }
        Ok(entries)
    }

    async fn sync(&self) -> io::Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }
}

/// In-memory store with failure injection, for tests and ephemeral nodes.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
    failing_key: Mutex<Option<String>>,
    hold_writes: AtomicBool,
    released: Notify,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `write` fail until turned off again.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes writes of `key` fail until cleared with `None`.
    pub fn fail_key(&self, key: Option<&str>) {
        *self
            .failing_key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = key.map(str::to_string);
    }

    /// Makes every subsequent `write` wait for [`MemoryBackend::release`].
    pub fn hold_writes(&self, hold: bool) {
        self.hold_writes.store(hold, Ordering::SeqCst);
    }

    /// Lets one held `write` proceed.
    pub fn release(&self) {
        self.released.notify_one();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Backend for MemoryBackend {
    async fn write(&self, key: &str, blob: Vec<u8>) -> io::Result<()> {
        if self.hold_writes.load(Ordering::SeqCst) {
            self.released.notified().await;
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("injected write failure"));
        }
        let failing = self
            .failing_key
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_deref()
            == Some(key);
        if failing {
            return Err(io::Error::other(format!("injected write failure for {key}")));
        }
        self.lock().insert(key.to_string(), blob);
        Ok(())
    }

    async fn read(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.lock().get(key).cloned())
    }

    async fn entries(&self) -> io::Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .lock()
            .iter()
            .map(|(key, blob)| (key.clone(), blob.clone()))
            .collect())
    }

    async fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

impl<B: Backend> Backend for std::sync::Arc<B> {
    fn write(&self, key: &str, blob: Vec<u8>) -> impl Future<Output = io::Result<()>> + Send {
        B::write(self, key, blob)
    }

    fn read(&self, key: &str) -> impl Future<Output = io::Result<Option<Vec<u8>>>> + Send {
        B::read(self, key)
    }

    fn entries(&self) -> impl Future<Output = io::Result<Vec<(String, Vec<u8>)>>> + Send {
        B::entries(self)
    }

    fn sync(&self) -> impl Future<Output = io::Result<()>> + Send {
        B::sync(self)
    }
}
