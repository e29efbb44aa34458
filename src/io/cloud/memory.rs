use super::{ObjectMeta, ObjectStore};
use crate::io::compression::DynRead;
use anyhow::anyhow;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

type BucketStorage = Arc<Mutex<HashMap<String, BTreeMap<String, Bytes>>>>;

/// Object storage held in process memory.
///
/// Clones share contents, so a test can keep a handle after registering the
/// store with a pipeline.
#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    storage: BucketStorage,
    opens: Arc<AtomicU64>,
}

impl MemoryObjectStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        self.storage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), data.into());
    }

    /// How many readers have been opened.
    #[must_use]
    pub fn opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    fn get(&self, bucket: &str, key: &str) -> anyhow::Result<Bytes> {
        let storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        storage
            .get(bucket)
            .and_then(|b| b.get(key))
            .cloned()
            .ok_or_else(|| anyhow!("object {bucket}/{key} not found"))
    }
}

impl ObjectStore for MemoryObjectStore {
    fn open(&self, bucket: &str, key: &str) -> anyhow::Result<DynRead> {
        let data = self.get(bucket, key)?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(Cursor::new(data)))
    }

    fn list(&self, bucket: &str, prefix: &str) -> anyhow::Result<Vec<ObjectMeta>> {
        let storage = self.storage.lock().unwrap_or_else(PoisonError::into_inner);
        let objects = storage
            .get(bucket)
            .ok_or_else(|| anyhow!("bucket {bucket} not found"))?;
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, data)| ObjectMeta {
                key: key.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    fn fetch(&self, bucket: &str, key: &str) -> anyhow::Result<Bytes> {
        let data = self.get(bucket, key)?;
        self.opens.fetch_add(1, Ordering::Relaxed);
        Ok(data)
    }
}
