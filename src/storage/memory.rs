//! In-memory blob store for engine tests.
//!
//! Behaves like the real service, including fault injection: queued
//! errors are returned by the next upload calls in order, which is how
//! the retry-ladder tests script "fail N times, then succeed".

use super::{BlobHandle, BlobMeta, BlobStore, StoreError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

struct StoredBlob {
    meta: BlobMeta,
    folder_id: String,
    bytes: Vec<u8>,
}

struct Folder {
    name: String,
    parent: Option<String>,
}

#[derive(Default)]
struct Inner {
    folders: HashMap<String, Folder>,
    blobs: HashMap<String, StoredBlob>,
    upload_faults: VecDeque<StoreError>,
    next_id: u64,
}

impl Inner {
    fn fresh_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }
}

/// Test double for the remote object service.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for an upcoming upload call.
    pub fn push_upload_fault(&self, err: StoreError) {
        self.inner.lock().upload_faults.push_back(err);
    }

    /// Number of blobs currently stored.
    pub fn blob_count(&self) -> usize {
        self.inner.lock().blobs.len()
    }

    /// Raw bytes of a blob (assertions).
    pub fn bytes_of(&self, id: &str) -> Option<Vec<u8>> {
        self.inner.lock().blobs.get(id).map(|b| b.bytes.clone())
    }
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn find_or_create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.lock();
        let existing = inner
            .folders
            .iter()
            .find(|(_, f)| f.name == name && f.parent.as_deref() == parent)
            .map(|(id, _)| id.clone());
        if let Some(id) = existing {
            return Ok(id);
        }
        let id = inner.fresh_id("folder");
        inner.folders.insert(
            id.clone(),
            Folder {
                name: name.to_string(),
                parent: parent.map(str::to_string),
            },
        );
        Ok(id)
    }

    async fn list(
        &self,
        folder_id: &str,
        query: Option<&str>,
        page: Option<u32>,
    ) -> Result<Vec<BlobMeta>, StoreError> {
        // Everything fits one page here.
        if page.unwrap_or(0) > 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock();
        let mut out: Vec<BlobMeta> = inner
            .blobs
            .values()
            .filter(|b| b.folder_id == folder_id)
            .filter(|b| query.map_or(true, |q| b.meta.name == q))
            .map(|b| b.meta.clone())
            .collect();
        out.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn upload(
        &self,
        name: &str,
        bytes: &[u8],
        folder_id: &str,
    ) -> Result<BlobHandle, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(err) = inner.upload_faults.pop_front() {
            return Err(err);
        }
        if !inner.folders.contains_key(folder_id) {
            return Err(StoreError::Fatal(format!("no such folder {folder_id:?}")));
        }
        let id = inner.fresh_id("blob");
        let meta = BlobMeta {
            id: id.clone(),
            name: name.to_string(),
            mime: "application/json".into(),
            modified: Utc::now(),
            size: bytes.len() as u64,
        };
        inner.blobs.insert(
            id.clone(),
            StoredBlob {
                meta,
                folder_id: folder_id.to_string(),
                bytes: bytes.to_vec(),
            },
        );
        Ok(BlobHandle {
            id,
            size: bytes.len() as u64,
        })
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        self.inner
            .lock()
            .blobs
            .get(id)
            .map(|b| b.bytes.clone())
            .ok_or_else(|| StoreError::Fatal(format!("no such blob {id:?}")))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.inner
            .lock()
            .blobs
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::Fatal(format!("no such blob {id:?}")))
    }
}
