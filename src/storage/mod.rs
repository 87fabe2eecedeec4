//! Remote blob storage capability.
//!
//! The core talks to a Drive-like object service through the
//! [`BlobStore`] trait and acquires credentials through [`TokenSource`].
//! Errors are typed so callers can route them: `Unauthorized` triggers
//! one transparent token refresh, `RateLimited`/`Transient`/
//! `QuotaExceeded` feed the retry state machine, `Fatal` surfaces.
//!
//! Backends: [`HttpStore`] (REST service, reqwest), [`FsStore`] (local
//! directory), [`MemoryStore`] (tests, with fault injection).

mod fs;
mod http;
mod memory;

pub use fs::FsStore;
pub use http::{HttpStore, HttpStoreConfig};
pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Typed failures from the blob service.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The token was rejected. Refreshed once, then surfaced.
    #[error("unauthorized")]
    Unauthorized,
    /// Too many requests; the payload carries the server's requested
    /// wait in seconds.
    #[error("rate limited, retry after {0}s")]
    RateLimited(u64),
    /// The account is out of storage.
    #[error("quota exceeded")]
    QuotaExceeded,
    /// Network trouble or a 5xx; safe to retry with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Anything else; not retried.
    #[error("fatal: {0}")]
    Fatal(String),
}

/// Listing entry for a stored blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobMeta {
    pub id: String,
    pub name: String,
    pub mime: String,
    pub modified: DateTime<Utc>,
    pub size: u64,
}

/// Result of an upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobHandle {
    pub id: String,
    pub size: u64,
}

/// Capability interface over the remote object service.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Return the id of the named folder under `parent` (root when
    /// `None`), creating it if absent.
    async fn find_or_create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, StoreError>;

    /// List blobs in a folder, optionally filtered by exact name and
    /// paged from 0.
    async fn list(
        &self,
        folder_id: &str,
        query: Option<&str>,
        page: Option<u32>,
    ) -> Result<Vec<BlobMeta>, StoreError>;

    /// Store bytes under a name inside a folder.
    async fn upload(
        &self,
        name: &str,
        bytes: &[u8],
        folder_id: &str,
    ) -> Result<BlobHandle, StoreError>;

    /// Fetch a blob's bytes by id.
    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError>;

    /// Delete a blob by id.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

/// Credential provider. The core never refreshes more than once per
/// failed call: `invalidate` then `get(false)`.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn get(&self, interactive: bool) -> Result<String, StoreError>;
    async fn invalidate(&self, token: &str);
}

/// Token source over a fixed credential (config/env supplied).
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn get(&self, _interactive: bool) -> Result<String, StoreError> {
        if self.0.is_empty() {
            return Err(StoreError::Unauthorized);
        }
        Ok(self.0.clone())
    }

    async fn invalidate(&self, _token: &str) {}
}
