//! Blob store over a local directory tree.
//!
//! The default backend for single-machine use: folders map to
//! directories under the store root and blob ids are root-relative
//! paths. Useful for a network share or a directory watched by an
//! external sync client.

use super::{BlobHandle, BlobMeta, BlobStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Filesystem-backed blob store.
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&root).map_err(io_error)?;
        Ok(Self { root })
    }

    fn resolve(&self, id: &str) -> Result<PathBuf, StoreError> {
        if id.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(StoreError::Fatal(format!("invalid blob id {id:?}")));
        }
        Ok(self.root.join(id))
    }
}

fn io_error(err: std::io::Error) -> StoreError {
    StoreError::Fatal(format!("filesystem store: {err}"))
}

fn meta_for(id: &str, name: &str, path: &Path) -> Result<BlobMeta, StoreError> {
    let meta = std::fs::metadata(path).map_err(io_error)?;
    let modified: DateTime<Utc> = meta.modified().map_err(io_error)?.into();
    Ok(BlobMeta {
        id: id.to_string(),
        name: name.to_string(),
        mime: "application/json".into(),
        modified,
        size: meta.len(),
    })
}

#[async_trait]
impl BlobStore for FsStore {
    async fn find_or_create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
    ) -> Result<String, StoreError> {
        let id = match parent {
            Some(parent) => format!("{parent}/{name}"),
            None => name.to_string(),
        };
        let path = self.resolve(&id)?;
        std::fs::create_dir_all(path).map_err(io_error)?;
        Ok(id)
    }

    async fn list(
        &self,
        folder_id: &str,
        query: Option<&str>,
        page: Option<u32>,
    ) -> Result<Vec<BlobMeta>, StoreError> {
        if page.unwrap_or(0) > 0 {
            return Ok(Vec::new());
        }
        let dir = self.resolve(folder_id)?;
        let mut out = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(io_error(e)),
        };
        for entry in entries {
            let entry = entry.map_err(io_error)?;
            if !entry.file_type().map_err(io_error)?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if query.map_or(false, |q| q != name) {
                continue;
            }
            let id = format!("{folder_id}/{name}");
            out.push(meta_for(&id, &name, &entry.path())?);
        }
        out.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn upload(
        &self,
        name: &str,
        bytes: &[u8],
        folder_id: &str,
    ) -> Result<BlobHandle, StoreError> {
        let id = format!("{folder_id}/{name}");
        let path = self.resolve(&id)?;
        std::fs::write(&path, bytes).map_err(io_error)?;
        Ok(BlobHandle {
            id,
            size: bytes.len() as u64,
        })
    }

    async fn download(&self, id: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.resolve(id)?;
        std::fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::Fatal(format!("no such blob {id:?}")),
            _ => io_error(e),
        })
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let path = self.resolve(id)?;
        std::fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::Fatal(format!("no such blob {id:?}")),
            _ => io_error(e),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_through_directories() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsStore::new(tmp.path().join("remote")).unwrap();

        let folder = store.find_or_create_folder("backups", None).await.unwrap();
        let nested = store
            .find_or_create_folder("2024", Some(&folder))
            .await
            .unwrap();
        assert_eq!(nested, "backups/2024");

        let handle = store.upload("a.json", b"{}", &nested).await.unwrap();
        assert_eq!(store.download(&handle.id).await.unwrap(), b"{}");

        let listed = store.list(&nested, Some("a.json"), None).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 2);

        store.delete(&handle.id).await.unwrap();
        assert!(store.download(&handle.id).await.is_err());
    }

    #[tokio::test]
    async fn listing_a_missing_folder_is_empty() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsStore::new(tmp.path().join("remote")).unwrap();
        assert!(store.list("nowhere", None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn path_escapes_are_rejected() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsStore::new(tmp.path().join("remote")).unwrap();
        assert!(store.download("../outside").await.is_err());
    }

    #[tokio::test]
    async fn query_filter_matches_exact_name() {
        let tmp = tempfile::TempDir::new().unwrap();
        let store = FsStore::new(tmp.path().join("remote")).unwrap();
        let folder = store.find_or_create_folder("backups", None).await.unwrap();
        store.upload("a.json", b"1", &folder).await.unwrap();
        store.upload("b.json", b"2", &folder).await.unwrap();

        let all = store.list(&folder, None, None).await.unwrap();
        assert_eq!(all.len(), 2);
        let only = store.list(&folder, Some("b.json"), None).await.unwrap();
        assert_eq!(only.len(), 1);
        assert_eq!(only[0].name, "b.json");
    }
}
