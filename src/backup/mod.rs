//! The backup transaction.
//!
//! One `run()` drives a single backup end to end: persist an
//! `InProgress` record, snapshot the tree, skip the upload entirely when
//! the root hash matches the previous completed backup, otherwise encode
//! a full or incremental payload, optionally seal it in an envelope,
//! upload under a deterministic filename, complete the record, and
//! enforce retention. Every status transition is persisted before the
//! next I/O step, and uploads short-circuit on an existing identical
//! file, so a retried transaction never duplicates blobs.

mod record;

pub use record::{BackupKind, BackupRecord, BackupStatus, RetryDecision};

use crate::bookmarks::{BookmarkNode, BookmarkProvider, TreeSnapshot, PROTECTED_IDS};
use crate::crypto::{open_blob, CryptoEngine};
use crate::delta::{self, ApplyReport, Delta, IncrementalBlob};
use crate::error::SyncError;
use crate::events::{Event, EventBus};
use crate::queue::RetryPolicy;
use crate::schedule::RETENTION_UNLIMITED;
use crate::state::StateStore;
use crate::storage::{BlobHandle, BlobStore};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

/// Upper bound on an incremental restore chain; anything longer means
/// corrupted metadata.
const MAX_CHAIN_LENGTH: usize = 256;

/// Engine settings.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Remote folder all blobs live under.
    pub folder_name: String,
    /// Prefer incremental payloads when a completed base exists.
    pub incremental: bool,
    pub retry: RetryPolicy,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            folder_name: "bookvault".into(),
            incremental: true,
            retry: RetryPolicy::default(),
        }
    }
}

/// Drives backup transactions and owns the backup records.
pub struct BackupEngine {
    provider: Arc<dyn BookmarkProvider>,
    store: Arc<dyn BlobStore>,
    state: Arc<StateStore>,
    crypto: Option<CryptoEngine>,
    config: BackupConfig,
    events: EventBus,
}

impl BackupEngine {
    pub fn new(
        provider: Arc<dyn BookmarkProvider>,
        store: Arc<dyn BlobStore>,
        state: Arc<StateStore>,
        crypto: Option<CryptoEngine>,
        config: BackupConfig,
        events: EventBus,
    ) -> Self {
        Self {
            provider,
            store,
            state,
            crypto,
            config,
            events,
        }
    }

    /// Run a fresh backup transaction.
    pub async fn run(
        &self,
        kind: BackupKind,
        schedule_id: Option<&str>,
    ) -> Result<BackupRecord, SyncError> {
        let mut record = BackupRecord::new(kind, schedule_id, Utc::now());
        record.max_attempts = self.config.retry.max_attempts;
        self.persist(&record)?;
        self.drive(&mut record).await
    }

    /// Re-dispatch a `RetryPending` record.
    pub async fn retry(&self, record_id: &str) -> Result<BackupRecord, SyncError> {
        let mut record = self
            .state
            .backup(record_id)
            .map_err(internal)?
            .ok_or_else(|| SyncError::Fatal(format!("no backup record {record_id:?}")))?;
        if record.status != BackupStatus::RetryPending {
            return Err(SyncError::Fatal(format!(
                "record {record_id:?} is {}, not retry_pending",
                record.status.label()
            )));
        }
        record.begin_retry();
        self.persist(&record)?;
        self.drive(&mut record).await
    }

    /// Execute the transaction body and translate the outcome into the
    /// record's status machine.
    async fn drive(&self, record: &mut BackupRecord) -> Result<BackupRecord, SyncError> {
        match self.execute(record).await {
            Ok(skipped) => {
                self.persist(record)?;
                self.enforce_retention(record.schedule_id.as_deref()).await;
                self.events.emit(Event::BackupCompleted {
                    record_id: record.id.clone(),
                    bytes: record.bytes,
                    skipped,
                });
                tracing::info!(
                    record_id = %record.id,
                    bytes = record.bytes,
                    skipped,
                    "backup completed"
                );
                Ok(record.clone())
            }
            Err(err) => {
                let decision = record.register_failure(&self.config.retry, Utc::now(), &err);
                self.persist(record)?;
                match decision {
                    RetryDecision::Scheduled(at) => {
                        tracing::warn!(record_id = %record.id, %err, retry_at = %at, "backup failed, retry scheduled");
                        self.events.emit(Event::BackupRetryScheduled {
                            record_id: record.id.clone(),
                            at,
                        });
                    }
                    RetryDecision::Exhausted => {
                        tracing::error!(record_id = %record.id, %err, "backup failed terminally");
                        self.events.emit(Event::BackupFailed {
                            record_id: record.id.clone(),
                            error: err.to_string(),
                        });
                    }
                }
                Err(err)
            }
        }
    }

    /// Steps 2–7. Returns whether the upload was skipped as unchanged.
    async fn execute(&self, record: &mut BackupRecord) -> Result<bool, SyncError> {
        let snapshot = self.provider.export().await?;
        let (links, folders) = snapshot.counts();

        let previous = self.state.latest_completed_backup().map_err(internal)?;

        // Idempotence law: an unchanged tree re-uses the previous blob
        // and uploads nothing.
        if let Some(prev) = &previous {
            if prev.root_hash.as_deref() == Some(snapshot.root_hash.as_str()) {
                record.mark_completed(
                    Utc::now(),
                    prev.blob_id.clone(),
                    0,
                    links as u32,
                    folders as u32,
                    snapshot.root_hash.clone(),
                );
                tracing::debug!(root_hash = %snapshot.root_hash, "tree unchanged, skipping upload");
                return Ok(true);
            }
        }

        // Encode: incremental when we have the previous snapshot cached,
        // full otherwise.
        let base = if self.config.incremental {
            previous
                .as_ref()
                .and_then(|prev| self.state.last_snapshot().ok().flatten().map(|s| (prev, s)))
                .filter(|(prev, cached)| prev.root_hash.as_deref() == Some(cached.root_hash.as_str()))
        } else {
            None
        };
        let payload = match &base {
            Some((prev, cached)) => {
                let delta = delta::diff(cached, &snapshot);
                record.base_backup_id = Some(prev.id.clone());
                serde_json::to_vec(&IncrementalBlob::from_delta(delta)).map_err(encode_error)?
            }
            None => serde_json::to_vec(&snapshot).map_err(encode_error)?,
        };

        let payload = match &self.crypto {
            Some(engine) => serde_json::to_vec(&engine.encrypt(&payload)?).map_err(encode_error)?,
            None => payload,
        };

        let folder_id = self
            .store
            .find_or_create_folder(&self.config.folder_name, None)
            .await?;

        // Deterministic filename from the record's creation time, so a
        // retry targets the same name and can re-use a blob that already
        // made it up before the failure.
        let filename = format!(
            "bookmarks_{}.json",
            record.created_at.format("%Y-%m-%dT%H-%M-%SZ")
        );
        let existing = self.store.list(&folder_id, Some(&filename), None).await?;
        let handle = match existing
            .iter()
            .find(|meta| meta.size == payload.len() as u64)
        {
            Some(meta) => {
                tracing::debug!(blob_id = %meta.id, "target filename already uploaded, re-using");
                BlobHandle {
                    id: meta.id.clone(),
                    size: meta.size,
                }
            }
            None => self.store.upload(&filename, &payload, &folder_id).await?,
        };

        record.mark_completed(
            Utc::now(),
            Some(handle.id),
            handle.size,
            links as u32,
            folders as u32,
            snapshot.root_hash.clone(),
        );
        self.state.save_last_snapshot(&snapshot).map_err(internal)?;
        Ok(false)
    }

    fn persist(&self, record: &BackupRecord) -> Result<(), SyncError> {
        self.state.save_backup(record).map_err(internal)
    }

    /// Step 8: keep the newest `retention` completed records for the
    /// schedule; delete the rest, blobs included, unless another record
    /// still references the same blob. Manual backups (no schedule id)
    /// keep everything.
    async fn enforce_retention(&self, schedule_id: Option<&str>) {
        let Some(schedule_id) = schedule_id else {
            return;
        };
        let retention = match self.state.schedule() {
            Ok(Some(schedule)) if schedule.id == schedule_id => schedule.retention,
            _ => RETENTION_UNLIMITED,
        };
        if retention == RETENTION_UNLIMITED {
            return;
        }

        let all = match self.state.backups() {
            Ok(all) => all,
            Err(e) => {
                tracing::warn!("retention: failed to list records: {e}");
                return;
            }
        };
        let mut completed: Vec<&BackupRecord> = all
            .iter()
            .filter(|r| r.status == BackupStatus::Completed)
            .filter(|r| r.schedule_id.as_deref() == Some(schedule_id))
            .collect();
        completed.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));

        let doomed: Vec<&BackupRecord> = completed.split_off(retention.max(0) as usize);
        if doomed.is_empty() {
            return;
        }
        let doomed_ids: HashSet<&str> = doomed.iter().map(|r| r.id.as_str()).collect();
        let kept_blobs: HashSet<&str> = all
            .iter()
            .filter(|r| !doomed_ids.contains(r.id.as_str()))
            .filter_map(|r| r.blob_id.as_deref())
            .collect();

        for record in doomed {
            if let Some(blob_id) = &record.blob_id {
                if !kept_blobs.contains(blob_id.as_str()) {
                    if let Err(e) = self.store.delete(blob_id).await {
                        tracing::warn!(blob_id = %blob_id, "retention: blob delete failed: {e}");
                    }
                }
            }
            if let Err(e) = self.state.delete_backup(&record.id) {
                tracing::warn!(record_id = %record.id, "retention: record delete failed: {e}");
            } else {
                tracing::debug!(record_id = %record.id, "retention: pruned old backup");
            }
        }
    }

    /// Housekeeping for the CLI: drop terminally failed records and
    /// re-run retention for the active schedule. Returns how many
    /// records were removed.
    pub async fn cleanup(&self) -> Result<usize, SyncError> {
        let failed = self
            .state
            .backups_with_status(BackupStatus::Failed)
            .map_err(internal)?;
        let removed = failed.len();
        for record in failed {
            self.state.delete_backup(&record.id).map_err(internal)?;
            tracing::debug!(record_id = %record.id, "cleanup: dropped failed record");
        }

        let before = self.state.backups().map_err(internal)?.len();
        if let Ok(Some(schedule)) = self.state.schedule() {
            self.enforce_retention(Some(&schedule.id)).await;
        }
        let after = self.state.backups().map_err(internal)?.len();
        Ok(removed + before.saturating_sub(after))
    }

    // ── Restore ─────────────────────────────────────────────────────

    /// Replace the live tree with the state captured by a backup.
    ///
    /// The restored tree is installed wholesale (protected roots are
    /// never deleted); `dedup` additionally drops links whose URL
    /// already appeared earlier in the restored tree.
    pub async fn restore(&self, record_id: &str, dedup: bool) -> Result<ApplyReport, SyncError> {
        let reconstructed = self.reconstruct_snapshot(record_id).await?;
        let mut tree = reconstructed.tree;
        if dedup {
            dedup_links(&mut tree);
        }
        let target = delta::snapshot(tree, &reconstructed.device_id);

        let current = self.provider.export().await?;
        let mut plan = delta::diff(&current, &target);
        plan.deleted
            .retain(|id| !PROTECTED_IDS.contains(&id.as_str()));

        let applied = self.provider.apply(&plan).await?;
        self.events.emit(Event::RestoreCompleted {
            record_id: record_id.to_string(),
            applied,
        });
        tracing::info!(record_id, ?applied, "restore completed");
        Ok(applied)
    }

    /// Rebuild the snapshot a record captured, replaying the incremental
    /// chain back to the nearest full blob.
    async fn reconstruct_snapshot(&self, record_id: &str) -> Result<TreeSnapshot, SyncError> {
        let mut chain: Vec<Delta> = Vec::new();
        let mut cursor = record_id.to_string();

        loop {
            if chain.len() > MAX_CHAIN_LENGTH {
                return Err(SyncError::Fatal(
                    "incremental chain exceeds the sane maximum".into(),
                ));
            }
            let record = self
                .state
                .backup(&cursor)
                .map_err(internal)?
                .ok_or_else(|| SyncError::Fatal(format!("no backup record {cursor:?}")))?;
            let blob_id = record
                .blob_id
                .ok_or_else(|| SyncError::Fatal(format!("record {cursor:?} has no blob")))?;

            let bytes = self.store.download(&blob_id).await?;
            let value = open_blob(&bytes, self.crypto.as_ref())?;

            if value.get("type").and_then(|v| v.as_str()) == Some(delta::INCREMENTAL_KIND) {
                let blob: IncrementalBlob = serde_json::from_value(value)
                    .map_err(|e| SyncError::Fatal(format!("malformed incremental blob: {e}")))?;
                chain.push(blob.into_delta()?);
                cursor = record.base_backup_id.ok_or_else(|| {
                    SyncError::Fatal(format!("incremental record {:?} has no base", record.id))
                })?;
                continue;
            }

            let full: TreeSnapshot = serde_json::from_value(value)
                .map_err(|e| SyncError::Fatal(format!("malformed snapshot blob: {e}")))?;
            let mut tree = full.tree;
            for delta in chain.iter().rev() {
                let (next, _) = delta::apply(&tree, delta)?;
                tree = next;
            }
            return Ok(delta::snapshot(tree, &full.device_id));
        }
    }
}

/// Drop links whose URL already appeared earlier in depth-first order.
/// Folders are never deduplicated.
fn dedup_links(tree: &mut BookmarkNode) {
    let mut seen: HashSet<String> = HashSet::new();
    fn inner(node: &mut BookmarkNode, seen: &mut HashSet<String>) {
        if let Some(children) = node.children_mut() {
            children.retain(|child| match child.url() {
                Some(url) => seen.insert(url.to_string()),
                None => true,
            });
            for child in children {
                inner(child, seen);
            }
        }
    }
    inner(tree, &mut seen);
}

fn internal(err: anyhow::Error) -> SyncError {
    SyncError::Fatal(format!("state store: {err}"))
}

fn encode_error(err: serde_json::Error) -> SyncError {
    SyncError::Fatal(format!("payload encoding: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bookmarks::LocalProvider;
    use crate::storage::{MemoryStore, StoreError};

    struct Harness {
        provider: Arc<LocalProvider>,
        store: Arc<MemoryStore>,
        state: Arc<StateStore>,
        engine: BackupEngine,
    }

    fn harness(crypto: Option<CryptoEngine>) -> Harness {
        let provider = Arc::new(LocalProvider::new("device-1"));
        let store = Arc::new(MemoryStore::new());
        let state = Arc::new(StateStore::open_in_memory().unwrap());
        let engine = BackupEngine::new(
            provider.clone(),
            store.clone(),
            state.clone(),
            crypto,
            BackupConfig::default(),
            EventBus::new(),
        );
        Harness {
            provider,
            store,
            state,
            engine,
        }
    }

    #[tokio::test]
    async fn first_backup_uploads_a_full_snapshot() {
        let h = harness(None);
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();

        let record = h.engine.run(BackupKind::Manual, None).await.unwrap();
        assert_eq!(record.status, BackupStatus::Completed);
        assert!(record.bytes > 0);
        assert_eq!(record.bookmark_count, 1);
        assert_eq!(record.folder_count, 3);

        let bytes = h.store.bytes_of(record.blob_id.as_ref().unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert!(value.get("tree").is_some());
        assert_eq!(value["hash"], record.root_hash.clone().unwrap());
    }

    #[tokio::test]
    async fn unchanged_tree_skips_upload_and_reuses_blob() {
        let h = harness(None);
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();

        let first = h.engine.run(BackupKind::Manual, None).await.unwrap();
        let second = h.engine.run(BackupKind::Manual, None).await.unwrap();

        assert_eq!(second.bytes, 0);
        assert_eq!(second.blob_id, first.blob_id);
        assert_eq!(h.store.blob_count(), 1);
        assert_eq!(h.state.backups().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn second_backup_is_an_incremental_delta() {
        let h = harness(None);
        h.provider.add_link_with_id("1-a", "1", "A", "https://a").unwrap();
        let first = h.engine.run(BackupKind::Scheduled, Some("s1")).await.unwrap();

        h.provider.add_link_with_id("2-b", "1", "B", "https://b").unwrap();
        let second = h.engine.run(BackupKind::Scheduled, Some("s1")).await.unwrap();

        assert_eq!(second.base_backup_id.as_ref(), Some(&first.id));

        let bytes = h.store.bytes_of(second.blob_id.as_ref().unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["type"], "incremental");
        assert_eq!(value["base_root_hash"], first.root_hash.clone().unwrap());
        let added = value["delta"]["added"].as_array().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0]["id"], "2-b");
    }

    #[tokio::test]
    async fn transient_upload_failure_schedules_a_retry() {
        let h = harness(None);
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();
        h.store.push_upload_fault(StoreError::Transient("boom".into()));

        let err = h.engine.run(BackupKind::Scheduled, Some("s1")).await.unwrap_err();
        assert!(matches!(err, SyncError::Transient { .. }));

        let records = h.state.backups().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::RetryPending);
        assert_eq!(records[0].attempt, 1);
        assert!(records[0].next_retry_at.is_some());
    }

    #[tokio::test]
    async fn retry_ladder_completes_after_three_transient_failures() {
        let h = harness(None);
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();
        for _ in 0..3 {
            h.store.push_upload_fault(StoreError::Transient("boom".into()));
        }

        let err = h.engine.run(BackupKind::Scheduled, Some("s1")).await.unwrap_err();
        assert!(matches!(err, SyncError::Transient { .. }));
        let id = h.state.backups().unwrap()[0].id.clone();

        // Two more failing retries, then the fourth attempt succeeds.
        assert!(h.engine.retry(&id).await.is_err());
        assert!(h.engine.retry(&id).await.is_err());
        let record = h.engine.retry(&id).await.unwrap();

        assert_eq!(record.status, BackupStatus::Completed);
        assert_eq!(record.attempt, 3);
        assert_eq!(record.retry_count, 3);
        assert_eq!(h.store.blob_count(), 1);
    }

    #[tokio::test]
    async fn fatal_store_failure_is_terminal() {
        let h = harness(None);
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();
        h.store.push_upload_fault(StoreError::Fatal("disk on fire".into()));

        let err = h.engine.run(BackupKind::Manual, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Fatal(_)));
        assert_eq!(
            h.state.backups().unwrap()[0].status,
            BackupStatus::Failed
        );
    }

    #[tokio::test]
    async fn encrypted_backup_uploads_an_envelope() {
        let crypto = CryptoEngine::with_iterations("Correct-Horse-1", 1_000);
        let h = harness(Some(crypto));
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();

        let record = h.engine.run(BackupKind::Manual, None).await.unwrap();
        let bytes = h.store.bytes_of(record.blob_id.as_ref().unwrap()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["alg"], "AES-GCM-256");
        assert!(value.get("tree").is_none());
    }

    #[tokio::test]
    async fn retention_keeps_the_newest_completed_records() {
        let h = harness(None);
        let now = Utc::now();
        let mut schedule = crate::schedule::Schedule::new(
            "s1",
            crate::schedule::Frequency::Daily,
            2,
            0,
            now,
        )
        .unwrap();
        schedule.retention = 2;
        h.state.save_schedule(&schedule).unwrap();

        // Four backups of four distinct trees.
        for i in 0..4 {
            h.provider
                .add_link_with_id(&format!("n{i}"), "1", &format!("T{i}"), &format!("https://{i}"))
                .unwrap();
            h.engine.run(BackupKind::Scheduled, Some("s1")).await.unwrap();
        }

        let completed = h
            .state
            .backups_with_status(BackupStatus::Completed)
            .unwrap();
        assert_eq!(completed.len(), 2);
        // Newest survive: the last two hold 3 and 4 bookmarks.
        let mut counts: Vec<u32> = completed.iter().map(|r| r.bookmark_count).collect();
        counts.sort_unstable();
        assert_eq!(counts, vec![3, 4]);
    }

    #[tokio::test]
    async fn cleanup_drops_failed_records() {
        let h = harness(None);
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();
        h.store.push_upload_fault(StoreError::Fatal("broken".into()));
        let _ = h.engine.run(BackupKind::Manual, None).await;
        assert_eq!(
            h.state.backups_with_status(BackupStatus::Failed).unwrap().len(),
            1
        );

        let removed = h.engine.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        assert!(h.state.backups().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_replays_an_incremental_chain() {
        let h = harness(None);
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();
        h.engine.run(BackupKind::Manual, None).await.unwrap();

        h.provider.add_link_with_id("11", "1", "B", "https://b").unwrap();
        let second = h.engine.run(BackupKind::Manual, None).await.unwrap();

        // Later edits that the restore must roll back.
        h.provider.remove("10").unwrap();
        h.provider.add_link_with_id("12", "2", "C", "https://c").unwrap();

        h.engine.restore(&second.id, false).await.unwrap();
        let tree = h.provider.tree();
        assert!(tree.find("10").is_some());
        assert!(tree.find("11").is_some());
        assert!(tree.find("12").is_none());
        assert_eq!(
            delta::tree_hash(&tree),
            second.root_hash.clone().unwrap()
        );
    }

    #[tokio::test]
    async fn restore_with_dedup_drops_duplicate_urls() {
        let h = harness(None);
        h.provider.add_link_with_id("10", "1", "A", "https://same").unwrap();
        h.provider.add_link_with_id("11", "2", "B", "https://same").unwrap();
        let record = h.engine.run(BackupKind::Manual, None).await.unwrap();

        // Plain restore keeps both duplicates.
        h.engine.restore(&record.id, false).await.unwrap();
        let (links, _) = h.provider.tree().counts();
        assert_eq!(links, 2);

        // Dedup restore keeps the first in depth-first order.
        h.engine.restore(&record.id, true).await.unwrap();
        let tree = h.provider.tree();
        let (links, _) = tree.counts();
        assert_eq!(links, 1);
        assert!(tree.find("10").is_some());
        assert!(tree.find("11").is_none());
    }

    #[tokio::test]
    async fn tampered_encrypted_blob_fails_restore_without_mutation() {
        let crypto = CryptoEngine::with_iterations("Correct-Horse-1", 1_000);
        let h = harness(Some(crypto));
        h.provider.add_link_with_id("10", "1", "A", "https://a").unwrap();
        let record = h.engine.run(BackupKind::Manual, None).await.unwrap();
        let before = h.provider.tree();

        // Corrupt one ciphertext byte inside the stored envelope.
        let blob_id = record.blob_id.clone().unwrap();
        let bytes = h.store.bytes_of(&blob_id).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let ct = envelope["ct"].as_str().unwrap().to_string();
        let mut chars: Vec<char> = ct.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        envelope["ct"] = serde_json::Value::String(chars.into_iter().collect());
        h.store.delete(&blob_id).await.unwrap();
        let folder = h.store.find_or_create_folder("bookvault", None).await.unwrap();
        let handle = h
            .store
            .upload("tampered.json", &serde_json::to_vec(&envelope).unwrap(), &folder)
            .await
            .unwrap();
        let mut tampered = record.clone();
        tampered.blob_id = Some(handle.id);
        h.state.save_backup(&tampered).unwrap();

        let err = h.engine.restore(&record.id, false).await.unwrap_err();
        assert!(matches!(err, SyncError::Crypto(_)));
        assert_eq!(h.provider.tree(), before);
    }
}
