//! The sync transaction.
//!
//! One `run()` reconciles the local tree with the remote snapshot blob:
//! fetch and decode the remote (bootstrap-upload when absent), return
//! early on equal root hashes, detect and resolve conflicts, apply the
//! resolved delta locally, then write the merged snapshot back — but
//! only when the configured mode lets this device write. `HostToMany`
//! peers read identically to `Global` devices and simply never publish.
//!
//! Divergence is judged against the *common base*: the remote state as
//! of this device's last completed sync, cached locally. The base is
//! what distinguishes "the other side deleted this node" (delete it
//! here too) from "this side added it" (keep it and publish). Without a
//! base — the first contact between two populated trees — nothing is
//! deleted and the trees union-merge.
//!
//! With the `manual` strategy the conflict list is returned as data; the
//! caller resolves and re-enters through [`SyncEngine::run_with_plan`].

use crate::bookmarks::{BookmarkProvider, TreeSnapshot, PROTECTED_IDS};
use crate::conflict::{self, Conflict, ResolutionPlan, Strategy};
use crate::crypto::{open_blob, CryptoEngine};
use crate::delta::{self, ApplyReport, Delta};
use crate::error::SyncError;
use crate::events::{Event, EventBus};
use crate::state::StateStore;
use crate::storage::BlobStore;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;

/// Well-known name of the shared snapshot blob.
pub const SYNC_BLOB_NAME: &str = "bookmarks_sync.json";

/// Write topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// One designated host writes; peers only read.
    HostToMany,
    /// Every device reads and writes, conflicts resolved on the way in.
    Global,
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mode: SyncMode,
    /// Whether this device is the designated host (`HostToMany` only).
    pub is_host: bool,
    pub strategy: Strategy,
    /// Remote folder the sync blob lives in.
    pub folder_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: SyncMode::Global,
            is_host: false,
            strategy: Strategy::PreferNewest,
            folder_name: "bookvault".into(),
        }
    }
}

/// What a sync transaction did.
#[derive(Debug, Clone)]
pub enum SyncOutcome {
    /// No remote snapshot existed; the local tree was published.
    Bootstrapped,
    /// Root hashes matched; nothing to do.
    UpToDate,
    /// The resolved delta was applied locally.
    Applied {
        report: ApplyReport,
        wrote_remote: bool,
    },
    /// Manual strategy: conflicts await an external plan.
    ConflictsPending(Vec<Conflict>),
}

/// Drives sync transactions.
pub struct SyncEngine {
    provider: Arc<dyn BookmarkProvider>,
    store: Arc<dyn BlobStore>,
    state: Arc<StateStore>,
    crypto: Option<CryptoEngine>,
    config: SyncConfig,
    events: EventBus,
}

impl SyncEngine {
    pub fn new(
        provider: Arc<dyn BookmarkProvider>,
        store: Arc<dyn BlobStore>,
        state: Arc<StateStore>,
        crypto: Option<CryptoEngine>,
        config: SyncConfig,
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

    fn can_write(&self) -> bool {
        match self.config.mode {
            SyncMode::Global => true,
            SyncMode::HostToMany => self.config.is_host,
        }
    }

    /// Run a sync transaction with the configured strategy.
    pub async fn run(&self) -> Result<SyncOutcome, SyncError> {
        self.run_with_plan(None).await
    }

    /// Run a sync transaction, resolving conflicts with the supplied
    /// plan instead of the configured strategy.
    pub async fn run_with_plan(
        &self,
        plan: Option<ResolutionPlan>,
    ) -> Result<SyncOutcome, SyncError> {
        let local = self.provider.export().await?;
        let folder_id = self
            .store
            .find_or_create_folder(&self.config.folder_name, None)
            .await?;

        let listing = self
            .store
            .list(&folder_id, Some(SYNC_BLOB_NAME), None)
            .await?;
        let Some(remote_meta) = listing.first() else {
            if !self.can_write() {
                tracing::debug!("no remote snapshot and this device cannot publish");
                return Ok(SyncOutcome::UpToDate);
            }
            self.publish(&local, &folder_id, None).await?;
            self.save_base(&local);
            tracing::info!(root_hash = %local.root_hash, "published first remote snapshot");
            return Ok(SyncOutcome::Bootstrapped);
        };

        let bytes = self.store.download(&remote_meta.id).await?;
        let remote: TreeSnapshot =
            serde_json::from_value(open_blob(&bytes, self.crypto.as_ref())?)
                .map_err(|e| SyncError::Fatal(format!("malformed remote snapshot: {e}")))?;

        if local.root_hash == remote.root_hash {
            tracing::debug!(root_hash = %local.root_hash, "trees already equal");
            self.save_base(&remote);
            return Ok(SyncOutcome::UpToDate);
        }

        let conflicts = conflict::detect(&local, &remote);
        let plan = match plan {
            Some(plan) => plan,
            None => match conflict::resolve(&conflicts, self.config.strategy) {
                Some(plan) => plan,
                None if conflicts.is_empty() => ResolutionPlan::default(),
                None => {
                    tracing::info!(count = conflicts.len(), "conflicts await manual resolution");
                    self.events.emit(Event::SyncConflictsPending {
                        count: conflicts.len(),
                    });
                    return Ok(SyncOutcome::ConflictsPending(conflicts));
                }
            },
        };

        let base = self.state.sync_base().unwrap_or_else(|e| {
            tracing::warn!("sync base unreadable, treating as first contact: {e}");
            None
        });
        let mut resolved = plan.rewrite(delta::diff(&local, &remote));
        reclassify_one_sided(&mut resolved, &local, base.as_ref());
        resolved
            .deleted
            .retain(|id| !PROTECTED_IDS.contains(&id.as_str()));

        let report = if resolved.is_empty() {
            ApplyReport::default()
        } else {
            self.provider.apply(&resolved).await?
        };

        // Publish the merged tree when this device may write and the
        // merge actually diverged from what the remote already holds.
        let merged = self.provider.export().await?;
        let wrote_remote = if self.can_write() && merged.root_hash != remote.root_hash {
            self.publish(&merged, &folder_id, Some(&remote_meta.id))
                .await?;
            true
        } else {
            false
        };

        // The next sync's base is whatever the remote holds now: the
        // merged tree if we wrote it, the fetched snapshot otherwise.
        self.save_base(if wrote_remote { &merged } else { &remote });

        tracing::info!(applied = ?report, wrote_remote, "sync completed");
        self.events.emit(Event::SyncCompleted { applied: report });
        Ok(SyncOutcome::Applied {
            report,
            wrote_remote,
        })
    }

    fn save_base(&self, snapshot: &TreeSnapshot) {
        if let Err(e) = self.state.save_sync_base(snapshot) {
            tracing::warn!("failed to persist sync base: {e}");
        }
    }

    /// Encode (and optionally encrypt) a snapshot and replace the remote
    /// sync blob with it.
    async fn publish(
        &self,
        snapshot: &TreeSnapshot,
        folder_id: &str,
        replace: Option<&str>,
    ) -> Result<(), SyncError> {
        let payload = serde_json::to_vec(snapshot)
            .map_err(|e| SyncError::Fatal(format!("snapshot encoding: {e}")))?;
        let payload = match &self.crypto {
            Some(engine) => serde_json::to_vec(&engine.encrypt(&payload)?)
                .map_err(|e| SyncError::Fatal(format!("envelope encoding: {e}")))?,
            None => payload,
        };
        if let Some(old_id) = replace {
            if let Err(e) = self.store.delete(old_id).await {
                tracing::warn!(blob_id = %old_id, "stale sync blob delete failed: {e}");
            }
        }
        self.store
            .upload(SYNC_BLOB_NAME, &payload, folder_id)
            .await?;
        Ok(())
    }
}

/// Correct the one-sided classifications of a plain local→remote diff
/// using the common base.
///
/// An id only the local side has is a *remote deletion* when the base
/// knew it, and a *local addition* (kept, published later) when it did
/// not. An id only the remote side has is a *remote addition* when the
/// base lacks it, and a *local deletion* (not re-added) when the base
/// carried it. Without a base nothing is deleted and re-adds stand.
fn reclassify_one_sided(delta: &mut Delta, local: &TreeSnapshot, base: Option<&TreeSnapshot>) {
    let Some(base) = base else {
        delta.deleted.clear();
        return;
    };
    let base_ids = base.tree.flatten();

    delta.deleted.retain(|id| base_ids.contains_key(id));
    delta.added.retain(|node| !base_ids.contains_key(&node.id));

    // Dropping a re-add can orphan remote additions nested under it;
    // cascade until every kept addition has a live parent.
    let local_ids = local.tree.flatten();
    let doomed: HashSet<&str> = delta.deleted.iter().map(String::as_str).collect();
    loop {
        let kept: HashSet<String> = delta.added.iter().map(|n| n.id.clone()).collect();
        let before = delta.added.len();
        delta.added.retain(|node| match &node.parent_id {
            None => true,
            Some(parent) => {
                (local_ids.contains_key(parent) && !doomed.contains(parent.as_str()))
                    || kept.contains(parent)
            }
        });
        if delta.added.len() == before {
            break;
        }
    }
}
