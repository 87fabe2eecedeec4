//! Content-addressed delta engine for bookmark trees.
//!
//! Diffing indexes both trees by id and walks the union: equal field
//! tuples `(title, url, parent_id, modified_at)` are unchanged, unequal
//! tuples become modifications, one-sided ids become additions or
//! deletions. The resulting [`Delta`] is the artifact of incremental
//! backup and is smaller than the full tree by construction.
//!
//! Application order is fixed: deletions, then modifications, then
//! additions (whose parents must already exist or arrive in the same
//! batch). A parent that cannot be located is a fatal
//! `InconsistentDelta`.

pub mod hash;

pub use hash::{node_hash, tree_hash};

use crate::bookmarks::{BookmarkNode, FlatNode, TreeSnapshot, ROOT_ID};
use crate::error::SyncError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Capture a snapshot of a tree, computing its root hash.
pub fn snapshot(tree: BookmarkNode, device_id: &str) -> TreeSnapshot {
    let root_hash = tree_hash(&tree);
    TreeSnapshot {
        tree,
        root_hash,
        timestamp: Utc::now(),
        device_id: device_id.to_string(),
    }
}

/// Field-level changes for one modified node. `None` means unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// New parent id when the node moved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

impl FieldChanges {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.url.is_none()
            && self.parent_id.is_none()
            && self.modified_at.is_none()
    }
}

/// One modified node within a delta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeChange {
    pub id: String,
    pub changes: FieldChanges,
}

/// The minimal set of operations turning the tree with `base_root_hash`
/// into the tree with `new_root_hash`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub base_root_hash: String,
    pub new_root_hash: String,
    /// New nodes, parents before children.
    pub added: Vec<FlatNode>,
    pub modified: Vec<NodeChange>,
    /// Removed ids, children before parents.
    pub deleted: Vec<String>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Total operation count.
    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.deleted.len()
    }
}

/// Counts of operations actually applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
}

/// Compute the delta turning `previous` into `current`.
pub fn diff(previous: &TreeSnapshot, current: &TreeSnapshot) -> Delta {
    let prev = previous.tree.flatten();
    let curr = current.tree.flatten();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    let mut deleted = Vec::new();

    // Walk the current tree depth-first so additions come out parents
    // before children.
    current.tree.walk(&mut |node, _| {
        let id = node.id();
        match prev.get(id) {
            None => added.push(curr[id].clone()),
            Some(before) => {
                let after = &curr[id];
                let changes = field_changes(before, after);
                if !changes.is_empty() {
                    modified.push(NodeChange {
                        id: id.to_string(),
                        changes,
                    });
                }
            }
        }
    });

    // Walk the previous tree in post-order so deletions come out children
    // before parents.
    fn post_order(node: &BookmarkNode, curr: &HashMap<String, FlatNode>, out: &mut Vec<String>) {
        for child in node.children() {
            post_order(child, curr, out);
        }
        if !curr.contains_key(node.id()) {
            out.push(node.id().to_string());
        }
    }
    post_order(&previous.tree, &curr, &mut deleted);

    Delta {
        base_root_hash: previous.root_hash.clone(),
        new_root_hash: current.root_hash.clone(),
        added,
        modified,
        deleted,
    }
}

fn field_changes(before: &FlatNode, after: &FlatNode) -> FieldChanges {
    let mut changes = FieldChanges::default();
    if before.title != after.title {
        changes.title = Some(after.title.clone());
    }
    if before.url != after.url {
        changes.url = after.url.clone();
    }
    if before.parent_id != after.parent_id {
        changes.parent_id = after.parent_id.clone();
    }
    if before.modified_at != after.modified_at {
        changes.modified_at = after.modified_at;
    }
    changes
}

/// Apply a delta to a tree, returning the new tree and what was applied.
///
/// Deletions of already-absent ids are skipped (retries stay idempotent);
/// a modification of an unknown id or an addition under an unknown parent
/// is an `InconsistentDelta`.
pub fn apply(tree: &BookmarkNode, delta: &Delta) -> Result<(BookmarkNode, ApplyReport), SyncError> {
    let mut nodes = tree.flatten();
    let mut report = ApplyReport::default();

    for id in &delta.deleted {
        if nodes.remove(id).is_some() {
            report.deleted += 1;
        }
    }
    // Drop descendants of deleted folders that the delta did not list
    // individually.
    prune_orphans(&mut nodes);

    for change in &delta.modified {
        let node = nodes.get_mut(&change.id).ok_or_else(|| {
            SyncError::InconsistentDelta(format!("modified node {:?} not found", change.id))
        })?;
        if let Some(title) = &change.changes.title {
            node.title = title.clone();
        }
        if let Some(url) = &change.changes.url {
            node.url = Some(url.clone());
        }
        if let Some(parent) = &change.changes.parent_id {
            node.parent_id = Some(parent.clone());
        }
        if let Some(ts) = change.changes.modified_at {
            node.modified_at = Some(ts);
        }
        report.modified += 1;
    }

    for node in &delta.added {
        match &node.parent_id {
            Some(parent) if !nodes.contains_key(parent) => {
                // Parents may arrive in the same batch, and the batch is
                // ordered parents-first, so an unknown parent here is fatal.
                return Err(SyncError::InconsistentDelta(format!(
                    "added node {:?} references missing parent {parent:?}",
                    node.id
                )));
            }
            None if node.id != ROOT_ID => {
                return Err(SyncError::InconsistentDelta(format!(
                    "added non-root node {:?} has no parent",
                    node.id
                )));
            }
            _ => {}
        }
        nodes.insert(node.id.clone(), node.clone());
        report.added += 1;
    }

    let rebuilt = rebuild(nodes)?;
    Ok((rebuilt, report))
}

/// Remove nodes whose ancestor chain no longer reaches the root.
fn prune_orphans(nodes: &mut HashMap<String, FlatNode>) {
    loop {
        let orphans: Vec<String> = nodes
            .values()
            .filter(|n| match &n.parent_id {
                Some(parent) => !nodes.contains_key(parent),
                None => n.id != ROOT_ID,
            })
            .map(|n| n.id.clone())
            .collect();
        if orphans.is_empty() {
            return;
        }
        for id in orphans {
            nodes.remove(&id);
        }
    }
}

/// Rebuild the owned tree from flat records. Nodes unreachable from the
/// root (broken parent chains, parent cycles) are an `InconsistentDelta`.
fn rebuild(nodes: HashMap<String, FlatNode>) -> Result<BookmarkNode, SyncError> {
    let mut by_parent: HashMap<String, Vec<&FlatNode>> = HashMap::new();
    let mut root = None;
    for node in nodes.values() {
        match &node.parent_id {
            Some(parent) => by_parent.entry(parent.clone()).or_default().push(node),
            None => root = Some(node),
        }
    }
    for children in by_parent.values_mut() {
        children.sort_by(|a, b| a.index.cmp(&b.index).then_with(|| a.id.cmp(&b.id)));
    }

    let root = root.ok_or_else(|| SyncError::InconsistentDelta("tree has no root".into()))?;

    let mut reached = 0usize;
    let built = build_node(root, &by_parent, &mut reached);
    if reached != nodes.len() {
        return Err(SyncError::InconsistentDelta(format!(
            "{} node(s) unreachable from the root",
            nodes.len() - reached
        )));
    }
    Ok(built)
}

fn build_node(
    flat: &FlatNode,
    by_parent: &HashMap<String, Vec<&FlatNode>>,
    reached: &mut usize,
) -> BookmarkNode {
    *reached += 1;
    match &flat.url {
        Some(url) => BookmarkNode::Link {
            id: flat.id.clone(),
            title: flat.title.clone(),
            url: url.clone(),
            modified_at: flat.modified_at,
        },
        None => {
            let children = by_parent
                .get(&flat.id)
                .map(|kids| {
                    kids.iter()
                        .map(|k| build_node(k, by_parent, reached))
                        .collect()
                })
                .unwrap_or_default();
            BookmarkNode::Folder {
                id: flat.id.clone(),
                title: flat.title.clone(),
                modified_at: flat.modified_at,
                children,
            }
        }
    }
}

// ── Incremental blob format ──────────────────────────────────────

/// On-the-wire shape of an incremental backup:
/// `{ "type": "incremental", "base_root_hash", "new_root_hash", "delta" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncrementalBlob {
    #[serde(rename = "type")]
    pub kind: String,
    pub base_root_hash: String,
    pub new_root_hash: String,
    pub delta: DeltaOps,
}

/// The operation lists inside an incremental blob.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaOps {
    pub added: Vec<FlatNode>,
    pub modified: Vec<NodeChange>,
    pub deleted: Vec<String>,
}

pub const INCREMENTAL_KIND: &str = "incremental";

impl IncrementalBlob {
    pub fn from_delta(delta: Delta) -> Self {
        Self {
            kind: INCREMENTAL_KIND.into(),
            base_root_hash: delta.base_root_hash,
            new_root_hash: delta.new_root_hash,
            delta: DeltaOps {
                added: delta.added,
                modified: delta.modified,
                deleted: delta.deleted,
            },
        }
    }

    pub fn into_delta(self) -> Result<Delta, SyncError> {
        if self.kind != INCREMENTAL_KIND {
            return Err(SyncError::Fatal(format!(
                "unexpected blob type {:?}",
                self.kind
            )));
        }
        Ok(Delta {
            base_root_hash: self.base_root_hash,
            new_root_hash: self.new_root_hash,
            added: self.delta.added,
            modified: self.delta.modified,
            deleted: self.delta.deleted,
        })
    }
}
