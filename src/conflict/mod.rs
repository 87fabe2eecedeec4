//! Divergence detection and resolution between a local and a remote tree.
//!
//! Only ids present on both sides can conflict; one-sided presence is an
//! addition or a deletion and is handled by the delta engine. For each
//! shared id the field tuple `title`, `url`, `parent` is compared and the
//! per-field `{local, remote}` pair reported.
//!
//! Strategies are enumerated: `preferNewest` needs node timestamps and
//! falls back to `preferRemote` when either side lacks them (equal
//! timestamps also pick remote, keeping resolution deterministic across
//! devices). `manual` produces no plan — the conflict list is returned to
//! the caller as data, never as an error.

use crate::bookmarks::TreeSnapshot;
use crate::delta::{Delta, FieldChanges};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How divergent edits are reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Newest `modified_at` wins; remote wins ties and missing timestamps.
    PreferNewest,
    /// The local edit always wins.
    PreferLocal,
    /// The remote edit always wins.
    PreferRemote,
    /// Emit the conflict list and wait for an external plan.
    Manual,
}

/// A `{local, remote}` value pair for one conflicting field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub local: String,
    pub remote: String,
}

/// Divergent edits on a single node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<FieldDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<FieldDiff>,
    /// Parent/position divergence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<FieldDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_modified_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_modified_at: Option<DateTime<Utc>>,
}

/// Per-node resolution choice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "choice", rename_all = "snake_case")]
pub enum Resolution {
    TakeLocal,
    TakeRemote,
    /// Keep the remote edit but override individual fields.
    Merge { field_overrides: FieldChanges },
}

/// A full resolution: one choice per conflicted node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolutionPlan {
    pub choices: HashMap<String, Resolution>,
}

impl ResolutionPlan {
    /// Rewrite a local→remote delta according to this plan.
    ///
    /// `TakeRemote` keeps the remote-side modification as diffed,
    /// `TakeLocal` drops it, `Merge` substitutes the override fields.
    /// Additions and deletions are untouched — one-sided presence is not
    /// a conflict.
    pub fn rewrite(&self, mut delta: Delta) -> Delta {
        delta.modified.retain_mut(|change| {
            match self.choices.get(&change.id) {
                None | Some(Resolution::TakeRemote) => true,
                Some(Resolution::TakeLocal) => false,
                Some(Resolution::Merge { field_overrides }) => {
                    change.changes = field_overrides.clone();
                    !change.changes.is_empty()
                }
            }
        });
        delta
    }
}

/// Compare the shared ids of two snapshots and report divergent fields.
pub fn detect(local: &TreeSnapshot, remote: &TreeSnapshot) -> Vec<Conflict> {
    let local_nodes = local.tree.flatten();
    let remote_nodes = remote.tree.flatten();

    let mut conflicts = Vec::new();
    // Walk the local tree for a stable report order.
    local.tree.walk(&mut |node, _| {
        let id = node.id();
        let Some(theirs) = remote_nodes.get(id) else {
            return;
        };
        let ours = &local_nodes[id];

        let title = (ours.title != theirs.title).then(|| FieldDiff {
            local: ours.title.clone(),
            remote: theirs.title.clone(),
        });
        let url = (ours.url != theirs.url).then(|| FieldDiff {
            local: ours.url.clone().unwrap_or_default(),
            remote: theirs.url.clone().unwrap_or_default(),
        });
        let parent = (ours.parent_id != theirs.parent_id).then(|| FieldDiff {
            local: ours.parent_id.clone().unwrap_or_default(),
            remote: theirs.parent_id.clone().unwrap_or_default(),
        });

        if title.is_some() || url.is_some() || parent.is_some() {
            conflicts.push(Conflict {
                id: id.to_string(),
                title,
                url,
                parent,
                local_modified_at: ours.modified_at,
                remote_modified_at: theirs.modified_at,
            });
        }
    });
    conflicts
}

/// Build a plan for the given conflicts, or `None` when the strategy is
/// `manual` and the caller must supply one.
pub fn resolve(conflicts: &[Conflict], strategy: Strategy) -> Option<ResolutionPlan> {
    if strategy == Strategy::Manual {
        return None;
    }

    let mut plan = ResolutionPlan::default();
    for conflict in conflicts {
        let choice = match strategy {
            Strategy::PreferLocal => Resolution::TakeLocal,
            Strategy::PreferRemote => Resolution::TakeRemote,
            Strategy::PreferNewest => {
                match (conflict.local_modified_at, conflict.remote_modified_at) {
                    // Remote wins ties for cross-device determinism.
                    (Some(ours), Some(theirs)) if ours > theirs => Resolution::TakeLocal,
                    _ => Resolution::TakeRemote,
                }
            }
            Strategy::Manual => unreachable!(),
        };
        plan.choices.insert(conflict.id.clone(), choice);
    }
    Some(plan)
}
