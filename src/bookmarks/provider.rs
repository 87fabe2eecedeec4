//! The [`BookmarkProvider`] capability and the in-process implementation.
//!
//! Providers own the live tree; the core only ever sees snapshots and
//! hands back deltas. Change notifications flow through a broadcast
//! channel so the service loop can debounce them.

use crate::bookmarks::{default_tree, BookmarkNode, TreeSnapshot};
use crate::delta::{self, ApplyReport, Delta};
use crate::error::SyncError;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

/// Change events a provider must report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookmarkEvent {
    /// A node was created.
    Created { id: String },
    /// A node (and its subtree) was removed.
    Removed { id: String },
    /// Title or URL changed.
    Changed { id: String },
    /// A node moved to a different parent.
    Moved { id: String },
    /// Children of a folder were reordered.
    Reordered { parent_id: String },
}

/// Capability interface over the live bookmark tree.
#[async_trait]
pub trait BookmarkProvider: Send + Sync {
    /// Capture an immutable snapshot of the current tree.
    async fn export(&self) -> Result<TreeSnapshot, SyncError>;

    /// Apply a delta to the live tree. Implementations must suppress
    /// change events for the duration so sync does not re-trigger itself.
    async fn apply(&self, delta: &Delta) -> Result<ApplyReport, SyncError>;

    /// Subscribe to change events.
    fn subscribe(&self) -> broadcast::Receiver<BookmarkEvent>;
}

/// In-process provider holding the tree in memory, optionally persisted
/// as JSON on disk. Serves as the local backend and as the test double.
pub struct LocalProvider {
    tree: Mutex<BookmarkNode>,
    path: Option<PathBuf>,
    device_id: String,
    events: broadcast::Sender<BookmarkEvent>,
    /// Bulk mode: while set, mutations emit no events.
    suppress: AtomicBool,
}

impl LocalProvider {
    /// Create a provider seeded with the default tree.
    pub fn new(device_id: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            tree: Mutex::new(default_tree()),
            path: None,
            device_id: device_id.into(),
            events,
            suppress: AtomicBool::new(false),
        }
    }

    /// Create a provider backed by a JSON file. Loads the tree if the
    /// file exists, otherwise starts from the default tree.
    pub fn with_file(device_id: impl Into<String>, path: PathBuf) -> anyhow::Result<Self> {
        let tree = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            default_tree()
        };
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            tree: Mutex::new(tree),
            path: Some(path),
            device_id: device_id.into(),
            events,
            suppress: AtomicBool::new(false),
        })
    }

    /// Seed the provider with a specific tree (tests).
    pub fn with_tree(device_id: impl Into<String>, tree: BookmarkNode) -> Self {
        let provider = Self::new(device_id);
        *provider.tree.lock() = tree;
        provider
    }

    fn emit(&self, event: BookmarkEvent) {
        if !self.suppress.load(Ordering::SeqCst) {
            // No receivers is fine; nobody is watching yet.
            let _ = self.events.send(event);
        }
    }

    fn save(&self, tree: &BookmarkNode) -> Result<(), SyncError> {
        if let Some(path) = &self.path {
            let raw = serde_json::to_string_pretty(tree)
                .map_err(|e| SyncError::Fatal(format!("failed to encode tree: {e}")))?;
            std::fs::write(path, raw)
                .map_err(|e| SyncError::Fatal(format!("failed to persist tree: {e}")))?;
        }
        Ok(())
    }

    /// Current tree, cloned (tests and diagnostics).
    pub fn tree(&self) -> BookmarkNode {
        self.tree.lock().clone()
    }

    // ── Mutation surface (what the user's edits look like) ──────────

    /// Add a link under the given folder. Returns the new node id.
    pub fn add_link(&self, parent_id: &str, title: &str, url: &str) -> Result<String, SyncError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.add_link_with_id(&id, parent_id, title, url)?;
        Ok(id)
    }

    /// Add a link with a caller-chosen id (tests need stable ids).
    pub fn add_link_with_id(
        &self,
        id: &str,
        parent_id: &str,
        title: &str,
        url: &str,
    ) -> Result<(), SyncError> {
        {
            let mut tree = self.tree.lock();
            let parent = find_mut(&mut tree, parent_id)
                .ok_or_else(|| SyncError::Fatal(format!("no such folder {parent_id:?}")))?;
            let children = parent
                .children_mut()
                .ok_or_else(|| SyncError::Fatal(format!("{parent_id:?} is not a folder")))?;
            children.push(BookmarkNode::Link {
                id: id.to_string(),
                title: title.to_string(),
                url: url.to_string(),
                modified_at: Some(Utc::now()),
            });
            touch(parent);
            self.save(&tree)?;
        }
        self.emit(BookmarkEvent::Created { id: id.to_string() });
        Ok(())
    }

    /// Remove a node and its subtree.
    pub fn remove(&self, id: &str) -> Result<(), SyncError> {
        {
            let mut tree = self.tree.lock();
            if !remove_node(&mut tree, id) {
                return Err(SyncError::Fatal(format!("no such node {id:?}")));
            }
            self.save(&tree)?;
        }
        self.emit(BookmarkEvent::Removed { id: id.to_string() });
        Ok(())
    }

    /// Rename a node.
    pub fn rename(&self, id: &str, new_title: &str) -> Result<(), SyncError> {
        {
            let mut tree = self.tree.lock();
            let node = find_mut(&mut tree, id)
                .ok_or_else(|| SyncError::Fatal(format!("no such node {id:?}")))?;
            match node {
                BookmarkNode::Folder {
                    title, modified_at, ..
                }
                | BookmarkNode::Link {
                    title, modified_at, ..
                } => {
                    *title = new_title.to_string();
                    *modified_at = Some(Utc::now());
                }
            }
            self.save(&tree)?;
        }
        self.emit(BookmarkEvent::Changed { id: id.to_string() });
        Ok(())
    }

    /// Reorder a folder's children to the given id order. Ids missing
    /// from `order` keep their relative position at the end.
    pub fn reorder(&self, parent_id: &str, order: &[&str]) -> Result<(), SyncError> {
        {
            let mut tree = self.tree.lock();
            let parent = find_mut(&mut tree, parent_id)
                .ok_or_else(|| SyncError::Fatal(format!("no such folder {parent_id:?}")))?;
            let children = parent
                .children_mut()
                .ok_or_else(|| SyncError::Fatal(format!("{parent_id:?} is not a folder")))?;
            let rank = |id: &str| {
                order
                    .iter()
                    .position(|o| *o == id)
                    .unwrap_or(order.len())
            };
            children.sort_by_key(|c| rank(c.id()));
            touch(parent);
            self.save(&tree)?;
        }
        self.emit(BookmarkEvent::Reordered {
            parent_id: parent_id.to_string(),
        });
        Ok(())
    }

    /// Move a node under a different folder. Moving a folder into its own
    /// subtree is rejected.
    pub fn move_node(&self, id: &str, new_parent_id: &str) -> Result<(), SyncError> {
        {
            let mut tree = self.tree.lock();
            match find_mut(&mut tree, new_parent_id) {
                Some(node) if node.is_folder() => {}
                Some(_) => {
                    return Err(SyncError::Fatal(format!("{new_parent_id:?} is not a folder")))
                }
                None => return Err(SyncError::Fatal(format!("no such folder {new_parent_id:?}"))),
            }
            let node = detach_node(&mut tree, id)
                .ok_or_else(|| SyncError::Fatal(format!("no such node {id:?}")))?;
            let Some(parent) = find_mut(&mut tree, new_parent_id) else {
                // The target lives inside the detached subtree. Put the
                // node back where the root can reach it and refuse.
                if let Some(children) = tree.children_mut() {
                    children.push(node);
                }
                return Err(SyncError::Fatal(format!(
                    "cannot move {id:?} into its own subtree"
                )));
            };
            let children = parent
                .children_mut()
                .ok_or_else(|| SyncError::Fatal(format!("{new_parent_id:?} is not a folder")))?;
            children.push(node);
            touch(parent);
            self.save(&tree)?;
        }
        self.emit(BookmarkEvent::Moved { id: id.to_string() });
        Ok(())
    }
}

#[async_trait]
impl BookmarkProvider for LocalProvider {
    async fn export(&self) -> Result<TreeSnapshot, SyncError> {
        let tree = self.tree.lock().clone();
        tree.validate().map_err(SyncError::Fatal)?;
        Ok(delta::snapshot(tree, &self.device_id))
    }

    async fn apply(&self, delta: &Delta) -> Result<ApplyReport, SyncError> {
        self.suppress.store(true, Ordering::SeqCst);
        let result = (|| -> Result<ApplyReport, SyncError> {
            let mut tree = self.tree.lock();
            let (next, report) = delta::apply(&tree, delta)?;
            *tree = next;
            self.save(&tree)?;
            Ok(report)
        })();
        self.suppress.store(false, Ordering::SeqCst);
        result
    }

    fn subscribe(&self) -> broadcast::Receiver<BookmarkEvent> {
        self.events.subscribe()
    }
}

/// Mark a folder's contents as changed now.
fn touch(node: &mut BookmarkNode) {
    if let BookmarkNode::Folder { modified_at, .. } = node {
        *modified_at = Some(Utc::now());
    }
}

fn find_mut<'a>(node: &'a mut BookmarkNode, id: &str) -> Option<&'a mut BookmarkNode> {
    if node.id() == id {
        return Some(node);
    }
    node.children_mut()?
        .iter_mut()
        .find_map(|c| find_mut(c, id))
}

fn remove_node(node: &mut BookmarkNode, id: &str) -> bool {
    let Some(children) = node.children_mut() else {
        return false;
    };
    if let Some(pos) = children.iter().position(|c| c.id() == id) {
        children.remove(pos);
        touch(node);
        return true;
    }
    children.iter_mut().any(|c| remove_node(c, id))
}

fn detach_node(node: &mut BookmarkNode, id: &str) -> Option<BookmarkNode> {
    let children = node.children_mut()?;
    if let Some(pos) = children.iter().position(|c| c.id() == id) {
        return Some(children.remove(pos));
    }
    children.iter_mut().find_map(|c| detach_node(c, id))
}
