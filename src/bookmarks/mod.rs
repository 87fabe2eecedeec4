//! Bookmark tree model and provider capability.
//!
//! The core never owns the live bookmark tree — it observes it through the
//! [`BookmarkProvider`] capability and hands mutations back as deltas.
//! Concrete providers (the in-process [`LocalProvider`], an OS bridge, a
//! test double) plug in behind the trait.
//!
//! ## Model
//! - [`BookmarkNode`]: recursive `Folder` / `Link` sum. Links carry a URL
//!   and never have children.
//! - [`TreeSnapshot`]: immutable capture of a whole tree plus its Merkle
//!   root hash and the capturing device.
//! - [`FlatNode`]: id-indexed projection used by diffing and conflict
//!   detection.

mod provider;

pub use provider::{BookmarkEvent, BookmarkProvider, LocalProvider};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Id of the tree root. The root and its two well-known top folders are
/// protected from deletion during sync.
pub const ROOT_ID: &str = "0";

/// Node ids that sync must never delete.
pub const PROTECTED_IDS: [&str; 3] = ["0", "1", "2"];

/// A node in the bookmark tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BookmarkNode {
    /// A folder holding further nodes.
    Folder {
        id: String,
        title: String,
        /// Last time this folder's contents changed, when the provider
        /// reports it.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified_at: Option<DateTime<Utc>>,
        children: Vec<BookmarkNode>,
    },
    /// A leaf bookmark.
    Link {
        id: String,
        title: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modified_at: Option<DateTime<Utc>>,
    },
}

impl BookmarkNode {
    /// Create an empty folder.
    pub fn folder(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self::Folder {
            id: id.into(),
            title: title.into(),
            modified_at: None,
            children: Vec::new(),
        }
    }

    /// Create a leaf bookmark.
    pub fn link(
        id: impl Into<String>,
        title: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self::Link {
            id: id.into(),
            title: title.into(),
            url: url.into(),
            modified_at: None,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Folder { id, .. } | Self::Link { id, .. } => id,
        }
    }

    pub fn title(&self) -> &str {
        match self {
            Self::Folder { title, .. } | Self::Link { title, .. } => title,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            Self::Folder { .. } => None,
            Self::Link { url, .. } => Some(url),
        }
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Folder { modified_at, .. } | Self::Link { modified_at, .. } => *modified_at,
        }
    }

    pub fn is_folder(&self) -> bool {
        matches!(self, Self::Folder { .. })
    }

    /// Child nodes. Empty slice for links.
    pub fn children(&self) -> &[BookmarkNode] {
        match self {
            Self::Folder { children, .. } => children,
            Self::Link { .. } => &[],
        }
    }

    /// Mutable child list. `None` for links.
    pub fn children_mut(&mut self) -> Option<&mut Vec<BookmarkNode>> {
        match self {
            Self::Folder { children, .. } => Some(children),
            Self::Link { .. } => None,
        }
    }

    /// Count of `(links, folders)` in this subtree, the root included in
    /// the folder count.
    pub fn counts(&self) -> (usize, usize) {
        let mut links = 0;
        let mut folders = 0;
        self.walk(&mut |node, _| {
            if node.is_folder() {
                folders += 1;
            } else {
                links += 1;
            }
        });
        (links, folders)
    }

    /// Depth-first walk. The callback receives each node and its parent
    /// id (`None` for the root).
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a BookmarkNode, Option<&'a str>)) {
        fn inner<'a>(
            node: &'a BookmarkNode,
            parent: Option<&'a str>,
            f: &mut impl FnMut(&'a BookmarkNode, Option<&'a str>),
        ) {
            f(node, parent);
            for child in node.children() {
                inner(child, Some(node.id()), f);
            }
        }
        inner(self, None, f);
    }

    /// Find a node by id anywhere in this subtree.
    pub fn find(&self, id: &str) -> Option<&BookmarkNode> {
        if self.id() == id {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find(id))
    }

    /// Flatten the tree into id-keyed records with parent links and the
    /// position of each node within its parent.
    pub fn flatten(&self) -> HashMap<String, FlatNode> {
        let mut out = HashMap::new();
        fn inner(node: &BookmarkNode, parent: Option<&str>, index: usize, out: &mut HashMap<String, FlatNode>) {
            out.insert(
                node.id().to_string(),
                FlatNode {
                    id: node.id().to_string(),
                    title: node.title().to_string(),
                    url: node.url().map(str::to_string),
                    parent_id: parent.map(str::to_string),
                    modified_at: node.modified_at(),
                    index,
                    is_folder: node.is_folder(),
                },
            );
            for (i, child) in node.children().iter().enumerate() {
                inner(child, Some(node.id()), i, out);
            }
        }
        inner(self, None, 0, &mut out);
        out
    }

    /// Check structural invariants: unique ids and every node reachable
    /// from the root (cycles are unrepresentable in the owned tree, but a
    /// duplicated id would corrupt diffing).
    pub fn validate(&self) -> Result<(), String> {
        let mut seen = std::collections::HashSet::new();
        let mut dup = None;
        self.walk(&mut |node, _| {
            if !seen.insert(node.id().to_string()) && dup.is_none() {
                dup = Some(node.id().to_string());
            }
        });
        match dup {
            Some(id) => Err(format!("duplicate node id {id:?}")),
            None => Ok(()),
        }
    }
}

/// Flat, id-indexed projection of one node. The field tuple
/// `(title, url, parent_id, modified_at)` is what diffing compares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatNode {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
    /// Position within the parent's child list.
    #[serde(default)]
    pub index: usize,
    #[serde(default)]
    pub is_folder: bool,
}

/// Immutable capture of a bookmark tree.
///
/// Serializes to the plaintext snapshot blob format:
/// `{ "tree": …, "hash": "<hex>", "updated": "<iso>", "device": "<id>" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeSnapshot {
    /// The full tree, root first.
    pub tree: BookmarkNode,
    /// Merkle root hash over the tree (hex). Pure function of `tree`.
    #[serde(rename = "hash")]
    pub root_hash: String,
    /// When the snapshot was taken.
    #[serde(rename = "updated")]
    pub timestamp: DateTime<Utc>,
    /// Device that captured it.
    #[serde(rename = "device")]
    pub device_id: String,
}

impl TreeSnapshot {
    /// Count of `(links, folders)` in the captured tree.
    pub fn counts(&self) -> (usize, usize) {
        self.tree.counts()
    }
}

/// Seed tree every provider starts from: the root with the two protected
/// top-level folders.
pub fn default_tree() -> BookmarkNode {
    BookmarkNode::Folder {
        id: ROOT_ID.into(),
        title: "root".into(),
        modified_at: None,
        children: vec![
            BookmarkNode::folder("1", "Toolbar"),
            BookmarkNode::folder("2", "Other"),
        ],
    }
}
