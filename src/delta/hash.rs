//! Content-addressed Merkle hashing of bookmark trees.
//!
//! `h(node) = SHA-256(title ‖ url_or_empty ‖ concat(sorted_child_hashes))`.
//! Child hashes are sorted before concatenation, so sibling order does not
//! change a folder's hash; equal root hashes mean identical trees and are
//! the skip-upload signal.

use crate::bookmarks::BookmarkNode;
use sha2::{Digest, Sha256};

/// 32-byte node digest.
pub type NodeDigest = [u8; 32];

/// Hash a single node (and, transitively, its subtree).
pub fn node_hash(node: &BookmarkNode) -> NodeDigest {
    let mut hasher = Sha256::new();
    hasher.update(node.title().as_bytes());
    hasher.update(node.url().unwrap_or("").as_bytes());

    let mut child_hashes: Vec<NodeDigest> =
        node.children().iter().map(node_hash).collect();
    child_hashes.sort_unstable();
    for digest in &child_hashes {
        hasher.update(digest);
    }

    hasher.finalize().into()
}

/// Hex-encoded root hash of a tree.
pub fn tree_hash(root: &BookmarkNode) -> String {
    hex::encode(node_hash(root))
}
