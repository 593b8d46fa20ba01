//! Reference tree nodes and path arithmetic.

use crate::error::TreeError;
use crate::types::{hash_hex, lookup_hash, sha3_256, Hash, Timestamp, EMPTY_HASH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    File,
    Directory,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "f",
            NodeKind::Directory => "d",
        }
    }
}

/// One file or directory entry of an allocation.
///
/// `path` is identity: the lookup hash, parent linkage, and path level all
/// derive from it, so moves rewrite rather than relink. A directory owns its
/// `children` name list, kept sorted ascending at all times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefNode {
    pub allocation_id: String,
    pub kind: NodeKind,
    pub name: String,
    pub path: String,
    pub parent_path: String,
    pub path_level: usize,
    pub lookup_hash: Hash,

    /// Content hash of committed bytes (the validation root). Files only.
    pub validation_root: Hash,
    pub fixed_merkle_root: Hash,
    pub size: u64,
    pub actual_size: u64,
    pub actual_hash: Hash,
    pub thumbnail_size: u64,
    pub thumbnail_hash: Hash,
    pub custom_meta: String,
    pub attributes: BTreeMap<String, String>,
    pub chunk_size: usize,
    pub num_blocks: u64,

    /// Subtree/content digest computed bottom-up by the tree.
    pub hash: Hash,
    /// Allocation root label of the connection that last wrote this node.
    pub write_marker: String,
    /// Child names, sorted ascending. Directories only.
    pub children: Vec<String>,

    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl RefNode {
    fn base(allocation_id: &str, kind: NodeKind, path: &str, ts: Timestamp) -> Self {
        Self {
            allocation_id: allocation_id.to_string(),
            kind,
            name: base_name(path).to_string(),
            path: path.to_string(),
            parent_path: parent_path(path),
            path_level: path_level(path),
            lookup_hash: lookup_hash(allocation_id, path),
            validation_root: EMPTY_HASH,
            fixed_merkle_root: EMPTY_HASH,
            size: 0,
            actual_size: 0,
            actual_hash: EMPTY_HASH,
            thumbnail_size: 0,
            thumbnail_hash: EMPTY_HASH,
            custom_meta: String::new(),
            attributes: BTreeMap::new(),
            chunk_size: 0,
            num_blocks: 0,
            hash: EMPTY_HASH,
            write_marker: String::new(),
            children: Vec::new(),
            created_at: ts,
            updated_at: ts,
        }
    }

    pub fn new_root(allocation_id: &str, ts: Timestamp) -> Self {
        Self::base(allocation_id, NodeKind::Directory, "/", ts)
    }

    pub fn new_directory(allocation_id: &str, path: &str, ts: Timestamp) -> Self {
        Self::base(allocation_id, NodeKind::Directory, path, ts)
    }

    pub fn new_file(allocation_id: &str, path: &str, ts: Timestamp) -> Self {
        Self::base(allocation_id, NodeKind::File, path, ts)
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    pub fn is_root(&self) -> bool {
        self.path == "/"
    }

    /// Rewrite identity after a move/rename/copy: path, parent linkage,
    /// level, and lookup hash all follow the new path.
    pub fn set_path(&mut self, path: &str) {
        self.name = base_name(path).to_string();
        self.path = path.to_string();
        self.parent_path = parent_path(path);
        self.path_level = path_level(path);
        self.lookup_hash = lookup_hash(&self.allocation_id, path);
    }

    /// Deterministic content digest of a file node. Directory digests are
    /// computed by the tree from children.
    pub fn file_hash(&self) -> Hash {
        let attrs = serde_json::to_string(&self.attributes).unwrap_or_default();
        let input = format!(
            "{}:{}:{}:{}:{}:{}:{}:{}:{}:{}:{}",
            self.allocation_id,
            self.kind.as_str(),
            self.name,
            self.path,
            self.size,
            hash_hex(&self.validation_root),
            hash_hex(&self.fixed_merkle_root),
            self.actual_size,
            hash_hex(&self.actual_hash),
            attrs,
            self.chunk_size,
        );
        sha3_256(input.as_bytes())
    }

    /// `ceil(size / chunk_size)`, zero for an unset chunk size.
    pub fn file_num_blocks(&self) -> u64 {
        if self.chunk_size == 0 {
            return 0;
        }
        self.size.div_ceil(self.chunk_size as u64)
    }
}

/// Validate and normalize an absolute reference path: leading `/`, no
/// trailing slash (except root), no empty, `.` or `..` segments.
pub fn normalize_path(path: &str) -> Result<String, TreeError> {
    if path == "/" {
        return Ok("/".to_string());
    }
    if !path.starts_with('/') || path.ends_with('/') {
        return Err(TreeError::InvalidReferencePath(path.to_string()));
    }
    for segment in path[1..].split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(TreeError::InvalidReferencePath(path.to_string()));
        }
    }
    Ok(path.to_string())
}

/// Parent path of a normalized path; empty for the root itself.
pub fn parent_path(path: &str) -> String {
    if path == "/" {
        return String::new();
    }
    match path.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => path[..idx].to_string(),
        None => String::new(),
    }
}

/// Final component of a normalized path; `/` for the root.
pub fn base_name(path: &str) -> &str {
    if path == "/" {
        return "/";
    }
    path.rsplit('/').next().unwrap_or(path)
}

/// Depth below the root: `/` is 0, `/a` is 1, `/a/b` is 2.
pub fn path_level(path: &str) -> usize {
    if path == "/" {
        return 0;
    }
    path.matches('/').count()
}

/// Join a directory path and a child name.
pub fn join_path(dir: &str, name: &str) -> String {
    if dir == "/" {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Whether `ancestor` strictly contains `path`.
pub fn is_ancestor_of(ancestor: &str, path: &str) -> bool {
    if ancestor == path {
        return false;
    }
    if ancestor == "/" {
        return true;
    }
    path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/')
}

/// All ancestor directories of a path, root first, excluding the path
/// itself.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = vec!["/".to_string()];
    if path == "/" {
        return out;
    }
    let mut current = String::new();
    let segments: Vec<&str> = path[1..].split('/').collect();
    for segment in &segments[..segments.len() - 1] {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_helpers_agree() {
        assert_eq!(parent_path("/a/b/c"), "/a/b");
        assert_eq!(parent_path("/a"), "/");
        assert_eq!(parent_path("/"), "");
        assert_eq!(base_name("/a/b/c"), "c");
        assert_eq!(base_name("/"), "/");
        assert_eq!(path_level("/"), 0);
        assert_eq!(path_level("/a/b"), 2);
        assert_eq!(join_path("/", "x"), "/x");
        assert_eq!(join_path("/a", "x"), "/a/x");
    }

    #[test]
    fn normalize_rejects_malformed_paths() {
        assert!(normalize_path("/ok/path").is_ok());
        assert!(normalize_path("/").is_ok());
        assert!(normalize_path("relative").is_err());
        assert!(normalize_path("/trailing/").is_err());
        assert!(normalize_path("/a//b").is_err());
        assert!(normalize_path("/a/../b").is_err());
    }

    #[test]
    fn ancestry_is_segment_aware() {
        assert!(is_ancestor_of("/", "/a"));
        assert!(is_ancestor_of("/a", "/a/b/c"));
        assert!(!is_ancestor_of("/a", "/ab"));
        assert!(!is_ancestor_of("/a", "/a"));
        assert_eq!(ancestors("/a/b/c"), vec!["/", "/a", "/a/b"]);
        assert_eq!(ancestors("/a"), vec!["/"]);
    }

    #[test]
    fn set_path_rewrites_identity() {
        let mut node = RefNode::new_file("alloc", "/a/b.txt", 1);
        let old_lookup = node.lookup_hash;
        node.set_path("/c/b.txt");
        assert_eq!(node.parent_path, "/c");
        assert_eq!(node.name, "b.txt");
        assert_ne!(node.lookup_hash, old_lookup);
        assert_eq!(node.lookup_hash, lookup_hash("alloc", "/c/b.txt"));
    }

    #[test]
    fn file_hash_tracks_content_fields() {
        let mut node = RefNode::new_file("alloc", "/f", 1);
        let before = node.file_hash();
        node.validation_root = sha3_256(b"content");
        assert_ne!(node.file_hash(), before);
    }

    #[test]
    fn num_blocks_rounds_up() {
        let mut node = RefNode::new_file("alloc", "/f", 1);
        node.size = 2310;
        node.chunk_size = 64 * 1024;
        assert_eq!(node.file_num_blocks(), 1);
        node.size = 65537;
        assert_eq!(node.file_num_blocks(), 2);
        node.chunk_size = 0;
        assert_eq!(node.file_num_blocks(), 0);
    }
}
