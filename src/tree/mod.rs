//! Reference Tree
//!
//! The hash tree of one allocation's directory hierarchy. Nodes are kept in
//! a path-indexed map (no raw cross-references), directories own sorted
//! child-name lists, and every mutation dirties the ancestor chain so hash
//! recomputation walks only dirty subtrees. The working tree for a
//! connection is single-owner; nothing here is shared across tasks.

pub mod node;

use crate::error::TreeError;
use crate::meta::MetaStore;
use crate::types::{sha3_256, Hash, Timestamp, EMPTY_HASH};
use node::{
    ancestors, is_ancestor_of, join_path, normalize_path, parent_path, NodeKind, RefNode,
};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// A file node's content slated for physical garbage collection after its
/// reference rows are gone. One candidate per deleted file reference.
#[derive(Debug, Clone)]
pub struct GcCandidate {
    pub content_hash: Hash,
    pub thumbnail_hash: Hash,
    pub size: u64,
}

/// In-memory working tree of one allocation.
pub struct RefTree {
    allocation_id: String,
    nodes: HashMap<String, RefNode>,
    dirty: HashSet<String>,
    changed: HashSet<String>,
    deleted: Vec<RefNode>,
    superseded: Vec<RefNode>,
}

impl RefTree {
    /// A synthetic empty tree: just the root directory. New allocations
    /// start here lazily.
    pub fn empty(allocation_id: &str, ts: Timestamp) -> Self {
        let root = RefNode::new_root(allocation_id, ts);
        let mut nodes = HashMap::new();
        nodes.insert("/".to_string(), root);
        Self {
            allocation_id: allocation_id.to_string(),
            nodes,
            dirty: HashSet::new(),
            changed: HashSet::new(),
            deleted: Vec::new(),
            superseded: Vec::new(),
        }
    }

    /// Load the root, all ancestors of the requested paths, and their
    /// immediate children in one pass over the metadata store. A missing
    /// allocation yields a synthetic empty root, not an error.
    pub fn load(
        meta: &dyn MetaStore,
        allocation_id: &str,
        paths: &[String],
        ts: Timestamp,
    ) -> Result<Self, TreeError> {
        let root = match meta.find_by_path(allocation_id, "/")? {
            Some(row) => row,
            None => {
                let orphans = meta.find_children(allocation_id, "/")?;
                if !orphans.is_empty() {
                    // Children without a root row is data corruption, not a
                    // lazily-started allocation.
                    return Err(TreeError::MissingRoot(allocation_id.to_string()));
                }
                return Ok(Self::empty(allocation_id, ts));
            }
        };

        let mut tree = Self {
            allocation_id: allocation_id.to_string(),
            nodes: HashMap::new(),
            dirty: HashSet::new(),
            changed: HashSet::new(),
            deleted: Vec::new(),
            superseded: Vec::new(),
        };
        tree.nodes.insert("/".to_string(), root);
        tree.load_children(meta, "/")?;

        for path in paths {
            let path = normalize_path(path)?;
            let mut chain = ancestors(&path);
            chain.push(path.clone());
            for dir in chain {
                if dir == "/" {
                    continue;
                }
                if !tree.nodes.contains_key(&dir) {
                    let Some(row) = meta.find_by_path(allocation_id, &dir)? else {
                        break; // remainder of the chain does not exist yet
                    };
                    if row.path == "/" {
                        return Err(TreeError::DuplicateRoot(allocation_id.to_string()));
                    }
                    tree.nodes.insert(dir.clone(), row);
                }
                if tree.nodes[&dir].is_directory() {
                    tree.load_children(meta, &dir)?;
                }
            }
            // Subtree operations (delete, move, copy) need every descendant
            // row of the requested path, not just immediate children.
            if tree.nodes.get(&path).is_some_and(|n| n.is_directory()) {
                tree.load_descendants(meta, &path)?;
            }
        }
        Ok(tree)
    }

    fn load_descendants(&mut self, meta: &dyn MetaStore, root: &str) -> Result<(), TreeError> {
        let mut queue = vec![root.to_string()];
        while let Some(dir) = queue.pop() {
            self.load_children(meta, &dir)?;
            let children = self.nodes[&dir].children.clone();
            for name in children {
                let child = join_path(&dir, &name);
                if self.nodes.get(&child).is_some_and(|n| n.is_directory()) {
                    queue.push(child);
                }
            }
        }
        Ok(())
    }

    fn load_children(&mut self, meta: &dyn MetaStore, dir: &str) -> Result<(), TreeError> {
        let rows = meta.find_children(&self.allocation_id, dir)?;
        let mut names: Vec<String> = rows.iter().map(|r| r.name.clone()).collect();
        names.sort();
        for row in rows {
            self.nodes.entry(row.path.clone()).or_insert(row);
        }
        if let Some(node) = self.nodes.get_mut(dir) {
            node.children = names;
        }
        Ok(())
    }

    pub fn allocation_id(&self) -> &str {
        &self.allocation_id
    }

    pub fn root(&self) -> &RefNode {
        &self.nodes["/"]
    }

    pub fn get(&self, path: &str) -> Option<&RefNode> {
        self.nodes.get(path)
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    /// Non-root live nodes, the quantity the allocation entry quota bounds.
    pub fn node_count(&self) -> u64 {
        (self.nodes.len() - 1) as u64
    }

    /// Rows created or recomputed since load, for the finalize transaction.
    pub fn changed_rows(&self) -> Vec<RefNode> {
        let mut rows: Vec<RefNode> = self
            .changed
            .iter()
            .filter_map(|p| self.nodes.get(p).cloned())
            .collect();
        rows.sort_by(|a, b| a.path.cmp(&b.path));
        rows
    }

    /// Tombstoned rows awaiting deletion at finalize.
    pub fn deleted_rows(&self) -> &[RefNode] {
        &self.deleted
    }

    /// Snapshots of file rows whose content was replaced in place. The rows
    /// stay live; finalize drops their old content index entries.
    pub fn superseded_rows(&self) -> &[RefNode] {
        &self.superseded
    }

    /// Record a file's current content as replaced. Returns a GC candidate
    /// for the old bytes, or none if the file carried no content. Unchanged
    /// hashes survive garbage collection because the updated row re-indexes
    /// them in the same finalize transaction.
    pub fn supersede_content(&mut self, path: &str) -> Result<Vec<GcCandidate>, TreeError> {
        let node = self
            .nodes
            .get(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        if node.kind != NodeKind::File || node.validation_root == EMPTY_HASH {
            return Ok(Vec::new());
        }
        let candidate = GcCandidate {
            content_hash: node.validation_root,
            thumbnail_hash: node.thumbnail_hash,
            size: node.size,
        };
        self.superseded.push(node.clone());
        Ok(vec![candidate])
    }

    fn mark_dirty(&mut self, path: &str) {
        for ancestor in ancestors(path) {
            self.dirty.insert(ancestor);
        }
        self.dirty.insert(path.to_string());
    }

    /// Mutate a node in place and dirty its ancestor chain.
    pub fn with_node_mut<F>(&mut self, path: &str, f: F) -> Result<(), TreeError>
    where
        F: FnOnce(&mut RefNode),
    {
        let node = self
            .nodes
            .get_mut(path)
            .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
        f(node);
        self.mark_dirty(path);
        Ok(())
    }

    /// Attach a new node under its parent, preserving the sorted-children
    /// invariant. Fails if the parent is missing/not a directory or the
    /// destination already exists.
    pub fn add_child(&mut self, node: RefNode) -> Result<(), TreeError> {
        let path = normalize_path(&node.path)?;
        if path == "/" {
            return Err(TreeError::DuplicateRoot(self.allocation_id.clone()));
        }
        if self.nodes.contains_key(&path) {
            return Err(TreeError::DestinationExists(path));
        }
        let parent = self
            .nodes
            .get_mut(&node.parent_path)
            .ok_or_else(|| TreeError::InvalidReferencePath(node.parent_path.clone()))?;
        if !parent.is_directory() {
            return Err(TreeError::InvalidReferencePath(node.parent_path.clone()));
        }
        match parent.children.binary_search(&node.name) {
            Ok(_) => return Err(TreeError::DestinationExists(path)),
            Err(pos) => parent.children.insert(pos, node.name.clone()),
        }
        self.nodes.insert(path.clone(), node);
        self.mark_dirty(&path);
        Ok(())
    }

    /// Detach one node and its whole subtree from the tree. Returns the
    /// node followed by its descendants.
    pub fn remove_child(&mut self, path: &str) -> Result<Vec<RefNode>, TreeError> {
        if path == "/" {
            return Err(TreeError::InvalidParameter(
                "cannot detach the root".to_string(),
            ));
        }
        if !self.nodes.contains_key(path) {
            return Err(TreeError::NotFound(path.to_string()));
        }
        let (parent, name) = {
            let node = &self.nodes[path];
            (node.parent_path.clone(), node.name.clone())
        };
        if let Some(parent_node) = self.nodes.get_mut(&parent) {
            if let Ok(pos) = parent_node.children.binary_search(&name) {
                parent_node.children.remove(pos);
            }
        }
        self.mark_dirty(&parent);
        self.dirty.remove(path);

        let mut detached = vec![self.nodes.remove(path).expect("checked above")];
        let descendants: Vec<String> = self
            .nodes
            .keys()
            .filter(|p| is_ancestor_of(path, p))
            .cloned()
            .collect();
        for p in descendants {
            self.dirty.remove(&p);
            detached.push(self.nodes.remove(&p).expect("key from map"));
        }
        // Deterministic order: parent before child.
        detached.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(detached)
    }

    /// Reattach nodes in parent-before-child order. Directory children
    /// lists are stale after a path rewrite; they are cleared here and
    /// rebuilt by `add_child` as each descendant arrives.
    fn attach_detached(&mut self, detached: Vec<RefNode>) -> Result<(), TreeError> {
        for mut node in detached {
            node.children.clear();
            self.add_child(node)?;
        }
        Ok(())
    }

    /// Create any missing intermediate directories down to `path`
    /// (inclusive). Returns the number of directories created.
    pub fn mkdirs(&mut self, path: &str, ts: Timestamp) -> Result<usize, TreeError> {
        let path = normalize_path(path)?;
        let mut created = 0;
        let mut chain = ancestors(&path);
        if path != "/" {
            chain.push(path);
        }
        for dir in chain {
            if dir == "/" {
                continue;
            }
            match self.nodes.get(&dir) {
                Some(existing) if existing.is_directory() => {}
                Some(_) => return Err(TreeError::DestinationExists(dir)),
                None => {
                    self.add_child(RefNode::new_directory(&self.allocation_id, &dir, ts))?;
                    created += 1;
                }
            }
        }
        Ok(created)
    }

    /// Rename a node in place, rewriting descendant paths. Fails on a root
    /// target or an existing destination sibling.
    pub fn rename(&mut self, path: &str, new_name: &str, ts: Timestamp) -> Result<String, TreeError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(TreeError::InvalidParameter(
                "cannot rename the root".to_string(),
            ));
        }
        if new_name.is_empty() || new_name.contains('/') || new_name == "." || new_name == ".." {
            return Err(TreeError::InvalidParameter(format!(
                "invalid name {new_name:?}"
            )));
        }
        let node = self
            .nodes
            .get(&path)
            .ok_or_else(|| TreeError::NotFound(path.clone()))?;
        let new_path = join_path(&node.parent_path, new_name);
        if self.nodes.contains_key(&new_path) {
            return Err(TreeError::DestinationExists(new_path));
        }
        self.relocate_subtree(&path, &new_path, ts)?;
        Ok(new_path)
    }

    /// Move a subtree to a new path, creating missing destination
    /// ancestors. Non-empty directories move wholesale; every descendant
    /// path is rewritten.
    pub fn move_node(&mut self, src: &str, dst: &str, ts: Timestamp) -> Result<(), TreeError> {
        let src = normalize_path(src)?;
        let dst = normalize_path(dst)?;
        if src == "/" || dst == "/" {
            return Err(TreeError::InvalidParameter(
                "cannot move the root".to_string(),
            ));
        }
        if !self.nodes.contains_key(&src) {
            return Err(TreeError::NotFound(src));
        }
        if self.nodes.contains_key(&dst) {
            return Err(TreeError::DestinationExists(dst));
        }
        if is_ancestor_of(&src, &dst) {
            return Err(TreeError::InvalidParameter(format!(
                "cannot move {src} into its own subtree {dst}"
            )));
        }
        self.mkdirs(&parent_path(&dst), ts)?;
        self.relocate_subtree(&src, &dst, ts)
    }

    fn relocate_subtree(&mut self, src: &str, dst: &str, ts: Timestamp) -> Result<(), TreeError> {
        let mut detached = self.remove_child(src)?;
        for node in &mut detached {
            let suffix = &node.path[src.len()..];
            node.set_path(&format!("{dst}{suffix}"));
            node.updated_at = ts;
        }
        self.attach_detached(detached)?;
        self.mark_dirty(dst);
        Ok(())
    }

    /// Duplicate a subtree's metadata at a new path. No byte copy happens
    /// here; final storage is content-addressed and shared.
    pub fn copy_node(&mut self, src: &str, dst: &str, ts: Timestamp) -> Result<(), TreeError> {
        let src = normalize_path(src)?;
        let dst = normalize_path(dst)?;
        if src == "/" {
            return Err(TreeError::InvalidParameter(
                "cannot copy the root".to_string(),
            ));
        }
        if !self.nodes.contains_key(&src) {
            return Err(TreeError::NotFound(src));
        }
        if self.nodes.contains_key(&dst) {
            return Err(TreeError::DestinationExists(dst));
        }
        if is_ancestor_of(&src, &dst) {
            return Err(TreeError::InvalidParameter(format!(
                "cannot copy {src} into its own subtree {dst}"
            )));
        }
        self.mkdirs(&parent_path(&dst), ts)?;

        let mut clones: Vec<RefNode> = self
            .nodes
            .values()
            .filter(|n| n.path == src || is_ancestor_of(&src, &n.path))
            .cloned()
            .collect();
        clones.sort_by(|a, b| a.path.cmp(&b.path));
        for clone in &mut clones {
            let suffix = &clone.path[src.len()..];
            clone.set_path(&format!("{dst}{suffix}"));
            clone.created_at = ts;
            clone.updated_at = ts;
        }
        self.attach_detached(clones)
    }

    /// Tombstone a node and its entire subtree. Returns one GC candidate
    /// per deleted file reference; physical deletion is the caller's job
    /// and happens only if no other live reference exists.
    pub fn delete(&mut self, path: &str, ts: Timestamp) -> Result<Vec<GcCandidate>, TreeError> {
        let path = normalize_path(path)?;
        if path == "/" {
            return Err(TreeError::InvalidParameter(
                "cannot delete the root".to_string(),
            ));
        }
        let mut detached = self.remove_child(&path)?;
        let mut candidates = Vec::new();
        for node in &mut detached {
            node.updated_at = ts;
            if node.kind == NodeKind::File && node.validation_root != EMPTY_HASH {
                candidates.push(GcCandidate {
                    content_hash: node.validation_root,
                    thumbnail_hash: node.thumbnail_hash,
                    size: node.size,
                });
            }
        }
        debug!(
            allocation_id = %self.allocation_id,
            path = %path,
            tombstoned = detached.len(),
            gc_candidates = candidates.len(),
            "Deleted subtree"
        );
        self.deleted.extend(detached);
        Ok(candidates)
    }

    /// Lookup hashes of every tombstoned row, excluded from the
    /// referenced-ness query so a row being deleted cannot keep its own
    /// content alive.
    pub fn deleted_lookup_hashes(&self) -> Vec<Hash> {
        self.deleted.iter().map(|n| n.lookup_hash).collect()
    }

    /// Recompute hashes bottom-up over dirty subtrees only. With `persist`,
    /// every recomputed node is written back to the metadata store. Returns
    /// the root hash.
    pub fn calculate_hash(
        &mut self,
        persist: Option<&dyn MetaStore>,
    ) -> Result<Hash, TreeError> {
        let mut pending: Vec<String> = self.dirty.iter().cloned().collect();
        // Deepest first so children are final before their parent hashes.
        pending.sort_by_key(|p| std::cmp::Reverse(node::path_level(p)));

        for path in pending {
            let (kind, children) = {
                let node = self
                    .nodes
                    .get(&path)
                    .ok_or_else(|| TreeError::NotFound(path.clone()))?;
                (node.kind, node.children.clone())
            };
            let computed = match kind {
                NodeKind::File => {
                    let node = self.nodes.get_mut(&path).expect("present above");
                    node.num_blocks = node.file_num_blocks();
                    node.hash = node.file_hash();
                    node.clone()
                }
                NodeKind::Directory => {
                    let mut child_hashes = Vec::with_capacity(children.len());
                    let mut num_blocks = 0u64;
                    for name in &children {
                        let child_path = join_path(&path, name);
                        let child = self
                            .nodes
                            .get(&child_path)
                            .ok_or_else(|| TreeError::NotFound(child_path.clone()))?;
                        child_hashes.push(hex::encode(child.hash));
                        num_blocks += child.num_blocks;
                    }
                    let node = self.nodes.get_mut(&path).expect("present above");
                    node.num_blocks = num_blocks;
                    node.hash = sha3_256(child_hashes.join(":").as_bytes());
                    node.clone()
                }
            };
            if let Some(meta) = persist {
                meta.save_node(&computed)?;
            }
            self.changed.insert(path);
        }
        self.dirty.clear();
        Ok(self.nodes["/"].hash)
    }
}
