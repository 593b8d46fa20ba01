//! Change processors
//!
//! The closed set of write operations a connection can batch. Each variant
//! knows how to mutate the working tree (`apply`), how to serialize itself
//! into a persistable record for crash replay (`marshal`/`unmarshal`), and
//! what, if anything, it must do against the content store at commit time.
//! Dispatch is a single exhaustive match over the tagged union.

use crate::error::{BlobberError, MetaError, TreeError};
use crate::store::{FileMeta, FileStore};
use crate::tree::node::{ancestors, base_name, normalize_path, parent_path, NodeKind, RefNode};
use crate::tree::{GcCandidate, RefTree};
use crate::types::{Hash, Timestamp, EMPTY_HASH};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

/// Operation tag persisted with each change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Update,
    Delete,
    Rename,
    Move,
    Copy,
    MkDir,
    SetAttributes,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "insert",
            Operation::Update => "update",
            Operation::Delete => "delete",
            Operation::Rename => "rename",
            Operation::Move => "move",
            Operation::Copy => "copy",
            Operation::MkDir => "mkdir",
            Operation::SetAttributes => "set_attributes",
        }
    }
}

/// Persisted form of one change: tag, owning connection, declared size
/// delta, and the bincode payload of the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub operation: Operation,
    pub connection_id: String,
    pub size: i64,
    pub payload: Vec<u8>,
}

/// Shared inputs every processor applies under.
#[derive(Debug, Clone)]
pub struct ChangeContext {
    pub connection_id: String,
    /// In-progress allocation root label, stamped as `write_marker` on
    /// written nodes.
    pub allocation_root: String,
    pub timestamp: Timestamp,
    /// Maximum non-root entries per allocation.
    pub max_alloc_dir_files: u64,
}

/// Outcome of applying one change to the working tree.
#[derive(Debug, Default)]
pub struct Applied {
    pub path: String,
    pub size_delta: i64,
    /// Content slated for conditional physical deletion at finalize.
    pub gc_candidates: Vec<GcCandidate>,
}

/// Payload of Insert and Update: the client-declared file identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadChange {
    pub path: String,
    pub size: u64,
    pub actual_size: u64,
    pub actual_hash: Hash,
    pub validation_root: Hash,
    pub fixed_merkle_root: Hash,
    pub chunk_size: usize,
    pub custom_meta: String,
    pub thumbnail_size: u64,
    pub thumbnail_hash: Hash,
}

impl UploadChange {
    pub fn file_meta(&self) -> FileMeta {
        FileMeta {
            name: base_name(&self.path).to_string(),
            path: self.path.clone(),
            size: self.size,
            chunk_size: self.chunk_size,
            fixed_merkle_root: self.fixed_merkle_root,
            validation_root: self.validation_root,
            is_thumbnail: false,
            thumbnail_hash: EMPTY_HASH,
        }
    }

    pub fn thumbnail_meta(&self) -> FileMeta {
        FileMeta {
            name: base_name(&self.path).to_string(),
            path: self.path.clone(),
            size: self.thumbnail_size,
            chunk_size: self.chunk_size,
            fixed_merkle_root: EMPTY_HASH,
            validation_root: EMPTY_HASH,
            is_thumbnail: true,
            thumbnail_hash: self.thumbnail_hash,
        }
    }

    fn stamp(&self, node: &mut RefNode, ctx: &ChangeContext) {
        node.size = self.size;
        node.actual_size = self.actual_size;
        node.actual_hash = self.actual_hash;
        node.validation_root = self.validation_root;
        node.fixed_merkle_root = self.fixed_merkle_root;
        node.chunk_size = self.chunk_size;
        node.custom_meta = self.custom_meta.clone();
        node.thumbnail_size = self.thumbnail_size;
        node.thumbnail_hash = self.thumbnail_hash;
        node.write_marker = ctx.allocation_root.clone();
        node.updated_at = ctx.timestamp;
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteChange {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenameChange {
    pub path: String,
    pub new_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveChange {
    pub src_path: String,
    pub dest_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CopyChange {
    pub src_path: String,
    pub dest_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MkDirChange {
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetAttributesChange {
    pub path: String,
    pub attributes: BTreeMap<String, String>,
}

/// One write operation, tagged and matched exhaustively at the dispatch
/// points below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Change {
    Insert(UploadChange),
    Update(UploadChange),
    Delete(DeleteChange),
    Rename(RenameChange),
    Move(MoveChange),
    Copy(CopyChange),
    MkDir(MkDirChange),
    SetAttributes(SetAttributesChange),
}

impl Change {
    pub fn operation(&self) -> Operation {
        match self {
            Change::Insert(_) => Operation::Insert,
            Change::Update(_) => Operation::Update,
            Change::Delete(_) => Operation::Delete,
            Change::Rename(_) => Operation::Rename,
            Change::Move(_) => Operation::Move,
            Change::Copy(_) => Operation::Copy,
            Change::MkDir(_) => Operation::MkDir,
            Change::SetAttributes(_) => Operation::SetAttributes,
        }
    }

    /// Declared size delta, before the tree has been consulted. Exact for
    /// Insert; Update and Delete are settled during `apply`.
    pub fn declared_size(&self) -> i64 {
        match self {
            Change::Insert(u) | Change::Update(u) => u.size as i64,
            _ => 0,
        }
    }

    /// Serialize into a persistable record.
    pub fn marshal(&self, connection_id: &str) -> Result<ChangeRecord, MetaError> {
        let payload = match self {
            Change::Insert(c) | Change::Update(c) => bincode::serialize(c)?,
            Change::Delete(c) => bincode::serialize(c)?,
            Change::Rename(c) => bincode::serialize(c)?,
            Change::Move(c) => bincode::serialize(c)?,
            Change::Copy(c) => bincode::serialize(c)?,
            Change::MkDir(c) => bincode::serialize(c)?,
            Change::SetAttributes(c) => bincode::serialize(c)?,
        };
        Ok(ChangeRecord {
            operation: self.operation(),
            connection_id: connection_id.to_string(),
            size: self.declared_size(),
            payload,
        })
    }

    /// Reconstruct a processor from a persisted record.
    pub fn unmarshal(record: &ChangeRecord) -> Result<Self, MetaError> {
        Ok(match record.operation {
            Operation::Insert => Change::Insert(bincode::deserialize(&record.payload)?),
            Operation::Update => Change::Update(bincode::deserialize(&record.payload)?),
            Operation::Delete => Change::Delete(bincode::deserialize(&record.payload)?),
            Operation::Rename => Change::Rename(bincode::deserialize(&record.payload)?),
            Operation::Move => Change::Move(bincode::deserialize(&record.payload)?),
            Operation::Copy => Change::Copy(bincode::deserialize(&record.payload)?),
            Operation::MkDir => Change::MkDir(bincode::deserialize(&record.payload)?),
            Operation::SetAttributes => {
                Change::SetAttributes(bincode::deserialize(&record.payload)?)
            }
        })
    }

    /// Mutate the working tree. Validation happens before any mutation, so
    /// a failed apply leaves the tree exactly as it was.
    pub fn apply(&self, tree: &mut RefTree, ctx: &ChangeContext) -> Result<Applied, BlobberError> {
        let applied = match self {
            Change::Insert(c) => {
                let path = normalize_path(&c.path)?;
                if tree.exists(&path) {
                    return Err(TreeError::DestinationExists(path).into());
                }
                check_quota(tree, ctx, nodes_to_create(tree, &path))?;
                tree.mkdirs(&parent_path(&path), ctx.timestamp)?;
                let mut node = RefNode::new_file(tree.allocation_id(), &path, ctx.timestamp);
                c.stamp(&mut node, ctx);
                tree.add_child(node)?;
                Applied {
                    path,
                    size_delta: c.size as i64,
                    gc_candidates: Vec::new(),
                }
            }
            Change::Update(c) => {
                let path = normalize_path(&c.path)?;
                let (old_kind, old_size) = {
                    let old = tree
                        .get(&path)
                        .ok_or_else(|| TreeError::NotFound(path.clone()))?;
                    (old.kind, old.size as i64)
                };
                if old_kind != NodeKind::File {
                    return Err(TreeError::InvalidParameter(format!(
                        "cannot update directory {path}"
                    ))
                    .into());
                }
                // The replaced content is a GC candidate; its index entries
                // are dropped at finalize unless the new row re-declares the
                // same hashes.
                let gc_candidates = tree.supersede_content(&path)?;
                tree.with_node_mut(&path, |node| c.stamp(node, ctx))?;
                Applied {
                    path,
                    size_delta: c.size as i64 - old_size,
                    gc_candidates,
                }
            }
            Change::Delete(c) => {
                let path = normalize_path(&c.path)?;
                let gc_candidates = tree.delete(&path, ctx.timestamp)?;
                let size_delta = -(gc_candidates.iter().map(|g| g.size as i64).sum::<i64>());
                Applied {
                    path,
                    size_delta,
                    gc_candidates,
                }
            }
            Change::Rename(c) => {
                let path = tree.rename(&c.path, &c.new_name, ctx.timestamp)?;
                tree.with_node_mut(&path, |node| {
                    node.write_marker = ctx.allocation_root.clone();
                })?;
                Applied {
                    path,
                    ..Applied::default()
                }
            }
            Change::Move(c) => {
                let dest = normalize_path(&c.dest_path)?;
                check_quota(tree, ctx, missing_ancestors(tree, &dest))?;
                tree.move_node(&c.src_path, &dest, ctx.timestamp)?;
                tree.with_node_mut(&dest, |node| {
                    node.write_marker = ctx.allocation_root.clone();
                })?;
                Applied {
                    path: dest,
                    ..Applied::default()
                }
            }
            Change::Copy(c) => {
                let src = normalize_path(&c.src_path)?;
                let dest = normalize_path(&c.dest_path)?;
                let subtree = subtree_size(tree, &src)?;
                check_quota(tree, ctx, missing_ancestors(tree, &dest) + subtree.0)?;
                tree.copy_node(&src, &dest, ctx.timestamp)?;
                tree.with_node_mut(&dest, |node| {
                    node.write_marker = ctx.allocation_root.clone();
                })?;
                Applied {
                    path: dest,
                    size_delta: subtree.1 as i64,
                    gc_candidates: Vec::new(),
                }
            }
            Change::MkDir(c) => {
                let path = normalize_path(&c.path)?;
                check_quota(tree, ctx, nodes_to_create(tree, &path))?;
                tree.mkdirs(&path, ctx.timestamp)?;
                tree.with_node_mut(&path, |node| {
                    node.write_marker = ctx.allocation_root.clone();
                })?;
                Applied {
                    path,
                    ..Applied::default()
                }
            }
            Change::SetAttributes(c) => {
                let path = normalize_path(&c.path)?;
                if !tree.exists(&path) {
                    return Err(TreeError::NotFound(path).into());
                }
                tree.with_node_mut(&path, |node| {
                    node.attributes = c.attributes.clone();
                    node.write_marker = ctx.allocation_root.clone();
                    node.updated_at = ctx.timestamp;
                })?;
                Applied {
                    path,
                    ..Applied::default()
                }
            }
        };
        debug!(
            connection_id = %ctx.connection_id,
            operation = self.operation().as_str(),
            path = %applied.path,
            size_delta = applied.size_delta,
            "Applied change"
        );
        Ok(applied)
    }

    /// Promote staged content for this change. Insert/Update verify and
    /// commit their blobs; Move re-keys staged content under the new path
    /// hash; the rest are metadata-only.
    pub fn commit_to_store(
        &self,
        store: &FileStore,
        allocation_id: &str,
        connection_id: &str,
    ) -> Result<(), BlobberError> {
        match self {
            Change::Insert(c) | Change::Update(c) => {
                store.commit_write(allocation_id, connection_id, &c.file_meta())?;
                if c.thumbnail_hash != EMPTY_HASH {
                    store.commit_write(allocation_id, connection_id, &c.thumbnail_meta())?;
                }
                Ok(())
            }
            Change::Move(c) => {
                let src_name = base_name(&c.src_path);
                let dst_name = base_name(&c.dest_path);
                store.copy_file(
                    allocation_id,
                    src_name,
                    &c.src_path,
                    dst_name,
                    &c.dest_path,
                )?;
                Ok(())
            }
            Change::Delete(_)
            | Change::Rename(_)
            | Change::Copy(_)
            | Change::MkDir(_)
            | Change::SetAttributes(_) => Ok(()),
        }
    }

    /// Drop any not-yet-committed temp blob this change staged.
    pub fn delete_temp(
        &self,
        store: &FileStore,
        allocation_id: &str,
        connection_id: &str,
    ) -> Result<(), BlobberError> {
        match self {
            Change::Insert(c) | Change::Update(c) => {
                store.delete_temp(allocation_id, connection_id, &c.file_meta())?;
                if c.thumbnail_hash != EMPTY_HASH {
                    store.delete_temp(allocation_id, connection_id, &c.thumbnail_meta())?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Entries this path would add: missing ancestors plus the path itself.
fn nodes_to_create(tree: &RefTree, path: &str) -> u64 {
    missing_ancestors(tree, path) + u64::from(!tree.exists(path))
}

fn missing_ancestors(tree: &RefTree, path: &str) -> u64 {
    ancestors(path)
        .iter()
        .filter(|a| !tree.exists(a))
        .count() as u64
}

/// `(node_count, total_file_bytes)` of the subtree rooted at `path`.
fn subtree_size(tree: &RefTree, path: &str) -> Result<(u64, u64), BlobberError> {
    let root = tree
        .get(path)
        .ok_or_else(|| TreeError::NotFound(path.to_string()))?;
    let mut count = 1u64;
    let mut bytes = if root.kind == NodeKind::File { root.size } else { 0 };
    if root.is_directory() {
        let mut stack = vec![path.to_string()];
        while let Some(dir) = stack.pop() {
            let node = tree
                .get(&dir)
                .ok_or_else(|| TreeError::NotFound(dir.clone()))?;
            for name in &node.children {
                let child_path = crate::tree::node::join_path(&dir, name);
                let child = tree
                    .get(&child_path)
                    .ok_or_else(|| TreeError::NotFound(child_path.clone()))?;
                count += 1;
                if child.kind == NodeKind::File {
                    bytes += child.size;
                } else {
                    stack.push(child_path);
                }
            }
        }
    }
    Ok((count, bytes))
}

fn check_quota(tree: &RefTree, ctx: &ChangeContext, adding: u64) -> Result<(), BlobberError> {
    if ctx.max_alloc_dir_files > 0 && tree.node_count() + adding > ctx.max_alloc_dir_files {
        return Err(TreeError::MaxAllocDirFilesReached {
            limit: ctx.max_alloc_dir_files,
        }
        .into());
    }
    Ok(())
}
