//! Metadata store
//!
//! Persistent rows behind the reference tree: node rows keyed by
//! `allocation:path`, a content reference index keyed by
//! `content_hash:lookup_hash`, per-allocation version rows, and staged
//! change records for crash replay. The sled-backed implementation commits
//! a connection's row changes and the allocation version bump in a single
//! multi-tree transaction, so a crash mid-finalize never publishes a
//! half-applied tree.

use crate::error::MetaError;
use crate::tree::node::{NodeKind, RefNode};
use crate::types::{hash_hex, Hash, Timestamp, EMPTY_HASH};
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError, Transactional};
use std::path::Path;
use tracing::debug;

/// Version row of one allocation, bumped on every finalized connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRow {
    pub version: u64,
    pub root_hash: Hash,
    pub updated_at: Timestamp,
}

/// Storage behind the reference tree and connection replay log.
pub trait MetaStore: Send + Sync {
    /// Insert or overwrite one node row.
    fn save_node(&self, node: &RefNode) -> Result<(), MetaError>;

    /// Remove one node row. Removing an absent row is not an error.
    fn delete_node(&self, allocation_id: &str, path: &str) -> Result<(), MetaError>;

    fn find_by_path(&self, allocation_id: &str, path: &str)
        -> Result<Option<RefNode>, MetaError>;

    /// Immediate children of a directory, in key order.
    fn find_children(&self, allocation_id: &str, dir: &str) -> Result<Vec<RefNode>, MetaError>;

    /// Whether any live row outside `excluded_lookups` still references the
    /// content. Drives the conditional-delete decision during GC.
    fn content_referenced(
        &self,
        content_hash: &Hash,
        excluded_lookups: &[Hash],
    ) -> Result<bool, MetaError>;

    /// Atomically apply one connection's row changes, update the content
    /// index, and bump the allocation version. `superseded` rows stay live
    /// but lose their old content index entries; entries the corresponding
    /// saved row re-declares are reinserted in the same transaction.
    /// Returns the new version.
    fn finalize(
        &self,
        allocation_id: &str,
        allocation_root: Hash,
        ts: Timestamp,
        saved: &[RefNode],
        deleted: &[RefNode],
        superseded: &[RefNode],
    ) -> Result<u64, MetaError>;

    fn allocation(&self, allocation_id: &str) -> Result<Option<AllocationRow>, MetaError>;

    fn allocations(&self) -> Result<Vec<String>, MetaError>;

    /// Committed `(file_count, used_size)` of one allocation.
    fn file_stats(&self, allocation_id: &str) -> Result<(u64, u64), MetaError>;

    /// Persist one serialized change record under `(connection, seq)`.
    fn save_change(&self, connection_id: &str, seq: u32, record: &[u8]) -> Result<(), MetaError>;

    /// Serialized change records of one connection, in seq order.
    fn load_changes(&self, connection_id: &str) -> Result<Vec<Vec<u8>>, MetaError>;

    /// Connections with at least one staged change record.
    fn connections(&self) -> Result<Vec<String>, MetaError>;

    fn delete_connection(&self, connection_id: &str) -> Result<(), MetaError>;
}

fn ref_key(allocation_id: &str, path: &str) -> String {
    format!("{allocation_id}:{path}")
}

fn content_key(content_hash: &Hash, lookup_hash: &Hash) -> String {
    format!("{}:{}", hash_hex(content_hash), hash_hex(lookup_hash))
}

fn change_key(connection_id: &str, seq: u32) -> String {
    format!("{connection_id}:{seq:08}")
}

/// Content hashes a file row contributes to the reference index.
fn content_hashes(node: &RefNode) -> Vec<Hash> {
    let mut hashes = Vec::new();
    if node.kind == NodeKind::File {
        if node.validation_root != EMPTY_HASH {
            hashes.push(node.validation_root);
        }
        if node.thumbnail_hash != EMPTY_HASH {
            hashes.push(node.thumbnail_hash);
        }
    }
    hashes
}

/// Sled-backed metadata store.
pub struct SledMetaStore {
    refs: sled::Tree,
    contents: sled::Tree,
    allocs: sled::Tree,
    changes: sled::Tree,
    db: sled::Db,
}

impl SledMetaStore {
    pub fn open(path: &Path) -> Result<Self, MetaError> {
        Self::from_db(sled::open(path)?)
    }

    /// In-memory store for tests; nothing touches disk.
    pub fn temporary() -> Result<Self, MetaError> {
        Self::from_db(sled::Config::new().temporary(true).open()?)
    }

    fn from_db(db: sled::Db) -> Result<Self, MetaError> {
        Ok(Self {
            refs: db.open_tree("refs")?,
            contents: db.open_tree("contents")?,
            allocs: db.open_tree("allocs")?,
            changes: db.open_tree("changes")?,
            db,
        })
    }

    pub fn flush(&self) -> Result<(), MetaError> {
        self.db.flush()?;
        Ok(())
    }

    fn decode(bytes: &[u8]) -> Result<RefNode, MetaError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

impl MetaStore for SledMetaStore {
    fn save_node(&self, node: &RefNode) -> Result<(), MetaError> {
        let bytes = bincode::serialize(node)?;
        self.refs
            .insert(ref_key(&node.allocation_id, &node.path).as_bytes(), bytes)?;
        Ok(())
    }

    fn delete_node(&self, allocation_id: &str, path: &str) -> Result<(), MetaError> {
        self.refs.remove(ref_key(allocation_id, path).as_bytes())?;
        Ok(())
    }

    fn find_by_path(
        &self,
        allocation_id: &str,
        path: &str,
    ) -> Result<Option<RefNode>, MetaError> {
        match self.refs.get(ref_key(allocation_id, path).as_bytes())? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn find_children(&self, allocation_id: &str, dir: &str) -> Result<Vec<RefNode>, MetaError> {
        // The prefix scan also matches deeper descendants and name-prefix
        // siblings ("/a" vs "/ab"); the parent_path check filters both.
        let prefix = ref_key(allocation_id, dir);
        let mut children = Vec::new();
        for item in self.refs.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let node = Self::decode(&bytes)?;
            if node.parent_path == dir {
                children.push(node);
            }
        }
        Ok(children)
    }

    fn content_referenced(
        &self,
        content_hash: &Hash,
        excluded_lookups: &[Hash],
    ) -> Result<bool, MetaError> {
        let prefix = format!("{}:", hash_hex(content_hash));
        for item in self.contents.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            let Some(lookup_hex) = key.split(':').nth(1) else {
                continue;
            };
            let mut lookup = EMPTY_HASH;
            if hex::decode_to_slice(lookup_hex, &mut lookup).is_err() {
                continue;
            }
            if !excluded_lookups.contains(&lookup) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn finalize(
        &self,
        allocation_id: &str,
        allocation_root: Hash,
        ts: Timestamp,
        saved: &[RefNode],
        deleted: &[RefNode],
        superseded: &[RefNode],
    ) -> Result<u64, MetaError> {
        let result = (&self.refs, &self.contents, &self.allocs).transaction(
            |(refs, contents, allocs)| {
                for node in deleted {
                    refs.remove(ref_key(&node.allocation_id, &node.path).as_bytes())?;
                    for hash in content_hashes(node) {
                        contents.remove(content_key(&hash, &node.lookup_hash).as_bytes())?;
                    }
                }
                // Removals run before the saved-row insertions so an updated
                // row that keeps a hash ends up indexed, not dropped.
                for node in superseded {
                    for hash in content_hashes(node) {
                        contents.remove(content_key(&hash, &node.lookup_hash).as_bytes())?;
                    }
                }
                for node in saved {
                    let bytes = bincode::serialize(node)
                        .map_err(|e| ConflictableTransactionError::Abort(MetaError::Decode(e)))?;
                    refs.insert(ref_key(&node.allocation_id, &node.path).as_bytes(), bytes)?;
                    for hash in content_hashes(node) {
                        contents.insert(
                            content_key(&hash, &node.lookup_hash).as_bytes(),
                            node.allocation_id.as_bytes(),
                        )?;
                    }
                }

                let version = match allocs.get(allocation_id.as_bytes())? {
                    Some(bytes) => {
                        let row: AllocationRow = bincode::deserialize(&bytes).map_err(|e| {
                            ConflictableTransactionError::Abort(MetaError::Decode(e))
                        })?;
                        row.version + 1
                    }
                    None => 1,
                };
                let row = AllocationRow {
                    version,
                    root_hash: allocation_root,
                    updated_at: ts,
                };
                let bytes = bincode::serialize(&row)
                    .map_err(|e| ConflictableTransactionError::Abort(MetaError::Decode(e)))?;
                allocs.insert(allocation_id.as_bytes(), bytes)?;
                Ok(version)
            },
        );

        let version = result.map_err(|e| match e {
            TransactionError::Abort(inner) => inner,
            TransactionError::Storage(e) => MetaError::Sled(e),
        })?;
        debug!(
            allocation_id = %allocation_id,
            version,
            root_hash = %hash_hex(&allocation_root),
            saved = saved.len(),
            deleted = deleted.len(),
            superseded = superseded.len(),
            "Finalized allocation metadata"
        );
        Ok(version)
    }

    fn allocation(&self, allocation_id: &str) -> Result<Option<AllocationRow>, MetaError> {
        match self.allocs.get(allocation_id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn allocations(&self) -> Result<Vec<String>, MetaError> {
        let mut out = Vec::new();
        for item in self.allocs.iter() {
            let (key, _) = item?;
            out.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(out)
    }

    fn file_stats(&self, allocation_id: &str) -> Result<(u64, u64), MetaError> {
        let prefix = format!("{allocation_id}:");
        let mut count = 0u64;
        let mut size = 0u64;
        for item in self.refs.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            let node = Self::decode(&bytes)?;
            if node.kind == NodeKind::File {
                count += 1;
                size += node.size;
            }
        }
        Ok((count, size))
    }

    fn save_change(&self, connection_id: &str, seq: u32, record: &[u8]) -> Result<(), MetaError> {
        self.changes
            .insert(change_key(connection_id, seq).as_bytes(), record)?;
        Ok(())
    }

    fn load_changes(&self, connection_id: &str) -> Result<Vec<Vec<u8>>, MetaError> {
        let prefix = format!("{connection_id}:");
        let mut records = Vec::new();
        for item in self.changes.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            records.push(bytes.to_vec());
        }
        Ok(records)
    }

    fn connections(&self) -> Result<Vec<String>, MetaError> {
        let mut out = Vec::new();
        for item in self.changes.iter() {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key);
            if let Some(conn) = key.rsplit_once(':').map(|(c, _)| c.to_string()) {
                if out.last() != Some(&conn) {
                    out.push(conn);
                }
            }
        }
        out.dedup();
        Ok(out)
    }

    fn delete_connection(&self, connection_id: &str) -> Result<(), MetaError> {
        let prefix = format!("{connection_id}:");
        let keys: Vec<_> = self
            .changes
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.changes.remove(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sha3_256;

    fn store() -> SledMetaStore {
        SledMetaStore::temporary().unwrap()
    }

    fn file_row(alloc: &str, path: &str, size: u64) -> RefNode {
        let mut node = RefNode::new_file(alloc, path, 1);
        node.size = size;
        node.validation_root = sha3_256(path.as_bytes());
        node
    }

    #[test]
    fn node_rows_round_trip() {
        let meta = store();
        let node = file_row("alloc", "/a/f.txt", 42);
        meta.save_node(&node).unwrap();
        let loaded = meta.find_by_path("alloc", "/a/f.txt").unwrap().unwrap();
        assert_eq!(loaded, node);

        meta.delete_node("alloc", "/a/f.txt").unwrap();
        assert!(meta.find_by_path("alloc", "/a/f.txt").unwrap().is_none());
    }

    #[test]
    fn find_children_excludes_descendants_and_prefix_siblings() {
        let meta = store();
        meta.save_node(&RefNode::new_directory("alloc", "/a", 1))
            .unwrap();
        meta.save_node(&file_row("alloc", "/a/one", 1)).unwrap();
        meta.save_node(&file_row("alloc", "/a/sub", 1)).unwrap();
        meta.save_node(&file_row("alloc", "/a/sub2/deep", 1)).unwrap();
        meta.save_node(&file_row("alloc", "/ab", 1)).unwrap();

        let names: Vec<String> = meta
            .find_children("alloc", "/a")
            .unwrap()
            .into_iter()
            .map(|n| n.name)
            .collect();
        assert_eq!(names, vec!["one", "sub"]);
    }

    #[test]
    fn finalize_bumps_version_and_indexes_content() {
        let meta = store();
        let node = file_row("alloc", "/f", 10);
        let root = sha3_256(b"root-1");

        let v1 = meta
            .finalize("alloc", root, 100, &[node.clone()], &[], &[])
            .unwrap();
        assert_eq!(v1, 1);
        assert!(meta
            .content_referenced(&node.validation_root, &[])
            .unwrap());

        let row = meta.allocation("alloc").unwrap().unwrap();
        assert_eq!(row.version, 1);
        assert_eq!(row.root_hash, root);

        let v2 = meta
            .finalize("alloc", root, 101, &[], &[node.clone()], &[])
            .unwrap();
        assert_eq!(v2, 2);
        assert!(!meta
            .content_referenced(&node.validation_root, &[])
            .unwrap());
        assert!(meta.find_by_path("alloc", "/f").unwrap().is_none());
    }

    #[test]
    fn superseded_rows_lose_their_old_index_entries() {
        let meta = store();
        let old = file_row("alloc", "/f", 10);
        meta.finalize("alloc", EMPTY_HASH, 1, &[old.clone()], &[], &[])
            .unwrap();

        let mut new = old.clone();
        new.validation_root = sha3_256(b"replacement content");
        meta.finalize("alloc", EMPTY_HASH, 2, &[new.clone()], &[], &[old.clone()])
            .unwrap();

        assert!(!meta.content_referenced(&old.validation_root, &[]).unwrap());
        assert!(meta.content_referenced(&new.validation_root, &[]).unwrap());

        // Re-declaring the same hash keeps it indexed.
        let same = new.clone();
        meta.finalize("alloc", EMPTY_HASH, 3, &[same.clone()], &[], &[new.clone()])
            .unwrap();
        assert!(meta.content_referenced(&new.validation_root, &[]).unwrap());
    }

    #[test]
    fn content_reference_check_honors_exclusions() {
        let meta = store();
        let a = file_row("alloc", "/a", 1);
        let mut b = file_row("alloc", "/b", 1);
        b.validation_root = a.validation_root;
        b.lookup_hash = crate::types::lookup_hash("alloc", "/b");
        meta.finalize("alloc", EMPTY_HASH, 1, &[a.clone(), b.clone()], &[], &[])
            .unwrap();

        // Excluding one lookup still leaves the other reference live.
        assert!(meta
            .content_referenced(&a.validation_root, &[a.lookup_hash])
            .unwrap());
        assert!(!meta
            .content_referenced(&a.validation_root, &[a.lookup_hash, b.lookup_hash])
            .unwrap());
    }

    #[test]
    fn file_stats_counts_files_only() {
        let meta = store();
        meta.save_node(&RefNode::new_directory("alloc", "/d", 1))
            .unwrap();
        meta.save_node(&file_row("alloc", "/d/a", 10)).unwrap();
        meta.save_node(&file_row("alloc", "/d/b", 20)).unwrap();
        assert_eq!(meta.file_stats("alloc").unwrap(), (2, 30));
    }

    #[test]
    fn change_records_replay_in_seq_order() {
        let meta = store();
        meta.save_change("conn", 2, b"second").unwrap();
        meta.save_change("conn", 0, b"zeroth").unwrap();
        meta.save_change("conn", 1, b"first").unwrap();
        meta.save_change("other", 0, b"x").unwrap();

        let records = meta.load_changes("conn").unwrap();
        assert_eq!(records, vec![b"zeroth".to_vec(), b"first".to_vec(), b"second".to_vec()]);

        assert_eq!(meta.connections().unwrap(), vec!["conn", "other"]);

        meta.delete_connection("conn").unwrap();
        assert!(meta.load_changes("conn").unwrap().is_empty());
        assert_eq!(meta.connections().unwrap(), vec!["other"]);
    }
}
