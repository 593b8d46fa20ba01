//! Sharded on-disk layout.
//!
//! Everything under one base directory: each allocation gets a shard
//! directory derived from its id, holding `tmp/` (per-connection mutable
//! blobs), `precommit/` (staged final candidates), and `files/` (immutable
//! content addressed by its validation root).

use crate::error::StoreError;
use crate::types::{hash_hex, lookup_hash};
use std::path::{Path, PathBuf};

pub const TMP_DIR: &str = "tmp";
pub const PRECOMMIT_DIR: &str = "precommit";
pub const FILES_DIR: &str = "files";

/// Suffix of the backup slot holding a previous precommit version during an
/// overwrite.
pub const BACKUP_SUFFIX: &str = ".bak";

/// Suffix distinguishing a thumbnail blob from the main content stream.
pub const THUMBNAIL_SUFFIX: &str = ".thumb";

/// Split a hex hash into shard directories per `levels`, with the remainder
/// as the final component. `[2, 2, 1]` turns `4c9bad...` into
/// `4c/9b/a/d...`. Deterministic: identical `(hash, levels)` always yields
/// the identical path.
pub fn partial_path(hash: &str, levels: &[usize]) -> PathBuf {
    let mut path = PathBuf::new();
    let mut offset = 0;
    for &level in levels {
        if offset + level >= hash.len() {
            break;
        }
        path.push(&hash[offset..offset + level]);
        offset += level;
    }
    path.push(&hash[offset..]);
    path
}

/// Path builder for one store root.
#[derive(Debug, Clone)]
pub struct StorePaths {
    base: PathBuf,
    alloc_levels: Vec<usize>,
    file_levels: Vec<usize>,
}

impl StorePaths {
    pub fn new(
        base: PathBuf,
        alloc_levels: Vec<usize>,
        file_levels: Vec<usize>,
    ) -> Result<Self, StoreError> {
        for levels in [&alloc_levels, &file_levels] {
            if levels.is_empty() || levels.iter().sum::<usize>() >= 64 {
                return Err(StoreError::InvalidShardLevels {
                    levels: levels.clone(),
                });
            }
        }
        Ok(Self {
            base,
            alloc_levels,
            file_levels,
        })
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Shard directory of one allocation.
    pub fn allocation_dir(&self, allocation_id: &str) -> PathBuf {
        self.base.join(partial_path(allocation_id, &self.alloc_levels))
    }

    /// Per-connection temp directory.
    pub fn temp_dir(&self, allocation_id: &str, connection_id: &str) -> PathBuf {
        self.allocation_dir(allocation_id)
            .join(TMP_DIR)
            .join(connection_id)
    }

    /// Temp blob: keyed by connection, file name, and path hash so each
    /// in-flight write is private to `(connection, path)`.
    pub fn temp_path(
        &self,
        allocation_id: &str,
        connection_id: &str,
        file_name: &str,
        path: &str,
    ) -> PathBuf {
        self.temp_dir(allocation_id, connection_id)
            .join(blob_key(allocation_id, file_name, path))
    }

    pub fn precommit_dir(&self, allocation_id: &str) -> PathBuf {
        self.allocation_dir(allocation_id).join(PRECOMMIT_DIR)
    }

    /// Staged final candidate: keyed by file name and path hash.
    pub fn precommit_path(&self, allocation_id: &str, file_name: &str, path: &str) -> PathBuf {
        self.precommit_dir(allocation_id)
            .join(blob_key(allocation_id, file_name, path))
    }

    /// Backup slot for the previous precommit version of the same key.
    pub fn backup_path(&self, allocation_id: &str, file_name: &str, path: &str) -> PathBuf {
        let mut p = self
            .precommit_path(allocation_id, file_name, path)
            .into_os_string();
        p.push(BACKUP_SUFFIX);
        PathBuf::from(p)
    }

    pub fn files_dir(&self, allocation_id: &str) -> PathBuf {
        self.allocation_dir(allocation_id).join(FILES_DIR)
    }

    /// Final immutable blob location, sharded by content hash.
    pub fn final_path(&self, allocation_id: &str, content_hash_hex: &str) -> PathBuf {
        self.files_dir(allocation_id)
            .join(partial_path(content_hash_hex, &self.file_levels))
    }
}

/// File-name component for path-keyed (temp/precommit) blobs.
fn blob_key(allocation_id: &str, file_name: &str, path: &str) -> String {
    format!(
        "{}.{}",
        file_name,
        hash_hex(&lookup_hash(allocation_id, path))
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_matches_documented_example() {
        let hash = "4c9bad252272bc6e3969be637610d58f3ab2ff8ca336ea2fadd6171fc68fdd56";
        let path = partial_path(hash, &[2, 2, 1]);
        assert_eq!(
            path,
            PathBuf::from("4c/9b/a/d252272bc6e3969be637610d58f3ab2ff8ca336ea2fadd6171fc68fdd56")
        );
    }

    #[test]
    fn partial_path_is_deterministic() {
        let hash = "abcdef0123456789";
        assert_eq!(partial_path(hash, &[2, 1]), partial_path(hash, &[2, 1]));
        assert_ne!(partial_path(hash, &[2, 1]), partial_path(hash, &[3]));
    }

    #[test]
    fn levels_consuming_whole_hash_keep_a_final_component() {
        // Segment that would swallow the remainder stops early.
        let path = partial_path("abcd", &[2, 2]);
        assert_eq!(path, PathBuf::from("ab/cd"));
    }

    #[test]
    fn shard_levels_are_validated() {
        assert!(StorePaths::new(PathBuf::from("/s"), vec![2, 1], vec![64]).is_err());
        assert!(StorePaths::new(PathBuf::from("/s"), vec![], vec![2]).is_err());
        assert!(StorePaths::new(PathBuf::from("/s"), vec![2, 1], vec![2, 2, 1]).is_ok());
    }

    #[test]
    fn temp_and_precommit_keys_differ_by_path() {
        let paths =
            StorePaths::new(PathBuf::from("/s"), vec![2, 1], vec![2, 2, 1]).unwrap();
        let a = paths.temp_path("a1b2c3", "conn-1", "f.txt", "/x/f.txt");
        let b = paths.temp_path("a1b2c3", "conn-1", "f.txt", "/y/f.txt");
        assert_ne!(a, b);
        assert!(a.starts_with(paths.temp_dir("a1b2c3", "conn-1")));
    }

    #[test]
    fn final_path_is_content_addressed() {
        let paths =
            StorePaths::new(PathBuf::from("/s"), vec![2, 1], vec![2, 2, 1]).unwrap();
        let hex = "4c9bad252272bc6e3969be637610d58f3ab2ff8ca336ea2fadd6171fc68fdd56";
        let p = paths.final_path("a1b2c3", hex);
        assert!(p.starts_with("/s/a1/b/2c3/files/4c/9b/a"));
    }
}
