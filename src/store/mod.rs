//! Content Store
//!
//! Sharded, content-addressed blob storage with a staged write lifecycle:
//! a write lands in a private temp blob, `commit_write` verifies it against
//! the client-declared Merkle roots while staging it at the precommit slot,
//! and a verified blob is promoted under the content lock to its immutable
//! final location. Transitions are one-directional; a blob never returns
//! from final to precommit.
//!
//! Final blobs carry their proof material inline:
//! `[fixed-Merkle node region][u32 validation node count][validation node
//! region][raw content]`, so reads seek straight to content and proofs never
//! rehash bytes.

pub mod lock;
pub mod paths;
pub mod usage;

use crate::error::{BlobberError, StoreError};
use crate::hasher::{
    self, fixed_merkle, validation, CommitHasher, FIXED_NODES_SIZE, LEAF_SIZE,
};
use crate::types::{hash_hex, sha3_256, Hash};
use lock::ContentLockPool;
use paths::{StorePaths, THUMBNAIL_SUFFIX};
use sha3::{Digest, Sha3_256};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use usage::UsageMap;

/// What the caller declares about the file being committed.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub chunk_size: usize,
    pub fixed_merkle_root: Hash,
    pub validation_root: Hash,
    /// Write targets the thumbnail stream instead of the main content.
    pub is_thumbnail: bool,
    /// Declared thumbnail content hash; checked on thumbnail commits.
    pub thumbnail_hash: Hash,
}

/// Result of a successful commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitOutcome {
    /// Content already existed at the final location; the staged copy was
    /// discarded rather than promoted.
    pub deduplicated: bool,
}

/// One 64 KiB leaf proof returned by a verified block read.
#[derive(Debug, Clone)]
pub struct BlockProof {
    pub leaf_index: usize,
    pub siblings: Vec<Hash>,
}

/// A ranged block read, optionally with per-leaf proofs.
#[derive(Debug, Clone)]
pub struct FileBlock {
    pub data: Vec<u8>,
    pub proofs: Option<Vec<BlockProof>>,
}

/// The challenge primitive: one leaf's bytes plus its sibling chain.
#[derive(Debug, Clone)]
pub struct ChallengeProof {
    pub proof: Vec<Hash>,
    pub data: Vec<u8>,
    pub leaf_index: usize,
}

/// The physical blob store for all allocations under one base directory.
pub struct FileStore {
    paths: StorePaths,
    locks: ContentLockPool,
    usage: UsageMap,
}

impl FileStore {
    pub fn new(paths: StorePaths) -> Result<Self, BlobberError> {
        fs::create_dir_all(paths.base()).map_err(|e| StoreError::DirCreation {
            path: paths.base().to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            paths,
            locks: ContentLockPool::new(),
            usage: UsageMap::new(),
        })
    }

    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    pub fn usage(&self) -> &UsageMap {
        &self.usage
    }

    fn blob_name(meta: &FileMeta) -> String {
        if meta.is_thumbnail {
            format!("{}{}", meta.name, THUMBNAIL_SUFFIX)
        } else {
            meta.name.clone()
        }
    }

    fn temp_path(&self, allocation_id: &str, connection_id: &str, meta: &FileMeta) -> PathBuf {
        self.paths
            .temp_path(allocation_id, connection_id, &Self::blob_name(meta), &meta.path)
    }

    /// Append/overwrite bytes at `offset` in the temp blob for
    /// `(connection, path)`, creating it if absent. Returns the bytes
    /// written. Each temp blob is private to its key, so a failure here can
    /// not corrupt any other blob.
    pub fn write_chunk(
        &self,
        allocation_id: &str,
        connection_id: &str,
        meta: &FileMeta,
        offset: u64,
        data: &[u8],
    ) -> Result<u64, BlobberError> {
        let path = self.temp_path(allocation_id, connection_id, meta);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::DirCreation {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .map_err(|e| StoreError::FileOpen {
                path: path.clone(),
                source: e,
            })?;
        let prior_len = file
            .metadata()
            .map_err(|e| StoreError::FileStat {
                path: path.clone(),
                source: e,
            })?
            .len();
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| StoreError::FileSeek {
                path: path.clone(),
                source: e,
            })?;
        file.write_all(data).map_err(StoreError::Io)?;

        let new_len = prior_len.max(offset + data.len() as u64);
        self.usage
            .add_temp(allocation_id, new_len as i64 - prior_len as i64);
        debug!(
            allocation_id,
            connection_id,
            path = %meta.path,
            offset,
            len = data.len(),
            "Wrote chunk to temp blob"
        );
        Ok(data.len() as u64)
    }

    /// Current size of the temp blob, for the caller's quota checks.
    pub fn temp_size(
        &self,
        allocation_id: &str,
        connection_id: &str,
        meta: &FileMeta,
    ) -> Result<u64, BlobberError> {
        let path = self.temp_path(allocation_id, connection_id, meta);
        let stat = fs::metadata(&path).map_err(|e| StoreError::FileStat {
            path: path.clone(),
            source: e,
        })?;
        Ok(stat.len())
    }

    /// Verify and promote one staged write: temp → precommit → final.
    ///
    /// On an integrity mismatch the temp blob is left intact for retry and
    /// nothing is promoted. On success the content sits at its sharded
    /// final location (or already did, for duplicate content), the usage
    /// accumulators are bumped, and the temp blob is gone.
    pub fn commit_write(
        &self,
        allocation_id: &str,
        connection_id: &str,
        meta: &FileMeta,
    ) -> Result<CommitOutcome, BlobberError> {
        let temp = self.temp_path(allocation_id, connection_id, meta);
        if !temp.exists() {
            return Err(StoreError::MissingTempBlob {
                path: meta.path.clone(),
            }
            .into());
        }

        let blob_name = Self::blob_name(meta);
        let precommit = self
            .paths
            .precommit_path(allocation_id, &blob_name, &meta.path);
        let backup = self.paths.backup_path(allocation_id, &blob_name, &meta.path);

        // An in-flight overwrite of the same logical path keeps its previous
        // staged version in the backup slot so the operation stays
        // reversible.
        if precommit.exists() {
            fs::rename(&precommit, &backup).map_err(StoreError::Io)?;
        }

        let staged = self.stage_and_verify(&temp, &precommit, meta);
        let content_hash = match staged {
            Ok(hash) => hash,
            Err(e) => {
                let _ = fs::remove_file(&precommit);
                if backup.exists() {
                    let _ = fs::rename(&backup, &precommit);
                }
                warn!(
                    allocation_id,
                    connection_id,
                    path = %meta.path,
                    error = %e,
                    "Commit verification failed; temp blob retained"
                );
                return Err(e);
            }
        };

        {
            let _guard = self.locks.acquire(allocation_id, &content_hash);
            let final_path = self.paths.final_path(allocation_id, &hash_hex(&content_hash));
            if let Some(parent) = final_path.parent() {
                fs::create_dir_all(parent).map_err(|e| StoreError::DirCreation {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
            let deduplicated = final_path.exists();
            if deduplicated {
                // Identical content is already canonical; one physical blob
                // serves every reference.
                fs::remove_file(&precommit).map_err(StoreError::Io)?;
            } else {
                fs::rename(&precommit, &final_path).map_err(StoreError::Io)?;
            }
            // Thumbnail streams ride along with a file reference; only the
            // content commit counts toward the accumulators.
            if !meta.is_thumbnail {
                self.usage.add_file(allocation_id, meta.size);
            }

            if backup.exists() {
                let _ = fs::remove_file(&backup);
            }
            let temp_len = fs::metadata(&temp).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&temp).map_err(StoreError::Io)?;
            self.usage.add_temp(allocation_id, -(temp_len as i64));

            info!(
                allocation_id,
                connection_id,
                path = %meta.path,
                content_hash = %hash_hex(&content_hash),
                deduplicated,
                "Committed content blob"
            );
            Ok(CommitOutcome { deduplicated })
        }
    }

    /// Stream the temp blob into the precommit slot while hashing, write the
    /// header regions, and verify the declared roots. Returns the content
    /// hash the final location is keyed by.
    fn stage_and_verify(
        &self,
        temp: &Path,
        precommit: &Path,
        meta: &FileMeta,
    ) -> Result<Hash, BlobberError> {
        let mut src = File::open(temp).map_err(|e| StoreError::FileOpen {
            path: temp.to_path_buf(),
            source: e,
        })?;
        let temp_len = src
            .metadata()
            .map_err(|e| StoreError::FileStat {
                path: temp.to_path_buf(),
                source: e,
            })?
            .len();
        if temp_len != meta.size {
            return Err(StoreError::SizeMismatch {
                declared: meta.size,
                staged: temp_len,
            }
            .into());
        }

        if let Some(parent) = precommit.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::DirCreation {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let mut dst = File::create(precommit).map_err(|e| StoreError::FileOpen {
            path: precommit.to_path_buf(),
            source: e,
        })?;

        if meta.is_thumbnail {
            // Thumbnails carry no proof trees: raw bytes verified against
            // the declared content hash.
            let mut hasher = Sha3_256::new();
            copy_through(&mut src, &mut dst, |chunk| {
                hasher.update(chunk);
                Ok(())
            })?;
            let computed: Hash = hasher.finalize().into();
            if computed != meta.thumbnail_hash {
                return Err(StoreError::HashMismatch {
                    declared: hash_hex(&meta.thumbnail_hash),
                    computed: hash_hex(&computed),
                }
                .into());
            }
            dst.sync_all().map_err(StoreError::Io)?;
            return Ok(computed);
        }

        let header = header_size(meta.size, meta.chunk_size);
        dst.seek(SeekFrom::Start(header))
            .map_err(|e| StoreError::FileSeek {
                path: precommit.to_path_buf(),
                source: e,
            })?;

        let mut hashers = CommitHasher::new(meta.chunk_size);
        copy_through(&mut src, &mut dst, |chunk| hashers.write_all(chunk))?;
        let (fixed_nodes, validation_nodes) = hashers.finish();

        let computed_fixed = fixed_nodes.root();
        if computed_fixed != meta.fixed_merkle_root {
            return Err(StoreError::FixedMerkleRootMismatch {
                declared: hash_hex(&meta.fixed_merkle_root),
                computed: hash_hex(&computed_fixed),
            }
            .into());
        }
        let computed_validation = validation_nodes.root();
        if computed_validation != meta.validation_root {
            return Err(StoreError::ValidationRootMismatch {
                declared: hash_hex(&meta.validation_root),
                computed: hash_hex(&computed_validation),
            }
            .into());
        }

        dst.seek(SeekFrom::Start(0))
            .map_err(|e| StoreError::FileSeek {
                path: precommit.to_path_buf(),
                source: e,
            })?;
        fixed_nodes.write_to(&mut dst).map_err(StoreError::Io)?;
        dst.write_all(&(validation_nodes.stored_len() as u32).to_le_bytes())
            .map_err(StoreError::Io)?;
        validation_nodes.write_to(&mut dst).map_err(StoreError::Io)?;
        dst.sync_all().map_err(StoreError::Io)?;

        Ok(computed_validation)
    }

    /// Conditionally delete a final blob. The deleted file reference always
    /// comes off the accumulators; the physical delete happens only when the
    /// content is unreferenced and no concurrent operation holds its lock.
    /// Returns whether bytes were removed.
    pub fn delete_file<F>(
        &self,
        allocation_id: &str,
        content_hash: &Hash,
        size: u64,
        is_referenced: F,
    ) -> Result<bool, BlobberError>
    where
        F: FnOnce() -> Result<bool, BlobberError>,
    {
        self.usage.remove_file(allocation_id, size);
        self.gc_blob(allocation_id, content_hash, is_referenced)
    }

    /// Physical half of `delete_file`, also used for auxiliary streams
    /// (thumbnails) that do not count as file references. The
    /// referenced-ness check runs under the content lock so check-and-delete
    /// is one guarded step. When another operation on the same content is
    /// already in flight (`not_new_lock`), the physical delete is skipped.
    pub fn gc_blob<F>(
        &self,
        allocation_id: &str,
        content_hash: &Hash,
        is_referenced: F,
    ) -> Result<bool, BlobberError>
    where
        F: FnOnce() -> Result<bool, BlobberError>,
    {
        let Some(_guard) = self.locks.try_acquire(allocation_id, content_hash) else {
            debug!(
                allocation_id,
                content_hash = %hash_hex(content_hash),
                "not_new_lock: concurrent content operation, skipping physical delete"
            );
            return Ok(false);
        };

        if is_referenced()? {
            return Ok(false);
        }

        let final_path = self.paths.final_path(allocation_id, &hash_hex(content_hash));
        let removed = if final_path.exists() {
            fs::remove_file(&final_path).map_err(StoreError::Io)?;
            true
        } else {
            false
        };
        if removed {
            info!(
                allocation_id,
                content_hash = %hash_hex(content_hash),
                "Deleted unreferenced content blob"
            );
        }
        Ok(removed)
    }

    /// Random-access read of 64 KiB blocks `[start_block,
    /// start_block+num_blocks)`, with an optional Merkle proof per leaf.
    pub fn get_file_block(
        &self,
        allocation_id: &str,
        content_hash: &Hash,
        file_size: u64,
        start_block: usize,
        num_blocks: usize,
        verify: bool,
    ) -> Result<FileBlock, BlobberError> {
        let total_blocks = block_count(file_size);
        if num_blocks == 0 || start_block + num_blocks > total_blocks {
            return Err(StoreError::BlockOutOfRange {
                start: start_block,
                end: start_block + num_blocks,
                blocks: total_blocks,
            }
            .into());
        }

        let mut file = self.open_final(allocation_id, content_hash)?;
        let content_offset = read_content_offset(&mut file)?;

        let read_start = (start_block * LEAF_SIZE) as u64;
        let read_len = ((num_blocks * LEAF_SIZE) as u64).min(file_size - read_start);
        let mut data = vec![0u8; read_len as usize];
        file.seek(SeekFrom::Start(content_offset + read_start))
            .map_err(StoreError::Io)?;
        file.read_exact(&mut data).map_err(StoreError::Io)?;

        let proofs = if verify {
            let mut proofs = Vec::with_capacity(num_blocks);
            for leaf_index in start_block..start_block + num_blocks {
                proofs.push(BlockProof {
                    leaf_index,
                    siblings: fixed_merkle::stored_proof(&mut file, 0, leaf_index)?,
                });
            }
            Some(proofs)
        } else {
            None
        };

        Ok(FileBlock { data, proofs })
    }

    /// The challenge primitive: leaf bytes, sibling chain, and leaf index
    /// for one block offset of the fixed Merkle tree.
    pub fn get_challenge_proof(
        &self,
        allocation_id: &str,
        content_hash: &Hash,
        block_offset: usize,
        file_size: u64,
    ) -> Result<ChallengeProof, BlobberError> {
        let total_blocks = block_count(file_size);
        if block_offset >= total_blocks {
            return Err(StoreError::BlockOutOfRange {
                start: block_offset,
                end: block_offset + 1,
                blocks: total_blocks,
            }
            .into());
        }

        let mut file = self.open_final(allocation_id, content_hash)?;
        let content_offset = read_content_offset(&mut file)?;

        let read_start = (block_offset * LEAF_SIZE) as u64;
        let read_len = (LEAF_SIZE as u64).min(file_size - read_start);
        let mut data = vec![0u8; read_len as usize];
        file.seek(SeekFrom::Start(content_offset + read_start))
            .map_err(StoreError::Io)?;
        file.read_exact(&mut data).map_err(StoreError::Io)?;

        let proof = fixed_merkle::stored_proof(&mut file, 0, block_offset)?;
        Ok(ChallengeProof {
            proof,
            data,
            leaf_index: block_offset,
        })
    }

    /// Multi-index validation proof for stored nodes `[start, end)`, used by
    /// ranged-read verification.
    ///
    /// Indices address the stored validation level. That level equals the
    /// chunk leaves only while the file has at most
    /// [`MAX_VALIDATION_LEAVES`](crate::hasher::MAX_VALIDATION_LEAVES)
    /// chunks; beyond that the stored level is pairwise-merged and each
    /// stored node covers several chunks, so callers must translate chunk
    /// ranges accordingly.
    pub fn get_validation_range_proof(
        &self,
        allocation_id: &str,
        content_hash: &Hash,
        start: usize,
        end: usize,
    ) -> Result<validation::RangeProof, BlobberError> {
        let mut file = self.open_final(allocation_id, content_hash)?;
        let total = read_validation_count(&mut file)?;
        Ok(validation::stored_range_proof(
            &mut file,
            FIXED_NODES_SIZE + 4,
            total,
            start,
            end,
        )?)
    }

    /// Duplicate a staged (precommit) blob under a new `(name, path)` key.
    /// Used by move/copy when content has not reached its content-addressed
    /// final home yet. Returns whether a staged blob existed.
    pub fn copy_file(
        &self,
        allocation_id: &str,
        src_name: &str,
        src_path: &str,
        dst_name: &str,
        dst_path: &str,
    ) -> Result<bool, BlobberError> {
        let src = self.paths.precommit_path(allocation_id, src_name, src_path);
        if !src.exists() {
            return Ok(false);
        }
        let dst = self.paths.precommit_path(allocation_id, dst_name, dst_path);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::DirCreation {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        fs::copy(&src, &dst).map_err(StoreError::Io)?;
        Ok(true)
    }

    /// Remove one temp blob (failure cleanup). Missing blobs are fine.
    pub fn delete_temp(
        &self,
        allocation_id: &str,
        connection_id: &str,
        meta: &FileMeta,
    ) -> Result<(), BlobberError> {
        let path = self.temp_path(allocation_id, connection_id, meta);
        if path.exists() {
            let len = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            fs::remove_file(&path).map_err(StoreError::Io)?;
            self.usage.add_temp(allocation_id, -(len as i64));
        }
        Ok(())
    }

    /// Discard a connection's whole temp directory. Idempotent.
    pub fn delete_temp_dir(
        &self,
        allocation_id: &str,
        connection_id: &str,
    ) -> Result<(), BlobberError> {
        let dir = self.paths.temp_dir(allocation_id, connection_id);
        if dir.exists() {
            let mut reclaimed = 0u64;
            for entry in walkdir::WalkDir::new(&dir).into_iter().filter_map(|e| e.ok()) {
                if entry.file_type().is_file() {
                    reclaimed += entry.metadata().map(|m| m.len()).unwrap_or(0);
                }
            }
            fs::remove_dir_all(&dir).map_err(StoreError::Io)?;
            self.usage.add_temp(allocation_id, -(reclaimed as i64));
        }
        Ok(())
    }

    /// Discard every staged precommit blob of an allocation (version
    /// rollback). Idempotent and re-runnable after a crash.
    pub fn delete_precommit_dir(&self, allocation_id: &str) -> Result<(), BlobberError> {
        let dir = self.paths.precommit_dir(allocation_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(StoreError::Io)?;
        }
        Ok(())
    }

    fn open_final(&self, allocation_id: &str, content_hash: &Hash) -> Result<File, BlobberError> {
        let path = self.paths.final_path(allocation_id, &hash_hex(content_hash));
        if !path.exists() {
            return Err(StoreError::MissingBlob {
                hash: hash_hex(content_hash),
            }
            .into());
        }
        Ok(File::open(&path).map_err(|e| StoreError::FileOpen {
            path,
            source: e,
        })?)
    }
}

/// Number of 64 KiB blocks covering `file_size` bytes.
pub fn block_count(file_size: u64) -> usize {
    file_size.div_ceil(LEAF_SIZE as u64) as usize
}

/// Total header bytes preceding content for a regular blob.
pub fn header_size(file_size: u64, chunk_size: usize) -> u64 {
    FIXED_NODES_SIZE + 4 + hasher::validation::validation_nodes_size(file_size, chunk_size)
}

/// Read the stored validation node count; leaves the cursor unspecified.
fn read_validation_count(file: &mut File) -> Result<usize, StoreError> {
    file.seek(SeekFrom::Start(FIXED_NODES_SIZE))?;
    let mut count = [0u8; 4];
    file.read_exact(&mut count)?;
    Ok(u32::from_le_bytes(count) as usize)
}

/// Byte offset where raw content begins in a stored blob.
fn read_content_offset(file: &mut File) -> Result<u64, StoreError> {
    let count = read_validation_count(file)?;
    Ok(FIXED_NODES_SIZE + 4 + (count as u64) * 32)
}

/// Stream `src` into `dst` while observing every chunk. The observer may
/// fail (e.g. a file exceeding the fixed tree capacity).
fn copy_through<F>(src: &mut File, dst: &mut File, mut observe: F) -> Result<u64, StoreError>
where
    F: FnMut(&[u8]) -> std::io::Result<()>,
{
    let mut buf = vec![0u8; LEAF_SIZE];
    let mut copied = 0u64;
    loop {
        let read = src.read(&mut buf)?;
        if read == 0 {
            break;
        }
        dst.write_all(&buf[..read])?;
        observe(&buf[..read])?;
        copied += read as u64;
    }
    Ok(copied)
}

/// Compute the roots a well-behaved client would declare for `data`.
/// Shared by tests and tooling.
pub fn declared_roots(data: &[u8], chunk_size: usize) -> (Hash, Hash) {
    let mut hasher = CommitHasher::new(chunk_size);
    hasher.write_all(data).expect("in-memory hashing");
    let (fixed, validation) = hasher.finish();
    (fixed.root(), validation.root())
}

/// Content hash of a thumbnail stream.
pub fn thumbnail_hash(data: &[u8]) -> Hash {
    sha3_256(data)
}
