//! Fixed Merkle tree: the whole-file proof tree over 64 KiB leaves.
//!
//! The tree always has [`FIXED_LEAVES`] leaves; bytes fill leaves in order
//! and unpopulated leaves hash empty input, so the root is defined for any
//! file size up to the leaf capacity and the stored node region has constant
//! size. Node hashes are persisted level by level (leaves first) so a proof
//! for leaf `i` seeks straight to its sibling chain without rehashing
//! content.

use super::{FIXED_DEPTH, FIXED_LEAVES, LEAF_SIZE};
use crate::error::StoreError;
use crate::types::Hash;
use sha3::{Digest, Sha3_256};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Streaming builder. Feed bytes through `Write`, then [`finish`] to obtain
/// the full node set.
///
/// [`finish`]: FixedMerkleTree::finish
pub struct FixedMerkleTree {
    leaves: Vec<Sha3_256>,
    written: u64,
}

impl FixedMerkleTree {
    pub fn new() -> Self {
        Self {
            leaves: (0..FIXED_LEAVES).map(|_| Sha3_256::new()).collect(),
            written: 0,
        }
    }

    /// Maximum file size representable by the fixed tree.
    pub const fn capacity() -> u64 {
        (FIXED_LEAVES * LEAF_SIZE) as u64
    }

    /// Compute all node levels from the streamed bytes.
    pub fn finish(self) -> FixedMerkleNodes {
        let leaf_hashes: Vec<Hash> = self
            .leaves
            .into_iter()
            .map(|h| h.finalize().into())
            .collect();
        FixedMerkleNodes::from_leaves(leaf_hashes)
    }
}

impl Default for FixedMerkleTree {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for FixedMerkleTree {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            if self.written >= Self::capacity() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("file exceeds fixed tree capacity of {} bytes", Self::capacity()),
                ));
            }
            let leaf = (self.written as usize) / LEAF_SIZE;
            let leaf_remaining = LEAF_SIZE - (self.written as usize) % LEAF_SIZE;
            let take = leaf_remaining.min(remaining.len());
            self.leaves[leaf].update(&remaining[..take]);
            self.written += take as u64;
            remaining = &remaining[take..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The complete node set of a fixed Merkle tree: `levels[0]` holds the 1024
/// leaf hashes, each upper level halves, `levels[FIXED_DEPTH]` is the root.
pub struct FixedMerkleNodes {
    levels: Vec<Vec<Hash>>,
}

impl FixedMerkleNodes {
    fn from_leaves(leaves: Vec<Hash>) -> Self {
        debug_assert_eq!(leaves.len(), FIXED_LEAVES);
        let mut levels = Vec::with_capacity(FIXED_DEPTH + 1);
        levels.push(leaves);
        for _ in 0..FIXED_DEPTH {
            let prev = levels.last().expect("level pushed above");
            let next: Vec<Hash> = prev
                .chunks(2)
                .map(|pair| combine(&pair[0], &pair[1]))
                .collect();
            levels.push(next);
        }
        Self { levels }
    }

    pub fn root(&self) -> Hash {
        self.levels[FIXED_DEPTH][0]
    }

    /// Persist every node contiguously: leaves, then each upper level, root
    /// last. The written region is always [`super::FIXED_NODES_SIZE`] bytes.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        for level in &self.levels {
            for node in level {
                sink.write_all(node)?;
            }
        }
        Ok(())
    }

    /// Sibling chain for one leaf, ordered leaf level upward.
    pub fn proof(&self, leaf_index: usize) -> Vec<Hash> {
        let mut proof = Vec::with_capacity(FIXED_DEPTH);
        let mut index = leaf_index;
        for level in 0..FIXED_DEPTH {
            proof.push(self.levels[level][index ^ 1]);
            index >>= 1;
        }
        proof
    }
}

/// Node offset (in hashes) of `level` within the stored region.
fn level_offset(level: usize) -> u64 {
    (2 * FIXED_LEAVES - ((2 * FIXED_LEAVES) >> level)) as u64
}

/// Read one node hash from a stored region.
fn read_node<R: Read + Seek>(
    reader: &mut R,
    region_start: u64,
    level: usize,
    index: usize,
) -> Result<Hash, StoreError> {
    let pos = region_start + (level_offset(level) + index as u64) * 32;
    reader.seek(SeekFrom::Start(pos))?;
    let mut hash = [0u8; 32];
    reader.read_exact(&mut hash)?;
    Ok(hash)
}

/// Extract the proof for `leaf_index` from a previously stored node region.
pub fn stored_proof<R: Read + Seek>(
    reader: &mut R,
    region_start: u64,
    leaf_index: usize,
) -> Result<Vec<Hash>, StoreError> {
    if leaf_index >= FIXED_LEAVES {
        return Err(StoreError::BlockOutOfRange {
            start: leaf_index,
            end: leaf_index + 1,
            blocks: FIXED_LEAVES,
        });
    }
    let mut proof = Vec::with_capacity(FIXED_DEPTH);
    let mut index = leaf_index;
    for level in 0..FIXED_DEPTH {
        proof.push(read_node(reader, region_start, level, index ^ 1)?);
        index >>= 1;
    }
    Ok(proof)
}

/// Read the root from a stored node region.
pub fn stored_root<R: Read + Seek>(reader: &mut R, region_start: u64) -> Result<Hash, StoreError> {
    read_node(reader, region_start, FIXED_DEPTH, 0)
}

/// Verify a leaf hash against a root through its sibling chain.
pub fn verify_proof(leaf_hash: &Hash, leaf_index: usize, proof: &[Hash], root: &Hash) -> bool {
    if proof.len() != FIXED_DEPTH {
        return false;
    }
    let mut hash = *leaf_hash;
    let mut index = leaf_index;
    for sibling in proof {
        hash = if index & 1 == 1 {
            combine(sibling, &hash)
        } else {
            combine(&hash, sibling)
        };
        index >>= 1;
    }
    hash == *root
}

/// Hash of the bytes in one leaf position.
pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(data);
    hasher.finalize().into()
}

fn combine(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}
