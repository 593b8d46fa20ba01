//! Merkle Engine
//!
//! Two trees are computed over every committed file in a single streaming
//! pass. The fixed Merkle tree proves possession of 64 KiB blocks of the
//! canonical stored bytes; the validation tree proves that the bytes the
//! client streamed chunk-by-chunk are the bytes the node received. Both
//! persist their node hashes into the blob header so proofs never rehash
//! content.

pub mod fixed_merkle;
pub mod validation;

pub use fixed_merkle::{FixedMerkleNodes, FixedMerkleTree};
pub use validation::{RangeProof, ValidationNodes, ValidationTree};

use std::io::{self, Write};

/// Size of one fixed Merkle leaf / one read block.
pub const LEAF_SIZE: usize = 64 * 1024;

/// Leaf count of the fixed Merkle tree. Constant regardless of file size,
/// which keeps the stored node region constant-size and bounds files to
/// `FIXED_LEAVES * LEAF_SIZE` bytes.
pub const FIXED_LEAVES: usize = 1024;

/// Depth of the fixed tree above the leaves.
pub const FIXED_DEPTH: usize = 10;

/// Total nodes in the fixed tree (leaves plus all upper levels).
pub const FIXED_TREE_NODES: usize = 2 * FIXED_LEAVES - 1;

/// Byte size of the stored fixed-Merkle node region.
pub const FIXED_NODES_SIZE: u64 = (FIXED_TREE_NODES * 32) as u64;

/// Cap on stored validation-tree leaves; larger files store a merged level.
pub const MAX_VALIDATION_LEAVES: usize = 1024;

/// Multiplexing writer feeding both trees in one pass over the bytes.
pub struct CommitHasher {
    fixed: FixedMerkleTree,
    validation: ValidationTree,
    written: u64,
}

impl CommitHasher {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            fixed: FixedMerkleTree::new(),
            validation: ValidationTree::new(chunk_size),
            written: 0,
        }
    }

    /// Bytes fed so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Close both trees and return their node sets.
    pub fn finish(self) -> (FixedMerkleNodes, ValidationNodes) {
        (self.fixed.finish(), self.validation.finish())
    }
}

impl Write for CommitHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.fixed.write_all(buf)?;
        self.validation.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
