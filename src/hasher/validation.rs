//! Validation tree: per-chunk root over client-declared chunk boundaries.
//!
//! Chunk boundaries follow the client's `chunk_size`, which need not match
//! the fixed tree's 64 KiB leaves. The root lets a client prove the bytes it
//! streamed chunk-by-chunk are the bytes the node committed, independently
//! of the canonical fixed tree. Pairs combine upward; an odd trailing node
//! carries to the next level unchanged. The stored leaf level is merged
//! until it fits [`MAX_VALIDATION_LEAVES`], so the region size is a function
//! of `(file_size, chunk_size)` alone and reads can seek past it.

use super::MAX_VALIDATION_LEAVES;
use crate::error::StoreError;
use crate::types::{sha3_256, Hash};
use sha3::{Digest, Sha3_256};
use std::io::{self, Read, Seek, SeekFrom, Write};

/// Streaming builder over chunk-aligned hashes.
pub struct ValidationTree {
    chunk_size: usize,
    current: Sha3_256,
    current_len: usize,
    leaves: Vec<Hash>,
}

impl ValidationTree {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            current: Sha3_256::new(),
            current_len: 0,
            leaves: Vec::new(),
        }
    }

    /// Close the trailing partial chunk and return the stored node set.
    pub fn finish(mut self) -> ValidationNodes {
        if self.current_len > 0 {
            self.leaves.push(self.current.finalize_reset().into());
        }
        ValidationNodes::from_leaves(self.leaves)
    }
}

impl Write for ValidationTree {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut remaining = buf;
        while !remaining.is_empty() {
            let take = (self.chunk_size - self.current_len).min(remaining.len());
            self.current.update(&remaining[..take]);
            self.current_len += take;
            if self.current_len == self.chunk_size {
                self.leaves.push(self.current.finalize_reset().into());
                self.current_len = 0;
            }
            remaining = &remaining[take..];
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// The stored level of a validation tree plus its root.
pub struct ValidationNodes {
    stored: Vec<Hash>,
    root: Hash,
}

impl ValidationNodes {
    fn from_leaves(leaves: Vec<Hash>) -> Self {
        let root = root_of_level(&leaves);
        let mut stored = leaves;
        while stored.len() > MAX_VALIDATION_LEAVES {
            stored = reduce_once(&stored);
        }
        Self { stored, root }
    }

    pub fn root(&self) -> Hash {
        self.root
    }

    pub fn stored_len(&self) -> usize {
        self.stored.len()
    }

    /// Persist the stored level contiguously.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> io::Result<()> {
        for node in &self.stored {
            sink.write_all(node)?;
        }
        Ok(())
    }
}

/// Combine one level into the next: pairs hash together, an odd trailing
/// node carries up unchanged.
fn reduce_once(level: &[Hash]) -> Vec<Hash> {
    let mut next = Vec::with_capacity(level.len() / 2 + 1);
    let mut iter = level.chunks_exact(2);
    for pair in &mut iter {
        next.push(combine(&pair[0], &pair[1]));
    }
    if let [last] = iter.remainder() {
        next.push(*last);
    }
    next
}

/// Root of a level, reducing until one node remains. An empty level (empty
/// file) hashes empty input.
fn root_of_level(level: &[Hash]) -> Hash {
    if level.is_empty() {
        return sha3_256(&[]);
    }
    let mut current = level.to_vec();
    while current.len() > 1 {
        current = reduce_once(&current);
    }
    current[0]
}

fn combine(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha3_256::new();
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Number of stored leaf hashes for a file of `file_size` bytes.
pub fn stored_leaf_count(file_size: u64, chunk_size: usize) -> usize {
    if file_size == 0 {
        return 0;
    }
    let chunk = chunk_size.max(1) as u64;
    let mut count = file_size.div_ceil(chunk) as usize;
    while count > MAX_VALIDATION_LEAVES {
        count = count / 2 + count % 2;
    }
    count
}

/// Byte size of the stored validation node region.
pub fn validation_nodes_size(file_size: u64, chunk_size: usize) -> u64 {
    (stored_leaf_count(file_size, chunk_size) * 32) as u64
}

/// Proof that stored-level nodes `start..end` belong under a root.
///
/// `nodes` holds boundary siblings, pushed per level left-then-right, in the
/// order [`verify_range_proof`] consumes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeProof {
    pub nodes: Vec<Hash>,
    pub start: usize,
    pub end: usize,
    pub total_leaves: usize,
}

/// Extract a multi-index proof for stored nodes `start..end` from a stored
/// region. The stored level is bounded, so it is read whole and the upper
/// levels recomputed in memory.
pub fn stored_range_proof<R: Read + Seek>(
    reader: &mut R,
    region_start: u64,
    total_leaves: usize,
    start: usize,
    end: usize,
) -> Result<RangeProof, StoreError> {
    if start >= end || end > total_leaves {
        return Err(StoreError::BlockOutOfRange {
            start,
            end,
            blocks: total_leaves,
        });
    }

    reader.seek(SeekFrom::Start(region_start))?;
    let mut level = Vec::with_capacity(total_leaves);
    for _ in 0..total_leaves {
        let mut hash = [0u8; 32];
        reader.read_exact(&mut hash)?;
        level.push(hash);
    }

    let mut nodes = Vec::new();
    let mut s = start;
    let mut e = end - 1;
    while level.len() > 1 {
        if s % 2 == 1 {
            nodes.push(level[s - 1]);
        }
        if e % 2 == 0 && e + 1 < level.len() {
            nodes.push(level[e + 1]);
        }
        level = reduce_once(&level);
        s /= 2;
        e /= 2;
    }

    Ok(RangeProof {
        nodes,
        start,
        end,
        total_leaves,
    })
}

/// Recombine `leaf_hashes` (the stored nodes at `proof.start..proof.end`)
/// with the proof's boundary siblings and compare against `root`.
pub fn verify_range_proof(leaf_hashes: &[Hash], proof: &RangeProof, root: &Hash) -> bool {
    if leaf_hashes.len() != proof.end - proof.start || proof.end > proof.total_leaves {
        return false;
    }
    let mut segment = leaf_hashes.to_vec();
    let mut s = proof.start;
    let mut e = proof.end - 1;
    let mut level_len = proof.total_leaves;
    let mut consumed = 0;

    while level_len > 1 {
        if s % 2 == 1 {
            let Some(&sibling) = proof.nodes.get(consumed) else {
                return false;
            };
            segment.insert(0, sibling);
            consumed += 1;
            s -= 1;
        }
        if e % 2 == 0 && e + 1 < level_len {
            let Some(&sibling) = proof.nodes.get(consumed) else {
                return false;
            };
            segment.push(sibling);
            consumed += 1;
            e += 1;
        }
        segment = reduce_once(&segment);
        s /= 2;
        e /= 2;
        level_len = level_len / 2 + level_len % 2;
    }

    consumed == proof.nodes.len() && segment.len() == 1 && segment[0] == *root
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build(data: &[u8], chunk_size: usize) -> ValidationNodes {
        let mut tree = ValidationTree::new(chunk_size);
        tree.write_all(data).unwrap();
        tree.finish()
    }

    #[test]
    fn root_covers_trailing_partial_chunk() {
        let full = build(&[1u8; 96], 32); // three full chunks
        let partial = build(&[1u8; 90], 32); // two full, one partial
        assert_ne!(full.root(), partial.root());
        assert_eq!(full.stored_len(), 3);
        assert_eq!(partial.stored_len(), 3);
    }

    #[test]
    fn root_is_independent_of_write_granularity() {
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 313) as u8).collect();
        let whole = build(&data, 64);
        let mut tree = ValidationTree::new(64);
        for chunk in data.chunks(13) {
            tree.write_all(chunk).unwrap();
        }
        assert_eq!(whole.root(), tree.finish().root());
    }

    #[test]
    fn stored_level_is_capped_without_changing_root() {
        // 3000 one-byte chunks exceed the cap; root must survive merging.
        let data = vec![9u8; 3000];
        let nodes = build(&data, 1);
        assert!(nodes.stored_len() <= MAX_VALIDATION_LEAVES);
        assert_eq!(nodes.stored_len(), stored_leaf_count(3000, 1));

        // Root from raw leaves equals root from the merged stored level.
        let leaves: Vec<Hash> = data.iter().map(|b| sha3_256(&[*b])).collect();
        assert_eq!(root_of_level(&leaves), nodes.root());
    }

    #[test]
    fn region_size_matches_stored_level() {
        let data = vec![3u8; 2310];
        let nodes = build(&data, 64 * 1024);
        let mut region = Vec::new();
        nodes.write_to(&mut region).unwrap();
        assert_eq!(region.len() as u64, validation_nodes_size(2310, 64 * 1024));
        assert_eq!(region.len(), 32); // one chunk
    }

    #[test]
    fn range_proofs_verify_for_all_spans() {
        let data: Vec<u8> = (0..700u32).map(|i| (i % 97) as u8).collect();
        let nodes = build(&data, 100); // seven chunks
        let mut region = Vec::new();
        nodes.write_to(&mut region).unwrap();
        let total = nodes.stored_len();
        assert_eq!(total, 7);

        let leaves: Vec<Hash> = data.chunks(100).map(sha3_256).collect();
        let mut reader = Cursor::new(region);
        for start in 0..total {
            for end in start + 1..=total {
                let proof = stored_range_proof(&mut reader, 0, total, start, end).unwrap();
                assert!(
                    verify_range_proof(&leaves[start..end], &proof, &nodes.root()),
                    "range [{start}, {end}) failed"
                );
            }
        }
    }

    #[test]
    fn range_proof_rejects_wrong_leaves() {
        let data = vec![5u8; 500];
        let nodes = build(&data, 100);
        let mut region = Vec::new();
        nodes.write_to(&mut region).unwrap();
        let mut reader = Cursor::new(region);
        let proof = stored_range_proof(&mut reader, 0, nodes.stored_len(), 1, 3).unwrap();

        let bogus = [sha3_256(b"nope"), sha3_256(b"also nope")];
        assert!(!verify_range_proof(&bogus, &proof, &nodes.root()));
    }

    #[test]
    fn empty_file_root_is_defined() {
        let a = build(b"", 64);
        assert_eq!(a.root(), sha3_256(&[]));
        assert_eq!(a.stored_len(), 0);
        assert_eq!(stored_leaf_count(0, 64), 0);
    }

    #[test]
    fn out_of_range_request_is_rejected() {
        let nodes = build(&[1u8; 300], 100);
        let mut region = Vec::new();
        nodes.write_to(&mut region).unwrap();
        let mut reader = Cursor::new(region);
        assert!(stored_range_proof(&mut reader, 0, 3, 2, 5).is_err());
        assert!(stored_range_proof(&mut reader, 0, 3, 2, 2).is_err());
    }
}
