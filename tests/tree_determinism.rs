//! Property tests for reference tree hashing.
//!
//! For any sequence of change operations applied to an empty root, the
//! incrementally maintained root hash must equal a hash recomputed by an
//! independent bottom-up walk, and every directory's children must stay
//! sorted by name. Failed operations must leave the tree untouched.

use blobber::change::{
    Change, ChangeContext, CopyChange, DeleteChange, MkDirChange, MoveChange, RenameChange,
    SetAttributesChange, UploadChange,
};
use blobber::tree::node::{join_path, NodeKind};
use blobber::tree::RefTree;
use blobber::types::{sha3_256, Hash, EMPTY_HASH};
use proptest::prelude::*;
use std::collections::BTreeMap;

const ALLOC: &str = "prop-alloc";

const PATHS: &[&str] = &[
    "/a",
    "/b",
    "/dir",
    "/dir/a",
    "/dir/b",
    "/dir/sub/c",
    "/other/x",
];

fn ctx() -> ChangeContext {
    ChangeContext {
        connection_id: "prop-conn".to_string(),
        allocation_root: "prop-root".to_string(),
        timestamp: 42,
        max_alloc_dir_files: 0,
    }
}

fn upload(path: &str, size: u64) -> UploadChange {
    UploadChange {
        path: path.to_string(),
        size,
        actual_size: size,
        actual_hash: sha3_256(path.as_bytes()),
        validation_root: sha3_256(&size.to_le_bytes()),
        fixed_merkle_root: sha3_256(b"fixed"),
        chunk_size: 64 * 1024,
        custom_meta: String::new(),
        thumbnail_size: 0,
        thumbnail_hash: EMPTY_HASH,
    }
}

fn build_change(op: u8, p1: usize, p2: usize) -> Change {
    let path = PATHS[p1 % PATHS.len()].to_string();
    let other = PATHS[p2 % PATHS.len()].to_string();
    match op % 8 {
        0 => Change::Insert(upload(&path, (p2 as u64 + 1) * 10)),
        1 => Change::Update(upload(&path, (p2 as u64 + 1) * 7)),
        2 => Change::Delete(DeleteChange { path }),
        3 => Change::Rename(RenameChange {
            path,
            new_name: format!("r{}", p2 % PATHS.len()),
        }),
        4 => Change::Move(MoveChange {
            src_path: path,
            dest_path: other,
        }),
        5 => Change::Copy(CopyChange {
            src_path: path,
            dest_path: other,
        }),
        6 => Change::MkDir(MkDirChange { path }),
        _ => Change::SetAttributes(SetAttributesChange {
            path,
            attributes: BTreeMap::from([(format!("k{p2}"), "v".to_string())]),
        }),
    }
}

/// Independent bottom-up recomputation from node contents alone. Returns
/// the subtree hash and block total, and asserts the sorted-children
/// invariant on the way.
fn walk(tree: &RefTree, path: &str) -> (Hash, u64) {
    let node = tree.get(path).expect("walked path exists");
    match node.kind {
        NodeKind::File => (node.file_hash(), node.file_num_blocks()),
        NodeKind::Directory => {
            let mut sorted = node.children.clone();
            sorted.sort();
            assert_eq!(node.children, sorted, "children out of order at {path}");

            let mut hashes = Vec::with_capacity(node.children.len());
            let mut blocks = 0u64;
            for name in &node.children {
                let (hash, child_blocks) = walk(tree, &join_path(path, name));
                hashes.push(hex::encode(hash));
                blocks += child_blocks;
            }
            (sha3_256(hashes.join(":").as_bytes()), blocks)
        }
    }
}

proptest! {
    #[test]
    fn incremental_root_hash_matches_full_recompute(
        ops in prop::collection::vec((0u8..8, 0usize..8, 0usize..8), 1..40)
    ) {
        let ctx = ctx();
        let mut tree = RefTree::empty(ALLOC, 1);
        for (op, p1, p2) in &ops {
            // Invalid operations (duplicate insert, missing source, ...)
            // are expected; they must simply leave the tree unchanged.
            let _ = build_change(*op, *p1, *p2).apply(&mut tree, &ctx);
        }

        let incremental = tree.calculate_hash(None).unwrap();
        let (recomputed, blocks) = walk(&tree, "/");
        prop_assert_eq!(incremental, recomputed);
        prop_assert_eq!(tree.root().num_blocks, blocks);
    }

    #[test]
    fn replaying_marshalled_records_yields_an_identical_tree(
        ops in prop::collection::vec((0u8..8, 0usize..8, 0usize..8), 1..25)
    ) {
        let ctx = ctx();
        let mut direct = RefTree::empty(ALLOC, 1);
        let mut replayed = RefTree::empty(ALLOC, 1);

        for (op, p1, p2) in &ops {
            let change = build_change(*op, *p1, *p2);
            let record = change.marshal("prop-conn").unwrap();
            let restored = Change::unmarshal(&record).unwrap();

            let a = change.apply(&mut direct, &ctx);
            let b = restored.apply(&mut replayed, &ctx);
            prop_assert_eq!(a.is_ok(), b.is_ok());
        }

        prop_assert_eq!(
            direct.calculate_hash(None).unwrap(),
            replayed.calculate_hash(None).unwrap()
        );
    }

    #[test]
    fn failed_operations_never_change_the_root_hash(
        ops in prop::collection::vec((0u8..8, 0usize..8, 0usize..8), 1..30)
    ) {
        let ctx = ctx();
        let mut tree = RefTree::empty(ALLOC, 1);
        let mut expected = tree.calculate_hash(None).unwrap();

        for (op, p1, p2) in &ops {
            match build_change(*op, *p1, *p2).apply(&mut tree, &ctx) {
                Ok(_) => {
                    expected = tree.calculate_hash(None).unwrap();
                }
                Err(_) => {
                    prop_assert_eq!(tree.calculate_hash(None).unwrap(), expected);
                }
            }
        }
    }
}
