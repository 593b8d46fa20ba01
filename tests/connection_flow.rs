//! End-to-end connection lifecycle tests: staged chunk writes, batch apply,
//! the two-phase commit against the metadata store and content store, crash
//! replay from persisted change records, and conditional garbage collection
//! of unreferenced content.

use blobber::change::{Change, DeleteChange, MoveChange, UploadChange};
use blobber::connection::{ChangeCollector, ConnectionState};
use blobber::hasher::fixed_merkle;
use blobber::meta::{MetaStore, SledMetaStore};
use blobber::store::paths::StorePaths;
use blobber::store::{declared_roots, FileStore};
use blobber::types::EMPTY_HASH;
use tempfile::TempDir;

const ALLOC: &str = "alloc-e2e";
const CHUNK: usize = 64 * 1024;

fn setup() -> (TempDir, FileStore, SledMetaStore) {
    let dir = TempDir::new().unwrap();
    let paths = StorePaths::new(dir.path().to_path_buf(), vec![2, 1], vec![2, 2, 1]).unwrap();
    let store = FileStore::new(paths).unwrap();
    let meta = SledMetaStore::temporary().unwrap();
    (dir, store, meta)
}

/// Stage `data` as a temp blob for `(conn, path)` and return the matching
/// upload payload with truthfully declared roots.
fn staged_upload(store: &FileStore, conn: &str, path: &str, data: &[u8]) -> UploadChange {
    let (fixed_root, validation_root) = declared_roots(data, CHUNK);
    let upload = UploadChange {
        path: path.to_string(),
        size: data.len() as u64,
        actual_size: data.len() as u64,
        actual_hash: validation_root,
        validation_root,
        fixed_merkle_root: fixed_root,
        chunk_size: CHUNK,
        custom_meta: String::new(),
        thumbnail_size: 0,
        thumbnail_hash: EMPTY_HASH,
    };
    store
        .write_chunk(ALLOC, conn, &upload.file_meta(), 0, data)
        .unwrap();
    upload
}

fn staged_insert(store: &FileStore, conn: &str, path: &str, data: &[u8]) -> Change {
    Change::Insert(staged_upload(store, conn, path, data))
}

fn staged_update(store: &FileStore, conn: &str, path: &str, data: &[u8]) -> Change {
    Change::Update(staged_upload(store, conn, path, data))
}

fn commit_one(store: &FileStore, meta: &SledMetaStore, conn: &str, changes: Vec<Change>) -> u64 {
    let mut collector = ChangeCollector::new(conn, ALLOC);
    for change in changes {
        collector.add_change(meta, change).unwrap();
    }
    collector.apply_changes(meta, "root-label", 100, 0).unwrap();
    collector.finalize(meta, store, 100).unwrap()
}

#[test]
fn upload_flow_commits_content_and_metadata() {
    let (_dir, store, meta) = setup();
    let data = vec![7u8; 2310];
    let change = staged_insert(&store, "conn-1", "/new", &data);

    let mut collector = ChangeCollector::new("conn-1", ALLOC);
    collector.add_change(&meta, change).unwrap();
    let root = collector.apply_changes(&meta, "root-label", 100, 0).unwrap();
    let version = collector.finalize(&meta, &store, 100).unwrap();

    assert_eq!(version, 1);
    assert_eq!(collector.state(), ConnectionState::Committed);

    // Metadata: the file row, its ancestors, and the allocation version row.
    let node = meta.find_by_path(ALLOC, "/new").unwrap().unwrap();
    assert_eq!(node.size, 2310);
    assert_eq!(node.write_marker, "root-label");
    let alloc_row = meta.allocation(ALLOC).unwrap().unwrap();
    assert_eq!(alloc_row.version, 1);
    assert_eq!(alloc_row.root_hash, root);

    // Content: readable with a verifying proof against the declared root.
    let block = store
        .get_file_block(ALLOC, &node.validation_root, 2310, 0, 1, true)
        .unwrap();
    assert_eq!(block.data, data);
    let proof = &block.proofs.unwrap()[0];
    assert!(fixed_merkle::verify_proof(
        &fixed_merkle::leaf_hash(&block.data),
        proof.leaf_index,
        &proof.siblings,
        &node.fixed_merkle_root,
    ));

    // Accounting: one committed file, no temp bytes left behind.
    let usage = store.usage().snapshot(ALLOC);
    assert_eq!(usage.file_count, 1);
    assert_eq!(usage.used_size, 2310);
    assert_eq!(usage.temp_size, 0);

    // The replay log is gone after commit.
    assert!(meta.load_changes("conn-1").unwrap().is_empty());
}

#[test]
fn mismatched_validation_root_fails_commit_and_keeps_temp() {
    let (_dir, store, meta) = setup();
    let data = vec![9u8; 2310];
    let (fixed_root, _) = declared_roots(&data, CHUNK);
    let upload = UploadChange {
        path: "/new".to_string(),
        size: 2310,
        actual_size: 2310,
        actual_hash: EMPTY_HASH,
        validation_root: blobber::types::sha3_256(b"wrong"),
        fixed_merkle_root: fixed_root,
        chunk_size: CHUNK,
        custom_meta: String::new(),
        thumbnail_size: 0,
        thumbnail_hash: EMPTY_HASH,
    };
    store
        .write_chunk(ALLOC, "conn-1", &upload.file_meta(), 0, &data)
        .unwrap();

    let mut collector = ChangeCollector::new("conn-1", ALLOC);
    collector
        .add_change(&meta, Change::Insert(upload.clone()))
        .unwrap();
    collector.apply_changes(&meta, "root-label", 100, 0).unwrap();

    let err = collector.finalize(&meta, &store, 100).unwrap_err();
    assert!(err.to_string().contains("validation_root_mismatch"));
    assert!(err.is_retryable_commit());

    // The staged bytes survive for a retry.
    let temp_len = store
        .temp_size(ALLOC, "conn-1", &upload.file_meta())
        .unwrap();
    assert_eq!(temp_len, 2310);
}

#[test]
fn failed_batch_persists_nothing() {
    let (_dir, store, meta) = setup();
    let change = staged_insert(&store, "conn-1", "/orig.txt", b"move me");

    // Two identical moves in one batch: the first succeeds in-memory, the
    // second aborts the whole connection.
    let mut collector = ChangeCollector::new("conn-1", ALLOC);
    collector.add_change(&meta, change).unwrap();
    collector
        .add_change(
            &meta,
            Change::Move(MoveChange {
                src_path: "/orig.txt".to_string(),
                dest_path: "/target/orig.txt".to_string(),
            }),
        )
        .unwrap();
    collector
        .add_change(
            &meta,
            Change::Move(MoveChange {
                src_path: "/orig.txt".to_string(),
                dest_path: "/target/orig.txt".to_string(),
            }),
        )
        .unwrap();

    let err = collector
        .apply_changes(&meta, "root-label", 100, 0)
        .unwrap_err();
    assert!(err.to_string().contains("not found"));

    // No row of the batch reached the metadata store.
    assert!(meta.find_by_path(ALLOC, "/orig.txt").unwrap().is_none());
    assert!(meta.find_by_path(ALLOC, "/target/orig.txt").unwrap().is_none());
    assert!(meta.allocation(ALLOC).unwrap().is_none());

    // Dropping the failing change lets the rest of the batch commit.
    let store2 = store;
    let mut retry = ChangeCollector::new("conn-2", ALLOC);
    let change = staged_insert(&store2, "conn-2", "/orig.txt", b"move me");
    retry.add_change(&meta, change).unwrap();
    retry
        .add_change(
            &meta,
            Change::Move(MoveChange {
                src_path: "/orig.txt".to_string(),
                dest_path: "/target/orig.txt".to_string(),
            }),
        )
        .unwrap();
    retry.apply_changes(&meta, "root-label", 101, 0).unwrap();
    retry.finalize(&meta, &store2, 101).unwrap();
    assert!(meta.find_by_path(ALLOC, "/target/orig.txt").unwrap().is_some());
    assert!(meta.find_by_path(ALLOC, "/orig.txt").unwrap().is_none());
}

#[test]
fn delete_gcs_content_only_when_unreferenced() {
    let (_dir, store, meta) = setup();
    let shared = vec![3u8; 5000];
    let unique = vec![4u8; 5000];

    // /old_dir/old_file and /old_dir/twin share bytes; /old_dir/solo is unique.
    commit_one(
        &store,
        &meta,
        "conn-1",
        vec![
            staged_insert(&store, "conn-1", "/old_dir/old_file", &shared),
            staged_insert(&store, "conn-1", "/old_dir/twin", &shared),
            staged_insert(&store, "conn-1", "/old_dir/solo", &unique),
        ],
    );

    let (_, shared_hash) = declared_roots(&shared, CHUNK);
    let (_, unique_hash) = declared_roots(&unique, CHUNK);
    let shared_blob = store.paths().final_path(ALLOC, &hex::encode(shared_hash));
    let unique_blob = store.paths().final_path(ALLOC, &hex::encode(unique_hash));
    assert!(shared_blob.exists());
    assert!(unique_blob.exists());

    // Deleting one of the twins keeps the shared blob alive.
    commit_one(
        &store,
        &meta,
        "conn-2",
        vec![Change::Delete(DeleteChange {
            path: "/old_dir/old_file".to_string(),
        })],
    );
    assert!(meta.find_by_path(ALLOC, "/old_dir/old_file").unwrap().is_none());
    assert!(meta.find_by_path(ALLOC, "/old_dir/twin").unwrap().is_some());
    assert!(meta.find_by_path(ALLOC, "/old_dir/solo").unwrap().is_some());
    assert!(shared_blob.exists());

    // Deleting the last references removes both blobs.
    commit_one(
        &store,
        &meta,
        "conn-3",
        vec![Change::Delete(DeleteChange {
            path: "/old_dir".to_string(),
        })],
    );
    assert!(!shared_blob.exists());
    assert!(!unique_blob.exists());
    assert!(meta.find_by_path(ALLOC, "/old_dir").unwrap().is_none());
}

#[test]
fn update_replaces_content_and_gcs_the_old_blob() {
    let (_dir, store, meta) = setup();
    let v1 = vec![1u8; 3000];
    let v2 = vec![2u8; 4500];
    commit_one(
        &store,
        &meta,
        "conn-1",
        vec![staged_insert(&store, "conn-1", "/f", &v1)],
    );

    let (_, old_hash) = declared_roots(&v1, CHUNK);
    let (_, new_hash) = declared_roots(&v2, CHUNK);
    let old_blob = store.paths().final_path(ALLOC, &hex::encode(old_hash));
    assert!(old_blob.exists());

    commit_one(
        &store,
        &meta,
        "conn-2",
        vec![staged_update(&store, "conn-2", "/f", &v2)],
    );

    // The replaced bytes are gone, physically and from the content index.
    assert!(!old_blob.exists());
    assert!(store
        .paths()
        .final_path(ALLOC, &hex::encode(new_hash))
        .exists());
    assert!(!meta.content_referenced(&old_hash, &[]).unwrap());
    assert!(meta.content_referenced(&new_hash, &[]).unwrap());

    let node = meta.find_by_path(ALLOC, "/f").unwrap().unwrap();
    assert_eq!(node.size, 4500);

    // Still one reference, settled to the new size.
    let usage = store.usage().snapshot(ALLOC);
    assert_eq!(usage.file_count, 1);
    assert_eq!(usage.used_size, 4500);
    assert_eq!(usage.temp_size, 0);
}

#[test]
fn update_spares_old_content_still_referenced_by_a_twin() {
    let (_dir, store, meta) = setup();
    let shared = vec![6u8; 2000];
    let fresh = vec![7u8; 1000];
    commit_one(
        &store,
        &meta,
        "conn-1",
        vec![
            staged_insert(&store, "conn-1", "/a", &shared),
            staged_insert(&store, "conn-1", "/b", &shared),
        ],
    );

    commit_one(
        &store,
        &meta,
        "conn-2",
        vec![staged_update(&store, "conn-2", "/a", &fresh)],
    );

    // /b still points at the shared bytes, so they survive the update.
    let (_, shared_hash) = declared_roots(&shared, CHUNK);
    assert!(store
        .paths()
        .final_path(ALLOC, &hex::encode(shared_hash))
        .exists());
    assert!(meta.content_referenced(&shared_hash, &[]).unwrap());

    let usage = store.usage().snapshot(ALLOC);
    assert_eq!(usage.file_count, 2);
    assert_eq!(usage.used_size, 3000);
}

#[test]
fn interrupted_connection_replays_from_persisted_records() {
    let (_dir, store, meta) = setup();
    let data = vec![5u8; 1234];
    let change = staged_insert(&store, "conn-crash", "/recovered", &data);

    {
        // Enqueue, then "crash" before apply/finalize.
        let mut collector = ChangeCollector::new("conn-crash", ALLOC);
        collector.add_change(&meta, change).unwrap();
    }
    assert_eq!(meta.connections().unwrap(), vec!["conn-crash"]);

    let mut replayed = ChangeCollector::load(&meta, "conn-crash", ALLOC).unwrap();
    replayed.apply_changes(&meta, "root-label", 200, 0).unwrap();
    let version = replayed.finalize(&meta, &store, 200).unwrap();

    assert_eq!(version, 1);
    let node = meta.find_by_path(ALLOC, "/recovered").unwrap().unwrap();
    assert_eq!(node.size, 1234);
    assert!(meta.connections().unwrap().is_empty());
}

#[test]
fn rollback_discards_staged_state() {
    let (_dir, store, meta) = setup();
    let change = staged_insert(&store, "conn-1", "/doomed", b"throwaway");

    let mut collector = ChangeCollector::new("conn-1", ALLOC);
    collector.add_change(&meta, change).unwrap();
    collector.apply_changes(&meta, "root-label", 100, 0).unwrap();
    collector.rollback(&meta, &store).unwrap();

    assert!(meta.load_changes("conn-1").unwrap().is_empty());
    assert_eq!(store.usage().snapshot(ALLOC).temp_size, 0);
    assert!(meta.find_by_path(ALLOC, "/doomed").unwrap().is_none());

    // Rollback is idempotent.
    collector.rollback(&meta, &store).unwrap();
}

#[test]
fn versions_increase_across_connections() {
    let (_dir, store, meta) = setup();
    let v1 = commit_one(
        &store,
        &meta,
        "conn-1",
        vec![staged_insert(&store, "conn-1", "/one", b"first")],
    );
    let v2 = commit_one(
        &store,
        &meta,
        "conn-2",
        vec![staged_insert(&store, "conn-2", "/two", b"second")],
    );
    assert_eq!((v1, v2), (1, 2));

    let usage = store.usage().snapshot(ALLOC);
    assert_eq!(usage.file_count, 2);
    assert_eq!(usage.used_size, 11);
}
