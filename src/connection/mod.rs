//! Connection collector
//!
//! One connection batches ordered changes under a single id and walks the
//! state machine `New -> InProgress -> Committed`. Changes are persisted as
//! records when enqueued so a crashed connection can be reloaded and
//! replayed. `apply_changes` runs the batch against one working tree with
//! first-failure abort; `finalize` commits the metadata transaction first
//! and then promotes staged content.
//!
//! The filesystem half of the two-phase commit is not atomic with the
//! metadata half. A crash or verification failure between the two halves
//! can leave committed rows pointing at content that has not been promoted
//! yet, and staged precommit blobs behind; promotion and cleanup paths are
//! idempotent and re-runnable (at-least-once).

use crate::change::{Applied, Change, ChangeContext, ChangeRecord};
use crate::error::{BlobberError, ConnectionError, MetaError};
use crate::meta::MetaStore;
use crate::store::FileStore;
use crate::tree::RefTree;
use crate::types::{hash_hex, Hash, Timestamp, EMPTY_HASH};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    InProgress,
    Committed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::New => "new",
            ConnectionState::InProgress => "in_progress",
            ConnectionState::Committed => "committed",
        }
    }
}

/// Collects one connection's ordered changes and drives them through
/// apply and the two-phase commit.
pub struct ChangeCollector {
    connection_id: String,
    allocation_id: String,
    state: ConnectionState,
    size: i64,
    changes: Vec<Change>,
    applied: Vec<Applied>,
    tree: Option<RefTree>,
}

impl ChangeCollector {
    pub fn new(connection_id: &str, allocation_id: &str) -> Self {
        Self {
            connection_id: connection_id.to_string(),
            allocation_id: allocation_id.to_string(),
            state: ConnectionState::New,
            size: 0,
            changes: Vec::new(),
            applied: Vec::new(),
            tree: None,
        }
    }

    /// Rebuild a collector from its persisted change records (crash
    /// replay). Unknown connections are an error.
    pub fn load(
        meta: &dyn MetaStore,
        connection_id: &str,
        allocation_id: &str,
    ) -> Result<Self, BlobberError> {
        let records = meta.load_changes(connection_id)?;
        if records.is_empty() {
            return Err(ConnectionError::Unknown(connection_id.to_string()).into());
        }
        let mut collector = Self::new(connection_id, allocation_id);
        for bytes in records {
            let record: ChangeRecord =
                bincode::deserialize(&bytes).map_err(MetaError::Decode)?;
            collector.size += record.size;
            collector.changes.push(Change::unmarshal(&record)?);
        }
        debug!(
            connection_id,
            allocation_id,
            changes = collector.changes.len(),
            "Reloaded connection from persisted records"
        );
        Ok(collector)
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Running declared size delta of the batch. Settled against actual
    /// node sizes once `apply_changes` has run.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// Enqueue one change and persist its record for replay.
    pub fn add_change(&mut self, meta: &dyn MetaStore, change: Change) -> Result<(), BlobberError> {
        if self.state == ConnectionState::Committed {
            return Err(ConnectionError::InvalidState {
                id: self.connection_id.clone(),
                state: self.state.as_str().to_string(),
                expected: "new or in_progress".to_string(),
            }
            .into());
        }
        let record = change.marshal(&self.connection_id)?;
        let bytes = bincode::serialize(&record).map_err(MetaError::Decode)?;
        meta.save_change(&self.connection_id, self.changes.len() as u32, &bytes)?;
        self.size += record.size;
        self.changes.push(change);
        Ok(())
    }

    /// Run every queued change in insertion order against one working
    /// tree. The first failure aborts the whole batch and discards the
    /// tree; nothing has been persisted at that point. Returns the new
    /// root hash.
    pub fn apply_changes(
        &mut self,
        meta: &dyn MetaStore,
        allocation_root: &str,
        ts: Timestamp,
        max_alloc_dir_files: u64,
    ) -> Result<Hash, BlobberError> {
        if self.state == ConnectionState::Committed {
            return Err(ConnectionError::InvalidState {
                id: self.connection_id.clone(),
                state: self.state.as_str().to_string(),
                expected: "new or in_progress".to_string(),
            }
            .into());
        }
        self.state = ConnectionState::InProgress;

        let paths = self.affected_paths();
        let mut tree = RefTree::load(meta, &self.allocation_id, &paths, ts)?;
        let ctx = ChangeContext {
            connection_id: self.connection_id.clone(),
            allocation_root: allocation_root.to_string(),
            timestamp: ts,
            max_alloc_dir_files,
        };

        let mut applied = Vec::with_capacity(self.changes.len());
        let mut size = 0i64;
        for change in &self.changes {
            match change.apply(&mut tree, &ctx) {
                Ok(outcome) => {
                    size += outcome.size_delta;
                    applied.push(outcome);
                }
                Err(e) => {
                    self.tree = None;
                    self.applied.clear();
                    warn!(
                        connection_id = %self.connection_id,
                        operation = change.operation().as_str(),
                        error = %e,
                        "Change failed, aborting batch"
                    );
                    return Err(e);
                }
            }
        }

        let root = tree.calculate_hash(None)?;
        self.size = size;
        self.applied = applied;
        self.tree = Some(tree);
        Ok(root)
    }

    /// Commit the connection: metadata transaction first, then content
    /// promotion and conditional GC. If the metadata transaction fails,
    /// staged temp blobs are discarded and the error is surfaced.
    pub fn finalize(
        &mut self,
        meta: &dyn MetaStore,
        store: &FileStore,
        ts: Timestamp,
    ) -> Result<u64, BlobberError> {
        if self.state != ConnectionState::InProgress {
            return Err(ConnectionError::InvalidState {
                id: self.connection_id.clone(),
                state: self.state.as_str().to_string(),
                expected: "in_progress".to_string(),
            }
            .into());
        }
        let tree = self
            .tree
            .take()
            .ok_or_else(|| ConnectionError::NotApplied(self.connection_id.clone()))?;

        let root = tree.root().hash;
        let saved = tree.changed_rows();
        let deleted = tree.deleted_rows().to_vec();
        let superseded = tree.superseded_rows().to_vec();
        let excluded = tree.deleted_lookup_hashes();

        let version = match meta.finalize(
            &self.allocation_id,
            root,
            ts,
            &saved,
            &deleted,
            &superseded,
        ) {
            Ok(version) => version,
            Err(e) => {
                self.delete_changes(store);
                self.tree = Some(tree);
                return Err(e.into());
            }
        };

        for (change, applied) in self.changes.iter().zip(&self.applied) {
            change.commit_to_store(store, &self.allocation_id, &self.connection_id)?;
            for candidate in &applied.gc_candidates {
                let content_hash = candidate.content_hash;
                store.delete_file(&self.allocation_id, &content_hash, candidate.size, || {
                    Ok(meta.content_referenced(&content_hash, &excluded)?)
                })?;
                if candidate.thumbnail_hash != EMPTY_HASH {
                    let thumb = candidate.thumbnail_hash;
                    store.gc_blob(&self.allocation_id, &thumb, || {
                        Ok(meta.content_referenced(&thumb, &excluded)?)
                    })?;
                }
            }
        }

        self.state = ConnectionState::Committed;
        meta.delete_connection(&self.connection_id)?;
        store.delete_temp_dir(&self.allocation_id, &self.connection_id)?;

        info!(
            connection_id = %self.connection_id,
            allocation_id = %self.allocation_id,
            version,
            root_hash = %hash_hex(&root),
            changes = self.changes.len(),
            size_delta = self.size,
            "Committed connection"
        );
        Ok(version)
    }

    /// Discard the connection: staged temp blobs, precommit blobs, and
    /// persisted change records. Idempotent.
    pub fn rollback(
        &mut self,
        meta: &dyn MetaStore,
        store: &FileStore,
    ) -> Result<(), BlobberError> {
        store.delete_temp_dir(&self.allocation_id, &self.connection_id)?;
        store.delete_precommit_dir(&self.allocation_id)?;
        meta.delete_connection(&self.connection_id)?;
        self.tree = None;
        self.applied.clear();
        self.size = 0;
        info!(
            connection_id = %self.connection_id,
            allocation_id = %self.allocation_id,
            "Rolled back connection"
        );
        Ok(())
    }

    /// Compensation when the metadata transaction fails: staged temp blobs
    /// are removed so a retry starts clean.
    fn delete_changes(&self, store: &FileStore) {
        for change in &self.changes {
            if let Err(e) = change.delete_temp(store, &self.allocation_id, &self.connection_id) {
                warn!(
                    connection_id = %self.connection_id,
                    operation = change.operation().as_str(),
                    error = %e,
                    "Temp cleanup failed during compensation"
                );
            }
        }
    }

    fn affected_paths(&self) -> Vec<String> {
        let mut paths = Vec::new();
        for change in &self.changes {
            match change {
                Change::Insert(c) | Change::Update(c) => paths.push(c.path.clone()),
                Change::Delete(c) => paths.push(c.path.clone()),
                Change::Rename(c) => paths.push(c.path.clone()),
                Change::Move(c) => {
                    paths.push(c.src_path.clone());
                    paths.push(c.dest_path.clone());
                }
                Change::Copy(c) => {
                    paths.push(c.src_path.clone());
                    paths.push(c.dest_path.clone());
                }
                Change::MkDir(c) => paths.push(c.path.clone()),
                Change::SetAttributes(c) => paths.push(c.path.clone()),
            }
        }
        paths.sort();
        paths.dedup();
        paths
    }
}

struct ConnectionEntry {
    size: i64,
    updated: Instant,
}

/// Tracks running sizes of open connections and reclaims abandoned entries
/// with a TTL sweeper task.
pub struct ConnectionRegistry {
    entries: Arc<Mutex<HashMap<String, ConnectionEntry>>>,
    ttl: Duration,
    sweep_interval: Duration,
    running: Arc<RwLock<bool>>,
    sweeper: Arc<RwLock<Option<tokio::task::JoinHandle<()>>>>,
}

impl ConnectionRegistry {
    pub fn new(ttl: Duration, sweep_interval: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
            sweep_interval,
            running: Arc::new(RwLock::new(false)),
            sweeper: Arc::new(RwLock::new(None)),
        }
    }

    /// Register or refresh a connection.
    pub fn touch(&self, connection_id: &str) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(connection_id.to_string())
            .or_insert(ConnectionEntry {
                size: 0,
                updated: Instant::now(),
            });
        entry.updated = Instant::now();
    }

    pub fn add_size(&self, connection_id: &str, delta: i64) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(connection_id.to_string())
            .or_insert(ConnectionEntry {
                size: 0,
                updated: Instant::now(),
            });
        entry.size += delta;
        entry.updated = Instant::now();
    }

    pub fn size(&self, connection_id: &str) -> Option<i64> {
        self.entries.lock().get(connection_id).map(|e| e.size)
    }

    pub fn remove(&self, connection_id: &str) {
        self.entries.lock().remove(connection_id);
    }

    /// Drop entries idle longer than the TTL; returns the reclaimed ids.
    pub fn sweep(&self) -> Vec<String> {
        let mut entries = self.entries.lock();
        let now = Instant::now();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.updated) >= self.ttl)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        expired
    }

    /// Start the background TTL sweeper.
    pub fn start(&self) {
        let mut running = self.running.write();
        if *running {
            return;
        }
        *running = true;
        drop(running);

        let entries = Arc::clone(&self.entries);
        let running = Arc::clone(&self.running);
        let ttl = self.ttl;
        let interval = self.sweep_interval;

        let handle = tokio::spawn(async move {
            loop {
                sleep(interval).await;
                if !*running.read() {
                    break;
                }
                let expired = {
                    let mut entries = entries.lock();
                    let now = Instant::now();
                    let expired: Vec<String> = entries
                        .iter()
                        .filter(|(_, e)| now.duration_since(e.updated) >= ttl)
                        .map(|(id, _)| id.clone())
                        .collect();
                    for id in &expired {
                        entries.remove(id);
                    }
                    expired
                };
                if !expired.is_empty() {
                    warn!(
                        reclaimed = expired.len(),
                        connection_ids = ?expired,
                        "Reclaimed abandoned connections"
                    );
                }
            }
        });
        *self.sweeper.write() = Some(handle);
        info!(
            ttl_secs = self.ttl.as_secs(),
            sweep_interval_secs = self.sweep_interval.as_secs(),
            "Started connection TTL sweeper"
        );
    }

    /// Stop the sweeper and wait for it to exit.
    pub async fn stop(&self) {
        {
            let mut running = self.running.write();
            if !*running {
                return;
            }
            *running = false;
        }
        let handle = self.sweeper.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Stopped connection TTL sweeper");
    }
}
