//! Per-allocation usage accumulators.
//!
//! File count, committed size, and in-flight temp size per allocation, each
//! behind its own mutex so accounting never contends with content locking.
//! At startup the counters are rebuilt by a bounded worker pool scanning the
//! metadata store and the temp directories on disk. The rebuild is
//! best-effort: writers that start before the scan finishes can race it, so
//! the counters are eventually consistent, never authoritative.

use crate::error::{BlobberError, StoreError};
use crate::meta::MetaStore;
use crate::store::paths::StorePaths;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Counters for one allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationUsage {
    /// Committed file references.
    pub file_count: u64,
    /// Bytes across committed references (logical, pre-dedup).
    pub used_size: u64,
    /// Bytes sitting in temp blobs.
    pub temp_size: u64,
}

/// Map of per-allocation counters.
#[derive(Default)]
pub struct UsageMap {
    inner: Mutex<HashMap<String, Arc<Mutex<AllocationUsage>>>>,
}

impl UsageMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, allocation_id: &str) -> Arc<Mutex<AllocationUsage>> {
        let mut inner = self.inner.lock();
        Arc::clone(
            inner
                .entry(allocation_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(AllocationUsage::default()))),
        )
    }

    pub fn snapshot(&self, allocation_id: &str) -> AllocationUsage {
        *self.entry(allocation_id).lock()
    }

    pub fn add_file(&self, allocation_id: &str, size: u64) {
        let entry = self.entry(allocation_id);
        let mut usage = entry.lock();
        usage.file_count += 1;
        usage.used_size += size;
    }

    pub fn remove_file(&self, allocation_id: &str, size: u64) {
        let entry = self.entry(allocation_id);
        let mut usage = entry.lock();
        usage.file_count = usage.file_count.saturating_sub(1);
        usage.used_size = usage.used_size.saturating_sub(size);
    }

    pub fn add_temp(&self, allocation_id: &str, delta: i64) {
        let entry = self.entry(allocation_id);
        let mut usage = entry.lock();
        usage.temp_size = if delta >= 0 {
            usage.temp_size.saturating_add(delta as u64)
        } else {
            usage.temp_size.saturating_sub(delta.unsigned_abs())
        };
    }

    /// Replace the counters for one allocation wholesale (rebuild path).
    pub fn replace(&self, allocation_id: &str, usage: AllocationUsage) {
        *self.entry(allocation_id).lock() = usage;
    }
}

/// Rebuild counters for every known allocation.
///
/// Committed count/size come from the metadata store; temp size comes from
/// walking the allocation's temp directory. Workers are bounded by a
/// semaphore and the filesystem walk polls `shutdown` between file visits.
pub async fn rebuild_usage(
    usage: Arc<UsageMap>,
    meta: Arc<dyn MetaStore>,
    paths: StorePaths,
    workers: usize,
    shutdown: Arc<AtomicBool>,
) -> Result<(), BlobberError> {
    let allocations = meta.allocations()?;
    let semaphore = Arc::new(Semaphore::new(workers.max(1)));
    let mut handles = Vec::with_capacity(allocations.len());

    for allocation_id in allocations {
        let permit = Arc::clone(&semaphore)
            .acquire_owned()
            .await
            .expect("usage semaphore closed");
        let usage = Arc::clone(&usage);
        let meta = Arc::clone(&meta);
        let paths = paths.clone();
        let shutdown = Arc::clone(&shutdown);

        handles.push(tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if shutdown.load(Ordering::Relaxed) {
                return;
            }
            match rebuild_one(&meta, &paths, &allocation_id, &shutdown) {
                Ok(rebuilt) => {
                    debug!(
                        allocation_id = %allocation_id,
                        file_count = rebuilt.file_count,
                        used_size = rebuilt.used_size,
                        temp_size = rebuilt.temp_size,
                        "Rebuilt allocation usage"
                    );
                    usage.replace(&allocation_id, rebuilt);
                }
                Err(e) => {
                    warn!(
                        allocation_id = %allocation_id,
                        error = %e,
                        "Usage rebuild failed for allocation"
                    );
                }
            }
        }));
    }

    for handle in handles {
        handle.await.map_err(|e| {
            BlobberError::Store(StoreError::Io(std::io::Error::other(e.to_string())))
        })?;
    }
    Ok(())
}

fn rebuild_one(
    meta: &Arc<dyn MetaStore>,
    paths: &StorePaths,
    allocation_id: &str,
    shutdown: &AtomicBool,
) -> Result<AllocationUsage, BlobberError> {
    let (file_count, used_size) = meta.file_stats(allocation_id)?;
    let mut temp_size = 0u64;

    let tmp_root = paths.allocation_dir(allocation_id).join(super::paths::TMP_DIR);
    if tmp_root.exists() {
        for entry in WalkDir::new(&tmp_root).into_iter().filter_map(|e| e.ok()) {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
            if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    temp_size += meta.len();
                }
            }
        }
    }

    Ok(AllocationUsage {
        file_count,
        used_size,
        temp_size,
    })
}
