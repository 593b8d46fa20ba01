//! Error types for the blobber core.
//!
//! Each subsystem carries its own `thiserror` enum; `BlobberError` is the
//! crate-level umbrella. Validation errors reject before any mutation,
//! integrity errors fail a commit while leaving the temp blob for retry, and
//! invariant violations indicate a bug or corrupted data rather than a
//! transient condition.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Content store errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("file_open_error: {path}: {source}")]
    FileOpen { path: PathBuf, source: io::Error },

    #[error("file_seek_error: {path}: {source}")]
    FileSeek { path: PathBuf, source: io::Error },

    #[error("file_stat_error: {path}: {source}")]
    FileStat { path: PathBuf, source: io::Error },

    #[error("dir_creation_error: {path}: {source}")]
    DirCreation { path: PathBuf, source: io::Error },

    #[error("fixed_merkle_root_mismatch: declared {declared}, computed {computed}")]
    FixedMerkleRootMismatch { declared: String, computed: String },

    #[error("validation_root_mismatch: declared {declared}, computed {computed}")]
    ValidationRootMismatch { declared: String, computed: String },

    #[error("hash_mismatch: declared {declared}, computed {computed}")]
    HashMismatch { declared: String, computed: String },

    /// A concurrent operation on the same content is already in flight.
    /// Callers treat the physical side effect as handled and adjust only
    /// their own counters.
    #[error("not_new_lock: content operation already in flight")]
    NotNewLock,

    #[error("missing temp blob for {path}")]
    MissingTempBlob { path: String },

    #[error("size mismatch: declared {declared}, staged {staged}")]
    SizeMismatch { declared: u64, staged: u64 },

    #[error("missing content blob {hash}")]
    MissingBlob { hash: String },

    #[error("block range [{start}, {end}) out of bounds for {blocks} blocks")]
    BlockOutOfRange {
        start: usize,
        end: usize,
        blocks: usize,
    },

    #[error("invalid shard levels {levels:?}: segments must sum below 64")]
    InvalidShardLevels { levels: Vec<usize> },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Reference tree errors.
#[derive(Debug, Error)]
pub enum TreeError {
    #[error("invalid_parameter: {0}")]
    InvalidParameter(String),

    #[error("invalid_reference_path: {0}")]
    InvalidReferencePath(String),

    #[error("max_alloc_dir_files_reached: limit {limit}")]
    MaxAllocDirFilesReached { limit: u64 },

    #[error("file already exists: {0}")]
    DestinationExists(String),

    #[error("reference not found: {0}")]
    NotFound(String),

    /// Fatal: the load produced two roots or the persisted tree lost its
    /// root. Indicates corruption, not a retryable condition.
    #[error("duplicate root node for allocation {0}")]
    DuplicateRoot(String),

    #[error("missing root node for allocation {0}")]
    MissingRoot(String),

    #[error(transparent)]
    Meta(#[from] MetaError),
}

/// Metadata store errors.
#[derive(Debug, Error)]
pub enum MetaError {
    #[error("metadata row decode failed: {0}")]
    Decode(#[from] Box<bincode::ErrorKind>),

    #[error("metadata transaction aborted: {0}")]
    TransactionAborted(String),

    #[error(transparent)]
    Sled(#[from] sled::Error),
}

/// Connection lifecycle errors.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection {id} is in state {state}, expected {expected}")]
    InvalidState {
        id: String,
        state: String,
        expected: String,
    },

    #[error("connection {0} has no applied tree to finalize")]
    NotApplied(String),

    #[error("unknown connection {0}")]
    Unknown(String),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum BlobberError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Meta(#[from] MetaError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, BlobberError>;

impl BlobberError {
    /// Whether the temp blob survives this failure and the client may retry
    /// the commit with the same staged bytes.
    pub fn is_retryable_commit(&self) -> bool {
        matches!(
            self,
            BlobberError::Store(StoreError::FixedMerkleRootMismatch { .. })
                | BlobberError::Store(StoreError::ValidationRootMismatch { .. })
                | BlobberError::Store(StoreError::HashMismatch { .. })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integrity_errors_are_retryable() {
        let err = BlobberError::from(StoreError::ValidationRootMismatch {
            declared: "aa".into(),
            computed: "bb".into(),
        });
        assert!(err.is_retryable_commit());

        let err = BlobberError::from(TreeError::InvalidParameter("path".into()));
        assert!(!err.is_retryable_commit());
    }

    #[test]
    fn error_identities_render() {
        let err = TreeError::MaxAllocDirFilesReached { limit: 5 };
        assert!(err.to_string().contains("max_alloc_dir_files_reached"));

        let err = StoreError::NotNewLock;
        assert!(err.to_string().contains("not_new_lock"));
    }
}
