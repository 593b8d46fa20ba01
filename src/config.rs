//! Settings for the storage core.
//!
//! A serde-deserializable settings struct with validated defaults. Transport
//! and blockchain configuration live outside this crate; only the knobs the
//! core consumes are defined here.

use crate::error::BlobberError;
use crate::logging::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub limits: LimitSettings,

    #[serde(default)]
    pub connection: ConnectionSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Content store layout settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Root directory for all allocation blobs.
    #[serde(default = "default_base_path")]
    pub base_path: PathBuf,

    /// Shard segment lengths for allocation directories.
    #[serde(default = "default_alloc_levels")]
    pub alloc_dir_levels: Vec<usize>,

    /// Shard segment lengths for content files.
    #[serde(default = "default_file_levels")]
    pub file_dir_levels: Vec<usize>,
}

/// Quota settings enforced by change processors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Maximum non-root entries (files + directories) per allocation.
    #[serde(default = "default_max_alloc_dir_files")]
    pub max_alloc_dir_files: u64,

    /// Worker bound for the startup usage rebuild scan.
    #[serde(default = "default_scan_workers")]
    pub scan_workers: usize,
}

/// Connection registry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Seconds an idle connection survives before the sweeper reclaims it.
    #[serde(default = "default_connection_ttl")]
    pub ttl_secs: u64,

    /// Sweep interval in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_base_path() -> PathBuf {
    PathBuf::from("data/blobs")
}

fn default_alloc_levels() -> Vec<usize> {
    vec![2, 1]
}

fn default_file_levels() -> Vec<usize> {
    vec![2, 2, 1]
}

fn default_max_alloc_dir_files() -> u64 {
    65536
}

fn default_scan_workers() -> usize {
    4
}

fn default_connection_ttl() -> u64 {
    600
}

fn default_sweep_interval() -> u64 {
    30
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            base_path: default_base_path(),
            alloc_dir_levels: default_alloc_levels(),
            file_dir_levels: default_file_levels(),
        }
    }
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_alloc_dir_files: default_max_alloc_dir_files(),
            scan_workers: default_scan_workers(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            ttl_secs: default_connection_ttl(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Settings {
    /// Parse settings from TOML.
    pub fn from_toml_str(raw: &str) -> Result<Self, BlobberError> {
        let settings: Settings = toml::from_str(raw)
            .map_err(|e| BlobberError::Config(format!("invalid settings TOML: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, BlobberError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| BlobberError::Config(format!("read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), BlobberError> {
        validate_levels("storage.alloc_dir_levels", &self.storage.alloc_dir_levels)?;
        validate_levels("storage.file_dir_levels", &self.storage.file_dir_levels)?;
        if self.limits.scan_workers == 0 {
            return Err(BlobberError::Config(
                "limits.scan_workers must be at least 1".to_string(),
            ));
        }
        if self.connection.sweep_interval_secs == 0 {
            return Err(BlobberError::Config(
                "connection.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Shard levels must be non-empty, non-zero segments whose sum stays below
/// the 64 hex characters of a 256-bit hash.
fn validate_levels(field: &str, levels: &[usize]) -> Result<(), BlobberError> {
    if levels.is_empty() || levels.iter().any(|&l| l == 0) {
        return Err(BlobberError::Config(format!(
            "{field}: segments must be non-empty and non-zero"
        )));
    }
    let total: usize = levels.iter().sum();
    if total >= 64 {
        return Err(BlobberError::Config(format!(
            "{field}: segment sum {total} must be below 64"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.storage.alloc_dir_levels, vec![2, 1]);
        assert_eq!(settings.storage.file_dir_levels, vec![2, 2, 1]);
    }

    #[test]
    fn toml_overrides_apply() {
        let settings = Settings::from_toml_str(
            r#"
            [storage]
            base_path = "/var/blobber"
            file_dir_levels = [3, 3]

            [limits]
            max_alloc_dir_files = 5
            "#,
        )
        .unwrap();
        assert_eq!(settings.storage.base_path, PathBuf::from("/var/blobber"));
        assert_eq!(settings.storage.file_dir_levels, vec![3, 3]);
        assert_eq!(settings.limits.max_alloc_dir_files, 5);
        // Untouched sections keep defaults.
        assert_eq!(settings.connection.ttl_secs, 600);
    }

    #[test]
    fn oversized_levels_rejected() {
        let err = Settings::from_toml_str(
            r#"
            [storage]
            file_dir_levels = [32, 32]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("below 64"));
    }

    #[test]
    fn zero_segment_rejected() {
        let err = Settings::from_toml_str(
            r#"
            [storage]
            alloc_dir_levels = [2, 0]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("non-zero"));
    }
}
