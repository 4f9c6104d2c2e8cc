//! Settings sidecar file.
//!
//! A small JSON file next to each profile's artifacts holding the
//! settings fingerprint of the build that produced them, plus a
//! build-in-progress flag. The flag is raised at session start and
//! cleared on clean shutdown; finding it already raised means the
//! previous build crashed mid-write and its outputs cannot be trusted.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::incremental::registry::format_timestamp;

/// Default sidecar filename inside a profile's output directory.
pub const SIDECAR_FILENAME: &str = ".kiln-session.json";

/// Error during sidecar operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum SidecarError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persisted session settings for one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsSidecar {
    /// Digest of the fingerprint that produced the current artifacts
    pub fingerprint: String,
    /// The individual fingerprint entries, kept for diff diagnostics
    pub entries: BTreeMap<String, String>,
    /// True while a build session is running; a leftover true means the
    /// previous session crashed
    pub build_in_progress: bool,
    /// When the sidecar was last written
    pub updated_at: String,
}

impl SettingsSidecar {
    /// Fresh sidecar with no recorded build.
    pub fn new() -> Self {
        Self {
            fingerprint: String::new(),
            entries: BTreeMap::new(),
            build_in_progress: false,
            updated_at: format_timestamp(SystemTime::now()),
        }
    }

    /// Load a sidecar from a file. Returns `Ok(None)` if absent.
    pub fn load(path: &Path) -> Result<Option<Self>, SidecarError> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        Ok(Some(serde_json::from_reader(reader)?))
    }

    /// Load from the default location in a profile output directory.
    pub fn load_from_dir(out_dir: &Path) -> Result<Option<Self>, SidecarError> {
        Self::load(&out_dir.join(SIDECAR_FILENAME))
    }

    /// Save the sidecar to a file.
    pub fn save(&mut self, path: &Path) -> Result<(), SidecarError> {
        self.updated_at = format_timestamp(SystemTime::now());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    /// Save to the default location in a profile output directory.
    pub fn save_to_dir(&mut self, out_dir: &Path) -> Result<(), SidecarError> {
        self.save(&out_dir.join(SIDECAR_FILENAME))
    }

    /// Whether a previous session left the in-progress flag raised.
    pub fn crash_detected(&self) -> bool {
        self.build_in_progress
    }
}

impl Default for SettingsSidecar {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sidecar_new() {
        let sidecar = SettingsSidecar::new();
        assert!(sidecar.fingerprint.is_empty());
        assert!(!sidecar.build_in_progress);
    }

    #[test]
    fn test_sidecar_save_load() {
        let temp = TempDir::new().unwrap();
        let mut sidecar = SettingsSidecar::new();
        sidecar.fingerprint = "abc123".to_string();
        sidecar.entries.insert("setting.compression".to_string(), "zstd".to_string());
        sidecar.build_in_progress = true;
        sidecar.save_to_dir(temp.path()).unwrap();

        let loaded = SettingsSidecar::load_from_dir(temp.path()).unwrap().unwrap();
        assert_eq!(loaded.fingerprint, "abc123");
        assert!(loaded.crash_detected());
        assert_eq!(loaded.entries.len(), 1);
    }

    #[test]
    fn test_sidecar_load_missing() {
        let temp = TempDir::new().unwrap();
        assert!(SettingsSidecar::load_from_dir(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_sidecar_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let nested = temp.path().join("out/profile");
        let mut sidecar = SettingsSidecar::new();
        sidecar.save_to_dir(&nested).unwrap();
        assert!(nested.join(SIDECAR_FILENAME).exists());
    }
}
