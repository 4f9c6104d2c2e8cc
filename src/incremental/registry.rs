//! Previous-results registry.
//!
//! One registry per profile, stored as JSON in the profile's output
//! directory. It records, for every item the profile has seen, the
//! content and dependency hashes at cook time, the recorded result kind,
//! and the artifact paths with checksums. The incremental oracle reads
//! it at session start; the session rewrites it at the end.
//!
//! # Registry Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "updated_at": "2024-01-15T10:35:00Z",
//!   "items": {
//!     "characters/hero": {
//!       "content_hash": "abc123...",
//!       "dependency_hash": "def456...",
//!       "result": "built",
//!       "artifacts": ["characters/hero.art"],
//!       "artifact_checksums": { "characters/hero.art": "789abc..." },
//!       "generated": []
//!     }
//!   }
//! }
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::Path;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::incremental::fingerprint::hash_file;
use crate::item::record::ItemId;
use crate::report::CookStats;

/// Current registry format version.
pub const REGISTRY_VERSION: u32 = 1;

/// Default registry filename inside a profile's output directory.
pub const REGISTRY_FILENAME: &str = ".kiln-results.json";

/// Error during registry operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RegistryError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Version mismatch
    #[error("registry version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Kind of result recorded for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordedResult {
    /// Artifacts were produced and committed
    Built,
    /// The item was examined and legitimately not cooked
    Uncooked,
    /// Never-cook placeholder
    NeverCook,
}

/// Registry entry for one item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResultRecord {
    /// Content hash of the item's source at cook time
    pub content_hash: String,
    /// Combined hash over the item's dependencies at cook time
    pub dependency_hash: String,
    /// What kind of result was recorded
    pub result: RecordedResult,
    /// Artifact paths relative to the profile output directory
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    /// Artifact checksums for the verification sweep
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifact_checksums: BTreeMap<String, String>,
    /// Items generated by this item at cook time (generators only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub generated: Vec<String>,
}

/// Previous cook results for one profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRegistry {
    /// Registry format version
    pub version: u32,
    /// When the registry was last written
    pub updated_at: String,
    /// Per-item records
    pub items: BTreeMap<ItemId, ItemResultRecord>,
    /// Aggregate statistics of the last session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<CookStats>,
}

impl ResultRegistry {
    /// New empty registry.
    pub fn new() -> Self {
        Self {
            version: REGISTRY_VERSION,
            updated_at: format_timestamp(SystemTime::now()),
            items: BTreeMap::new(),
            stats: None,
        }
    }

    /// Load a registry from a file.
    ///
    /// Returns `Ok(None)` if the file doesn't exist.
    pub fn load(path: &Path) -> Result<Option<Self>, RegistryError> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let registry: ResultRegistry = serde_json::from_reader(reader)?;

        if registry.version != REGISTRY_VERSION {
            return Err(RegistryError::VersionMismatch {
                expected: REGISTRY_VERSION,
                found: registry.version,
            });
        }
        Ok(Some(registry))
    }

    /// Load from the default location in a profile output directory.
    pub fn load_from_dir(out_dir: &Path) -> Result<Option<Self>, RegistryError> {
        Self::load(&out_dir.join(REGISTRY_FILENAME))
    }

    /// Save the registry to a file.
    pub fn save(&mut self, path: &Path) -> Result<(), RegistryError> {
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
    pub fn save_to_dir(&mut self, out_dir: &Path) -> Result<(), RegistryError> {
        self.save(&out_dir.join(REGISTRY_FILENAME))
    }

    /// Record a result for an item, replacing any previous record.
    pub fn record(&mut self, id: &ItemId, record: ItemResultRecord) {
        self.items.insert(id.clone(), record);
    }

    /// Get the record for an item.
    pub fn get(&self, id: &ItemId) -> Option<&ItemResultRecord> {
        self.items.get(id)
    }

    /// Remove the record for an item.
    pub fn remove(&mut self, id: &ItemId) -> Option<ItemResultRecord> {
        self.items.remove(id)
    }

    /// Number of recorded items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the registry has no records.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Drop every record (full-rebuild invalidation).
    pub fn clear(&mut self) {
        self.items.clear();
        self.stats = None;
    }

    /// Verify recorded artifact checksums against the files on disk.
    ///
    /// Returns the ids whose artifacts are missing or changed.
    pub fn verify_artifacts(&self, out_dir: &Path) -> Vec<ItemId> {
        let mut changed = Vec::new();
        for (id, record) in &self.items {
            if record.result != RecordedResult::Built {
                continue;
            }
            for artifact in &record.artifacts {
                let path = out_dir.join(artifact);
                if !path.exists() {
                    changed.push(id.clone());
                    break;
                }
                if let Some(expected) = record.artifact_checksums.get(artifact) {
                    match hash_file(&path) {
                        Ok(actual) if &actual == expected => {}
                        _ => {
                            changed.push(id.clone());
                            break;
                        }
                    }
                }
            }
        }
        changed
    }
}

impl Default for ResultRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a SystemTime as an ISO 8601 timestamp string.
pub(crate) fn format_timestamp(time: SystemTime) -> String {
    let duration = time.duration_since(SystemTime::UNIX_EPOCH).unwrap_or_default();
    let secs = duration.as_secs();

    let days = secs / 86400;
    let remaining = secs % 86400;
    let hours = remaining / 3600;
    let minutes = (remaining % 3600) / 60;
    let seconds = remaining % 60;

    let (year, month, day) = days_to_ymd(days as i64);
    format!("{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z", year, month, day, hours, minutes, seconds)
}

/// Convert days since Unix epoch to year/month/day.
fn days_to_ymd(days: i64) -> (i32, u32, u32) {
    let mut remaining_days = days;
    let mut year = 1970i32;

    loop {
        let days_in_year = if is_leap_year(year) { 366 } else { 365 };
        if remaining_days < days_in_year {
            break;
        }
        remaining_days -= days_in_year;
        year += 1;
    }

    let leap = is_leap_year(year);
    let days_in_months: [i64; 12] = if leap {
        [31, 29, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    } else {
        [31, 28, 31, 30, 31, 30, 31, 31, 30, 31, 30, 31]
    };

    let mut month = 1u32;
    for days_in_month in days_in_months {
        if remaining_days < days_in_month {
            break;
        }
        remaining_days -= days_in_month;
        month += 1;
    }

    (year, month, remaining_days as u32 + 1)
}

/// Check if a year is a leap year.
fn is_leap_year(year: i32) -> bool {
    (year % 4 == 0 && year % 100 != 0) || (year % 400 == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn built_record(content: &str) -> ItemResultRecord {
        ItemResultRecord {
            content_hash: content.to_string(),
            dependency_hash: "deps".to_string(),
            result: RecordedResult::Built,
            artifacts: vec!["a.art".to_string()],
            artifact_checksums: BTreeMap::new(),
            generated: vec![],
        }
    }

    #[test]
    fn test_registry_new_empty() {
        let registry = ResultRegistry::new();
        assert_eq!(registry.version, REGISTRY_VERSION);
        assert!(registry.is_empty());
        assert!(!registry.updated_at.is_empty());
    }

    #[test]
    fn test_registry_record_and_get() {
        let mut registry = ResultRegistry::new();
        let id = ItemId::new("chars/hero");
        registry.record(&id, built_record("abc"));

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&id).unwrap().content_hash, "abc");
        registry.remove(&id);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_save_load() {
        let temp = TempDir::new().unwrap();
        let mut registry = ResultRegistry::new();
        registry.record(&ItemId::new("a"), built_record("h1"));
        registry.save_to_dir(temp.path()).unwrap();

        let loaded = ResultRegistry::load_from_dir(temp.path()).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.get(&ItemId::new("a")).unwrap().content_hash, "h1");
    }

    #[test]
    fn test_registry_load_nonexistent() {
        let temp = TempDir::new().unwrap();
        assert!(ResultRegistry::load_from_dir(temp.path()).unwrap().is_none());
    }

    #[test]
    fn test_registry_version_mismatch() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(REGISTRY_FILENAME);
        std::fs::write(
            &path,
            r#"{"version": 99, "updated_at": "x", "items": {}}"#,
        )
        .unwrap();

        let err = ResultRegistry::load(&path).unwrap_err();
        assert!(matches!(err, RegistryError::VersionMismatch { found: 99, .. }));
    }

    #[test]
    fn test_verify_artifacts_missing() {
        let temp = TempDir::new().unwrap();
        let mut registry = ResultRegistry::new();
        registry.record(&ItemId::new("a"), built_record("h"));

        let changed = registry.verify_artifacts(temp.path());
        assert_eq!(changed, vec![ItemId::new("a")]);
    }

    #[test]
    fn test_verify_artifacts_checksum_mismatch() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.art"), "payload").unwrap();

        let mut record = built_record("h");
        record
            .artifact_checksums
            .insert("a.art".to_string(), hash_file(&temp.path().join("a.art")).unwrap());

        let mut registry = ResultRegistry::new();
        registry.record(&ItemId::new("a"), record);
        assert!(registry.verify_artifacts(temp.path()).is_empty());

        std::fs::write(temp.path().join("a.art"), "tampered").unwrap();
        assert_eq!(registry.verify_artifacts(temp.path()), vec![ItemId::new("a")]);
    }

    #[test]
    fn test_verify_skips_uncooked() {
        let temp = TempDir::new().unwrap();
        let mut record = built_record("h");
        record.result = RecordedResult::Uncooked;
        record.artifacts.clear();

        let mut registry = ResultRegistry::new();
        registry.record(&ItemId::new("a"), record);
        assert!(registry.verify_artifacts(temp.path()).is_empty());
    }

    #[test]
    fn test_format_timestamp_epoch() {
        assert_eq!(format_timestamp(SystemTime::UNIX_EPOCH), "1970-01-01T00:00:00Z");
    }

    #[test]
    fn test_days_to_ymd() {
        assert_eq!(days_to_ymd(0), (1970, 1, 1));
        assert_eq!(days_to_ymd(365), (1971, 1, 1));
        let days_to_2000 = 30 * 365 + 7;
        assert_eq!(days_to_ymd(days_to_2000), (2000, 1, 1));
    }

    #[test]
    fn test_is_leap_year() {
        assert!(!is_leap_year(1970));
        assert!(is_leap_year(1972));
        assert!(!is_leap_year(1900));
        assert!(is_leap_year(2000));
    }
}
