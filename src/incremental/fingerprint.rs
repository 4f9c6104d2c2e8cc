//! Content hashing and the global settings fingerprint.
//!
//! Hashes are FNV-1a, fast and stable across runs, which is all build
//! tracking needs. The global fingerprint condenses every setting that
//! can invalidate a profile's previous build into one digest; if it
//! changes between sessions the whole profile is rebuilt.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::KilnConfig;
use crate::profile::TargetProfile;

/// Artifact/registry format version. Bumping this invalidates every
/// previous build.
pub const FORMAT_VERSION: u32 = 3;

/// FNV-1a hash algorithm.
pub fn fnv1a_hash(data: &[u8]) -> u64 {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in data {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// FNV-1a of `data`, rendered as a fixed-width hex string.
pub fn hash_hex(data: &[u8]) -> String {
    format!("{:016x}", fnv1a_hash(data))
}

/// Compute a hash of a file's contents.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let contents = std::fs::read(path)?;
    Ok(hash_hex(&contents))
}

/// Combine a set of content hashes into one dependency hash. Input
/// order does not matter.
pub fn combine_hashes<S: AsRef<str>>(hashes: &mut [S]) -> String {
    hashes.sort_by(|a, b| a.as_ref().cmp(b.as_ref()));
    let mut buf = String::new();
    for hash in hashes.iter() {
        buf.push_str(hash.as_ref());
        buf.push('\n');
    }
    hash_hex(buf.as_bytes())
}

/// The global settings/version fingerprint of one profile.
///
/// Holds the individual entries (for diffing in diagnostics) plus the
/// digest that gets compared against the stored sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalFingerprint {
    /// Every contributing key-value pair
    pub entries: BTreeMap<String, String>,
}

impl GlobalFingerprint {
    /// Compute the fingerprint for a profile under the given config.
    pub fn compute(config: &KilnConfig, profile: &TargetProfile) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert("cooker.version".to_string(), env!("CARGO_PKG_VERSION").to_string());
        entries.insert("format.version".to_string(), FORMAT_VERSION.to_string());
        entries.insert("project.name".to_string(), config.project.name.clone());
        entries.insert("project.version".to_string(), config.project.version.clone());
        entries.insert("profile.name".to_string(), profile.name.clone());
        entries.insert(
            "generation.order".to_string(),
            format!("{:?}", config.generation.order),
        );
        entries.insert("never_cook".to_string(), config.never_cook.join(";"));
        for (key, value) in &profile.settings {
            entries.insert(format!("setting.{}", key), value.clone());
        }
        Self { entries }
    }

    /// Digest of all entries, stable across runs.
    pub fn digest(&self) -> String {
        let mut buf = String::new();
        for (key, value) in &self.entries {
            buf.push_str(key);
            buf.push('=');
            buf.push_str(value);
            buf.push('\n');
        }
        hash_hex(buf.as_bytes())
    }

    /// Keys whose values differ between two fingerprints, for the
    /// invalidation diagnostic.
    pub fn diff_keys(&self, stored: &BTreeMap<String, String>) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        for (key, value) in &self.entries {
            if stored.get(key) != Some(value) {
                keys.push(key.clone());
            }
        }
        for key in stored.keys() {
            if !self.entries.contains_key(key) {
                keys.push(key.clone());
            }
        }
        keys.sort();
        keys.dedup();
        keys
    }
}
