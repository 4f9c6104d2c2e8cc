//! The incremental build oracle.
//!
//! Decides, per profile, whether previously produced artifacts remain
//! valid. Session validity is coarse: any change to the global settings
//! fingerprint (or a crash flag, or a registry format bump) discards the
//! whole previous build for that profile. When the session is valid,
//! each recorded item is classified by comparing its stored content and
//! dependency hashes against the current sources.
//!
//! Content hashing of the full registry runs as a rayon parallel-for
//! over an immutable snapshot; nothing else is touched concurrently.

use std::collections::HashMap;
use std::path::Path;

use rayon::prelude::*;

use crate::collab::{ContentHasher, DependencyProvider};
use crate::incremental::fingerprint::{combine_hashes, GlobalFingerprint};
use crate::incremental::registry::{RecordedResult, ResultRegistry};
use crate::incremental::sidecar::SettingsSidecar;
use crate::item::record::ItemId;

/// Whether a profile's previous build can be reused at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionValidity {
    /// Previous results may be reused item by item
    Valid,
    /// Previous results are discarded wholesale
    Invalidated(InvalidReason),
}

/// Why a previous build was discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// No previous build exists
    NoPreviousBuild,
    /// The settings fingerprint changed; the differing keys are listed
    FingerprintChanged(Vec<String>),
    /// The previous session left its build-in-progress flag raised
    CrashDetected,
    /// The registry on disk uses an incompatible format version
    RegistryVersionMismatch,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InvalidReason::NoPreviousBuild => write!(f, "no previous build"),
            InvalidReason::FingerprintChanged(keys) => {
                write!(f, "settings fingerprint changed ({})", keys.join(", "))
            }
            InvalidReason::CrashDetected => {
                write!(f, "previous session crashed mid-build")
            }
            InvalidReason::RegistryVersionMismatch => {
                write!(f, "results registry format changed")
            }
        }
    }
}

/// Classification of one previously recorded item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeClass {
    /// Previously built, unchanged: skip entirely
    IdenticalBuilt,
    /// Previously built, content or dependencies changed: rebuild
    ModifiedBuilt,
    /// Previously built, source removed: delete the stale artifact
    RemovedBuilt,
    /// Previously uncooked, unchanged: stays uncooked
    IdenticalUncooked,
    /// Previously uncooked, changed: re-examine
    ModifiedUncooked,
    /// Previously uncooked, source removed: drop the record
    RemovedUncooked,
}

impl ChangeClass {
    /// Whether the classified item needs to go through the cook pipeline
    /// this session.
    pub fn needs_cook(self) -> bool {
        matches!(self, ChangeClass::ModifiedBuilt | ChangeClass::ModifiedUncooked)
    }

    /// Whether the item's source no longer exists.
    pub fn is_removed(self) -> bool {
        matches!(self, ChangeClass::RemovedBuilt | ChangeClass::RemovedUncooked)
    }
}

/// Oracle result for one profile.
#[derive(Debug)]
pub struct ProfileOracle {
    /// Session-level decision
    pub validity: SessionValidity,
    /// Per-item classes; empty when the session was invalidated
    pub classes: HashMap<ItemId, ChangeClass>,
}

impl ProfileOracle {
    /// Oracle that forces a full rebuild.
    pub fn invalidated(reason: InvalidReason) -> Self {
        Self { validity: SessionValidity::Invalidated(reason), classes: HashMap::new() }
    }

    /// Class of a previously recorded item, if any.
    pub fn class_of(&self, id: &ItemId) -> Option<ChangeClass> {
        self.classes.get(id).copied()
    }

    /// Whether an item must be cooked this session. Unrecorded items
    /// always cook.
    pub fn needs_cook(&self, id: &ItemId) -> bool {
        match self.class_of(id) {
            Some(class) => class.needs_cook(),
            None => true,
        }
    }

    /// Ids classified as removed, for the artifact cleanup sweep.
    pub fn removed_items(&self) -> Vec<ItemId> {
        self.classes
            .iter()
            .filter(|(_, class)| class.is_removed())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Compare the stored sidecar against the current fingerprint.
pub fn evaluate_session(
    sidecar: Option<&SettingsSidecar>,
    fingerprint: &GlobalFingerprint,
    registry_loaded: bool,
) -> SessionValidity {
    let sidecar = match sidecar {
        Some(s) => s,
        None => return SessionValidity::Invalidated(InvalidReason::NoPreviousBuild),
    };
    if !registry_loaded {
        return SessionValidity::Invalidated(InvalidReason::NoPreviousBuild);
    }
    if sidecar.crash_detected() {
        return SessionValidity::Invalidated(InvalidReason::CrashDetected);
    }
    if sidecar.fingerprint != fingerprint.digest() {
        let diff = fingerprint.diff_keys(&sidecar.entries);
        return SessionValidity::Invalidated(InvalidReason::FingerprintChanged(diff));
    }
    SessionValidity::Valid
}

/// Classify every recorded item of a valid registry.
///
/// Content hashes of all recorded items are computed in parallel, then a
/// sequential pass compares dependency hashes, verifies artifacts, and
/// applies the generator rule.
pub fn classify_items(
    registry: &ResultRegistry,
    out_dir: &Path,
    hasher: &dyn ContentHasher,
    deps: &mut dyn DependencyProvider,
) -> HashMap<ItemId, ChangeClass> {
    // Parallel content-hash sweep over an immutable snapshot.
    let ids: Vec<&ItemId> = registry.items.keys().collect();
    let current_hashes: HashMap<ItemId, Option<String>> = ids
        .par_iter()
        .map(|id| ((*id).clone(), hasher.content_hash(id).ok()))
        .collect();

    let mut dep_hash_memo: HashMap<ItemId, Option<String>> = HashMap::new();
    let mut classes: HashMap<ItemId, ChangeClass> = HashMap::new();

    for (id, record) in &registry.items {
        let was_built = record.result == RecordedResult::Built;
        let class = match current_hashes.get(id).and_then(|h| h.as_ref()) {
            None => {
                if was_built {
                    ChangeClass::RemovedBuilt
                } else {
                    ChangeClass::RemovedUncooked
                }
            }
            Some(current) if *current != record.content_hash => {
                if was_built {
                    ChangeClass::ModifiedBuilt
                } else {
                    ChangeClass::ModifiedUncooked
                }
            }
            Some(_) => {
                let current_dep_hash =
                    dependency_hash(id, deps, hasher, &current_hashes, &mut dep_hash_memo);
                if current_dep_hash == record.dependency_hash {
                    if was_built {
                        ChangeClass::IdenticalBuilt
                    } else {
                        ChangeClass::IdenticalUncooked
                    }
                } else if was_built {
                    ChangeClass::ModifiedBuilt
                } else {
                    ChangeClass::ModifiedUncooked
                }
            }
        };
        classes.insert(id.clone(), class);
    }

    // Artifact verification sweep: an identical item whose artifacts
    // were deleted or tampered with must rebuild anyway.
    let tampered = registry.verify_artifacts(out_dir);
    for id in tampered {
        if classes.get(&id) == Some(&ChangeClass::IdenticalBuilt) {
            classes.insert(id, ChangeClass::ModifiedBuilt);
        }
    }

    // Generator rule: a generator whose generated set has any unresolved
    // difference is treated as modified so its list is re-evaluated.
    let mut generator_overrides: Vec<ItemId> = Vec::new();
    for (id, record) in &registry.items {
        if record.generated.is_empty() {
            continue;
        }
        if classes.get(id) != Some(&ChangeClass::IdenticalBuilt) {
            continue;
        }
        let unresolved = record.generated.iter().any(|name| {
            let generated_id = ItemId::new(name);
            !matches!(
                classes.get(&generated_id),
                Some(ChangeClass::IdenticalBuilt | ChangeClass::IdenticalUncooked)
            )
        });
        if unresolved {
            generator_overrides.push(id.clone());
        }
    }
    for id in generator_overrides {
        classes.insert(id, ChangeClass::ModifiedBuilt);
    }

    classes
}

/// Current dependency hash of one item: the combined content hashes of
/// its direct dependencies. Missing dependencies contribute a fixed
/// marker so that a dependency appearing or disappearing changes the
/// hash; an item whose own dependency list cannot be scanned hashes as
/// dependency-free.
fn dependency_hash(
    id: &ItemId,
    deps: &mut dyn DependencyProvider,
    hasher: &dyn ContentHasher,
    precomputed: &HashMap<ItemId, Option<String>>,
    memo: &mut HashMap<ItemId, Option<String>>,
) -> String {
    let dep_ids = deps.dependencies(id).unwrap_or_default();
    let mut hashes: Vec<String> = Vec::with_capacity(dep_ids.len());
    for dep in &dep_ids {
        let hash = match precomputed.get(dep) {
            Some(found) => found.clone(),
            None => memo
                .entry(dep.clone())
                .or_insert_with(|| hasher.content_hash(dep).ok())
                .clone(),
        };
        match hash {
            Some(h) => hashes.push(h),
            None => hashes.push(format!("missing:{}", dep)),
        }
    }
    combine_hashes(&mut hashes)
}

/// Dependency hash of one item as it stands now. Recorded into the
/// registry at commit time and compared by [`classify_items`] on the
/// next session.
pub fn current_dependency_hash(
    id: &ItemId,
    deps: &mut dyn DependencyProvider,
    hasher: &dyn ContentHasher,
) -> String {
    dependency_hash(id, deps, hasher, &HashMap::new(), &mut HashMap::new())
}
