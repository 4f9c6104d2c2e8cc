//! Target output profiles.
//!
//! A profile is one output target (a platform flavor) with its own
//! output directory, settings, previous-results registry and settings
//! sidecar. The profile manager owns the per-profile data for a session;
//! artifact writing goes through the writer collaborator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::KilnConfig;
use crate::incremental::{GlobalFingerprint, ResultRegistry, SettingsSidecar};

/// Dense index of a profile within the session's active profile set.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(transparent)]
pub struct ProfileId(usize);

impl ProfileId {
    /// Wrap a dense index.
    pub fn new(index: usize) -> Self {
        ProfileId(index)
    }

    /// The dense index.
    pub fn index(self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ProfileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "profile#{}", self.0)
    }
}

/// One target output profile.
#[derive(Debug, Clone)]
pub struct TargetProfile {
    /// Profile name from config (e.g. "desktop", "handheld")
    pub name: String,
    /// Output directory for this profile's artifacts
    pub out_dir: PathBuf,
    /// Profile settings that feed the global fingerprint
    pub settings: BTreeMap<String, String>,
}

/// Per-profile session state: the profile itself plus its loaded
/// registry, sidecar, and current fingerprint.
#[derive(Debug)]
pub struct ProfileState {
    /// The profile
    pub profile: TargetProfile,
    /// Previous-results registry, rewritten at session end
    pub registry: ResultRegistry,
    /// Settings sidecar, used for crash detection and fingerprinting
    pub sidecar: SettingsSidecar,
    /// Fingerprint computed for this session
    pub fingerprint: GlobalFingerprint,
}

/// The session's active profile set.
#[derive(Debug, Default)]
pub struct ProfileManager {
    profiles: Vec<ProfileState>,
}

impl ProfileManager {
    /// Build the active profile set from config. Registries and sidecars
    /// start empty; the session loads them during startup.
    pub fn from_config(config: &KilnConfig, root: &Path) -> Self {
        let out_root = root.join(&config.project.out);
        let mut profiles = Vec::new();
        for (name, profile_cfg) in &config.profiles {
            if !profile_cfg.enabled {
                continue;
            }
            let out_dir = match &profile_cfg.out {
                Some(sub) => out_root.join(sub),
                None => out_root.join(name),
            };
            let profile = TargetProfile {
                name: name.clone(),
                out_dir,
                settings: profile_cfg.settings.clone(),
            };
            let fingerprint = GlobalFingerprint::compute(config, &profile);
            profiles.push(ProfileState {
                profile,
                registry: ResultRegistry::new(),
                sidecar: SettingsSidecar::new(),
                fingerprint,
            });
        }
        Self { profiles }
    }

    /// Number of active profiles.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether there are no active profiles.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// All profile ids.
    pub fn ids(&self) -> impl Iterator<Item = ProfileId> {
        (0..self.profiles.len()).map(ProfileId::new)
    }

    /// Profile state by id.
    pub fn state(&self, id: ProfileId) -> &ProfileState {
        &self.profiles[id.index()]
    }

    /// Mutable profile state by id.
    pub fn state_mut(&mut self, id: ProfileId) -> &mut ProfileState {
        &mut self.profiles[id.index()]
    }

    /// The profile by id.
    pub fn profile(&self, id: ProfileId) -> &TargetProfile {
        &self.profiles[id.index()].profile
    }

    /// Find a profile id by name.
    pub fn find(&self, name: &str) -> Option<ProfileId> {
        self.profiles.iter().position(|p| p.profile.name == name).map(ProfileId::new)
    }

    /// Iterate states with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (ProfileId, &ProfileState)> {
        self.profiles.iter().enumerate().map(|(i, p)| (ProfileId::new(i), p))
    }

    /// Iterate states mutably with their ids.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ProfileId, &mut ProfileState)> {
        self.profiles.iter_mut().enumerate().map(|(i, p)| (ProfileId::new(i), p))
    }
}
