//! Artifact writing collaborator.
//!
//! One writer serves every profile; each call names the profile it
//! applies to. Writes are buffered per (profile, item) between `open`
//! and `commit` so a failed item never leaves a partial artifact.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::SystemTime;

use crate::incremental::fingerprint::hash_hex;
use crate::item::record::{CookObject, ItemId};
use crate::profile::TargetProfile;

/// What a commit produced: artifact paths relative to the profile's
/// output directory, plus their checksums.
#[derive(Debug, Clone, Default)]
pub struct CommittedArtifact {
    /// Relative artifact paths
    pub artifacts: Vec<String>,
    /// Checksum per artifact path
    pub checksums: BTreeMap<String, String>,
}

/// The artifact writing collaborator.
pub trait ArtifactWriter: Send {
    /// Begin writing an item for a profile. Discards any previous
    /// uncommitted buffer for the same (profile, item).
    fn open_item(&mut self, profile: &TargetProfile, id: &ItemId) -> Result<(), String>;

    /// Append one object's payload to the open item.
    fn write_object(
        &mut self,
        profile: &TargetProfile,
        id: &ItemId,
        object: &CookObject,
        payload: &[u8],
    ) -> Result<(), String>;

    /// Atomically publish the open item's artifact.
    fn commit_item(
        &mut self,
        profile: &TargetProfile,
        id: &ItemId,
    ) -> Result<CommittedArtifact, String>;

    /// Delete any artifacts previously produced for an item.
    fn remove_artifacts(&mut self, profile: &TargetProfile, id: &ItemId) -> Result<(), String>;

    /// Timestamp of the profile's previous build output, if any.
    fn previous_build_timestamp(&self, profile: &TargetProfile) -> Option<SystemTime>;
}

/// Filesystem writer producing one `.art` file per item.
#[derive(Debug, Default)]
pub struct FsArtifactWriter {
    pending: HashMap<(String, ItemId), Vec<u8>>,
}

impl FsArtifactWriter {
    /// New writer with no open items.
    pub fn new() -> Self {
        Self::default()
    }

    fn artifact_rel(id: &ItemId) -> String {
        format!("{}.art", id)
    }

    fn artifact_path(profile: &TargetProfile, id: &ItemId) -> PathBuf {
        profile.out_dir.join(Self::artifact_rel(id))
    }
}

impl ArtifactWriter for FsArtifactWriter {
    fn open_item(&mut self, profile: &TargetProfile, id: &ItemId) -> Result<(), String> {
        let mut header = Vec::new();
        header.extend_from_slice(b"kilnart 1\n");
        header.extend_from_slice(format!("item {}\n", id).as_bytes());
        header.extend_from_slice(format!("profile {}\n", profile.name).as_bytes());
        self.pending.insert((profile.name.clone(), id.clone()), header);
        Ok(())
    }

    fn write_object(
        &mut self,
        profile: &TargetProfile,
        id: &ItemId,
        object: &CookObject,
        payload: &[u8],
    ) -> Result<(), String> {
        let buffer = self
            .pending
            .get_mut(&(profile.name.clone(), id.clone()))
            .ok_or_else(|| format!("{}: write_object before open_item", id))?;
        buffer.extend_from_slice(
            format!("object {} {} {}\n", object.name, object.class, payload.len()).as_bytes(),
        );
        buffer.extend_from_slice(payload);
        buffer.push(b'\n');
        Ok(())
    }

    fn commit_item(
        &mut self,
        profile: &TargetProfile,
        id: &ItemId,
    ) -> Result<CommittedArtifact, String> {
        let buffer = self
            .pending
            .remove(&(profile.name.clone(), id.clone()))
            .ok_or_else(|| format!("{}: commit_item before open_item", id))?;
        let path = Self::artifact_path(profile, id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("{}: cannot create output dir: {}", id, e))?;
        }
        std::fs::write(&path, &buffer)
            .map_err(|e| format!("{}: cannot write artifact: {}", id, e))?;

        let rel = Self::artifact_rel(id);
        let mut checksums = BTreeMap::new();
        checksums.insert(rel.clone(), hash_hex(&buffer));
        Ok(CommittedArtifact { artifacts: vec![rel], checksums })
    }

    fn remove_artifacts(&mut self, profile: &TargetProfile, id: &ItemId) -> Result<(), String> {
        let path = Self::artifact_path(profile, id);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("{}: cannot remove artifact: {}", id, e)),
        }
    }

    fn previous_build_timestamp(&self, profile: &TargetProfile) -> Option<SystemTime> {
        let registry = profile.out_dir.join(crate::incremental::REGISTRY_FILENAME);
        std::fs::metadata(registry).and_then(|m| m.modified()).ok()
    }
}
