//! Content hashing collaborator.
//!
//! `Send + Sync` so the oracle can fan the hash sweep out over rayon.

use std::path::PathBuf;

use crate::incremental::fingerprint::hash_file;
use crate::item::record::ItemId;

/// The content hashing collaborator.
pub trait ContentHasher: Send + Sync {
    /// Hash of the item's current source content. An error means the
    /// source no longer exists.
    fn content_hash(&self, id: &ItemId) -> Result<String, String>;
}

/// Filesystem content hasher over a source content directory.
#[derive(Debug)]
pub struct FsContentHasher {
    src_root: PathBuf,
}

impl FsContentHasher {
    /// Hasher rooted at `src_root`.
    pub fn new(src_root: PathBuf) -> Self {
        Self { src_root }
    }
}

impl ContentHasher for FsContentHasher {
    fn content_hash(&self, id: &ItemId) -> Result<String, String> {
        let path = self.src_root.join(format!("{}.item", id));
        if !path.is_file() {
            // A generated item has no source of its own; its content is
            // whatever its generator's source produces.
            if let Some(origin) = id.split_origin() {
                return self.content_hash(&origin);
            }
        }
        hash_file(&path).map_err(|e| format!("cannot hash {}: {}", id, e))
    }
}
