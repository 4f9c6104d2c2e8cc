//! Dependency lookup collaborator.
//!
//! Request clusters need the reference graph before items are loaded.
//! The filesystem implementation scans `ref` lines out of `.item`
//! sources without doing a full load.

use std::path::PathBuf;

use crate::item::record::ItemId;

/// The dependency lookup collaborator.
pub trait DependencyProvider: Send {
    /// Direct dependencies of an item. An error means the item itself
    /// cannot be resolved.
    fn dependencies(&mut self, id: &ItemId) -> Result<Vec<ItemId>, String>;

    /// Whether the item exists at all.
    fn exists(&mut self, id: &ItemId) -> bool;
}

/// Filesystem dependency scanner over a source content directory.
#[derive(Debug)]
pub struct FsDependencyProvider {
    src_root: PathBuf,
}

impl FsDependencyProvider {
    /// Scanner rooted at `src_root`.
    pub fn new(src_root: PathBuf) -> Self {
        Self { src_root }
    }

    fn item_path(&self, id: &ItemId) -> PathBuf {
        self.src_root.join(format!("{}.item", id))
    }
}

impl DependencyProvider for FsDependencyProvider {
    fn dependencies(&mut self, id: &ItemId) -> Result<Vec<ItemId>, String> {
        let text = std::fs::read_to_string(self.item_path(id))
            .map_err(|e| format!("cannot read {}: {}", id, e))?;
        let mut deps = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if let Some(target) = line.strip_prefix("ref ") {
                deps.push(ItemId::new(target.trim()));
            }
        }
        Ok(deps)
    }

    fn exists(&mut self, id: &ItemId) -> bool {
        self.item_path(id).is_file()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_fs_dependencies() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("root.item"),
            "object r mesh\nref leaf_a\nref leaf_b\n",
        )
        .unwrap();

        let mut provider = FsDependencyProvider::new(temp.path().to_path_buf());
        let deps = provider.dependencies(&ItemId::new("root")).unwrap();
        assert_eq!(deps, vec![ItemId::new("leaf_a"), ItemId::new("leaf_b")]);
    }

    #[test]
    fn test_fs_exists() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("here.item"), "").unwrap();

        let mut provider = FsDependencyProvider::new(temp.path().to_path_buf());
        assert!(provider.exists(&ItemId::new("here")));
        assert!(!provider.exists(&ItemId::new("gone")));
    }

    #[test]
    fn test_fs_dependencies_missing_item() {
        let temp = TempDir::new().unwrap();
        let mut provider = FsDependencyProvider::new(temp.path().to_path_buf());
        assert!(provider.dependencies(&ItemId::new("gone")).is_err());
    }
}
