//! Configuration loading.
//!
//! Finds `kiln.toml` by walking up from a starting directory and parses
//! it into [`KilnConfig`]. The directory containing the file becomes the
//! project root.

use std::path::{Path, PathBuf};

use crate::config::schema::KilnConfig;

/// Configuration file name searched for in the project tree.
pub const CONFIG_FILENAME: &str = "kiln.toml";

/// Error while locating or parsing configuration.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// No config file found walking up from the start directory
    #[error("no kiln.toml found in {0} or any parent directory")]
    NotFound(PathBuf),
    /// IO error reading the file
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parse error
    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Walk up from `start` looking for the config file.
pub fn find_config(start: &Path) -> Option<PathBuf> {
    let mut dir = Some(start);
    while let Some(current) = dir {
        let candidate = current.join(CONFIG_FILENAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        dir = current.parent();
    }
    None
}

/// Load configuration.
///
/// With an explicit path, loads that file and uses its parent as the
/// project root. Otherwise searches upward from `start`.
/// Returns the config and the project root.
pub fn load_config(
    explicit: Option<&Path>,
    start: &Path,
) -> Result<(KilnConfig, PathBuf), ConfigError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => find_config(start).ok_or_else(|| ConfigError::NotFound(start.to_path_buf()))?,
    };
    let text = std::fs::read_to_string(&path)?;
    let config: KilnConfig = toml::from_str(&text)?;
    let root = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    Ok((config, root))
}
