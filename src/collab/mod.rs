//! Collaborator boundary.
//!
//! The cooker drives external systems through the narrow traits in this
//! module: loading, artifact writing, async readiness, dependency
//! lookup, content hashing, and item splitting. Filesystem-backed
//! reference implementations let the binary cook a real directory tree
//! and give the tests something concrete to exercise.

pub mod deps;
pub mod hasher;
pub mod loader;
pub mod readiness;
pub mod splitter;
pub mod writer;

pub use deps::*;
pub use hasher::*;
pub use loader::*;
pub use readiness::*;
pub use splitter::*;
pub use writer::*;

use std::path::Path;

/// The full collaborator set a session runs against.
pub struct Collaborators {
    /// Item loading
    pub loader: Box<dyn ItemLoader>,
    /// Artifact writing
    pub writer: Box<dyn ArtifactWriter>,
    /// Async per-object readiness
    pub readiness: Box<dyn ReadinessProvider>,
    /// Dependency lookup for request clusters
    pub deps: Box<dyn DependencyProvider>,
    /// Content hashing for the incremental oracle
    pub hasher: Box<dyn ContentHasher>,
    /// Splitter hooks, resolved once per item
    pub splitters: SplitterRegistry,
}

impl Collaborators {
    /// Filesystem collaborators rooted at a source content directory,
    /// with the default object-class splitter registered.
    pub fn filesystem(src_root: &Path) -> Self {
        let mut splitters = SplitterRegistry::new();
        splitters.register(Box::new(ObjectClassSplitter::new("generator")));
        Self {
            loader: Box::new(FsItemLoader::new(src_root.to_path_buf())),
            writer: Box::new(FsArtifactWriter::new()),
            readiness: Box::new(ImmediateReadiness::new()),
            deps: Box::new(FsDependencyProvider::new(src_root.to_path_buf())),
            hasher: Box::new(FsContentHasher::new(src_root.to_path_buf())),
            splitters,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("splitters", &self.splitters)
            .finish_non_exhaustive()
    }
}
