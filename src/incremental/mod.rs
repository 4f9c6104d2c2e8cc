//! Incremental build support: content hashing, the settings sidecar,
//! the previous-results registry, and the change oracle that decides
//! what can be reused from the last session.

pub mod fingerprint;
pub mod oracle;
pub mod registry;
pub mod sidecar;

pub use fingerprint::*;
pub use oracle::*;
pub use registry::*;
pub use sidecar::*;
