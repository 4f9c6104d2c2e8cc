//! Error types for the cook pipeline.
//!
//! Two layers: `DemoteReason` records why a single item left the active
//! pipeline (failure or legitimate skip), and `CookError` is the
//! session-level error returned by top-level entry points. Per-item
//! failures never become `CookError`; they are recorded on the item's
//! profile sub-records and the session keeps going.

use crate::config::ConfigError;
use crate::distrib::TransportError;
use crate::incremental::{RegistryError, SidecarError};

/// Why an item was demoted back to Idle.
///
/// Some variants are failures, others are ordinary outcomes of the
/// incremental decisioning (an already-built item is demoted without
/// being an error).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DemoteReason {
    /// All requested profiles already have committed results
    AlreadyCooked,
    /// Item name matches the configured never-cook list
    NeverCook,
    /// No requested profile actually needs this item
    NotReachable,
    /// The loader failed to open the item
    LoadError(String),
    /// A registered validator rejected the item
    ValidationError(String),
    /// Save preparation or artifact write failed
    SaveError(String),
    /// A generated item whose generator is missing
    OrphanedGenerated,
    /// Distribution could not place the item on any worker
    MultiprocessAssignmentError,
    /// The item name redirected to another item at load time
    Redirected(String),
    /// The session was cancelled while the item was in flight
    CookCanceled,
}

impl DemoteReason {
    /// Whether this reason records a failure (as opposed to a skip).
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DemoteReason::LoadError(_)
                | DemoteReason::ValidationError(_)
                | DemoteReason::SaveError(_)
                | DemoteReason::OrphanedGenerated
                | DemoteReason::MultiprocessAssignmentError
        )
    }
}

impl std::fmt::Display for DemoteReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DemoteReason::AlreadyCooked => write!(f, "already cooked"),
            DemoteReason::NeverCook => write!(f, "never-cook"),
            DemoteReason::NotReachable => write!(f, "not reachable"),
            DemoteReason::LoadError(msg) => write!(f, "load error: {}", msg),
            DemoteReason::ValidationError(msg) => write!(f, "validation error: {}", msg),
            DemoteReason::SaveError(msg) => write!(f, "save error: {}", msg),
            DemoteReason::OrphanedGenerated => write!(f, "orphaned generated item"),
            DemoteReason::MultiprocessAssignmentError => {
                write!(f, "no valid worker assignment")
            }
            DemoteReason::Redirected(target) => write!(f, "redirected to {}", target),
            DemoteReason::CookCanceled => write!(f, "cook cancelled"),
        }
    }
}

/// Session-level error.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum CookError {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    /// Previous-results registry error
    #[error("results registry error: {0}")]
    Registry(#[from] RegistryError),
    /// Settings sidecar error
    #[error("settings sidecar error: {0}")]
    Sidecar(#[from] SidecarError),
    /// Worker transport error
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Any other session-level failure
    #[error("{0}")]
    Session(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_demote_reason_failure_classification() {
        assert!(DemoteReason::LoadError("x".into()).is_failure());
        assert!(DemoteReason::SaveError("x".into()).is_failure());
        assert!(DemoteReason::OrphanedGenerated.is_failure());
        assert!(!DemoteReason::AlreadyCooked.is_failure());
        assert!(!DemoteReason::NeverCook.is_failure());
        assert!(!DemoteReason::CookCanceled.is_failure());
        assert!(!DemoteReason::Redirected("other".into()).is_failure());
    }

    #[test]
    fn test_demote_reason_display() {
        assert_eq!(DemoteReason::AlreadyCooked.to_string(), "already cooked");
        assert_eq!(
            DemoteReason::LoadError("missing file".into()).to_string(),
            "load error: missing file"
        );
        assert_eq!(
            DemoteReason::Redirected("a/b".into()).to_string(),
            "redirected to a/b"
        );
    }
}
