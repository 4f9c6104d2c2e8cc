//! Request provenance.
//!
//! Every request and discovery carries an instigator: a short,
//! human-readable explanation of why the item entered the pipeline.
//! Instigators chain through dependencies, so diagnostics can answer
//! "why was this cooked" without replaying the session.

use std::fmt;

use crate::item::record::ItemId;

/// What caused an item to be requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstigatorKind {
    /// Named on the command line or in the startup request set
    CommandLine,
    /// Requested through the external request interface at runtime
    BuildRequest,
    /// Discovered as a dependency of another item during load
    Dependency,
    /// Produced by a generator item's split
    Generated,
    /// Assigned by the distribution director
    Director,
    /// Origin unknown (deserialized from an old registry, etc.)
    Unknown,
}

impl fmt::Display for InstigatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstigatorKind::CommandLine => write!(f, "command line"),
            InstigatorKind::BuildRequest => write!(f, "build request"),
            InstigatorKind::Dependency => write!(f, "dependency"),
            InstigatorKind::Generated => write!(f, "generated"),
            InstigatorKind::Director => write!(f, "director"),
            InstigatorKind::Unknown => write!(f, "unknown"),
        }
    }
}

/// Provenance of one request: the kind plus the referencing item, when
/// there is one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instigator {
    /// What kind of cause
    pub kind: InstigatorKind,
    /// The item that caused this one to be requested, if any
    pub referencer: Option<ItemId>,
}

impl Instigator {
    /// Instigator for startup/command-line requests.
    pub fn command_line() -> Self {
        Self { kind: InstigatorKind::CommandLine, referencer: None }
    }

    /// Instigator for runtime build requests.
    pub fn build_request() -> Self {
        Self { kind: InstigatorKind::BuildRequest, referencer: None }
    }

    /// Instigator for a dependency discovered while processing
    /// `referencer`.
    pub fn dependency(referencer: ItemId) -> Self {
        Self { kind: InstigatorKind::Dependency, referencer: Some(referencer) }
    }

    /// Instigator for an item generated by `generator`.
    pub fn generated(generator: ItemId) -> Self {
        Self { kind: InstigatorKind::Generated, referencer: Some(generator) }
    }

    /// Instigator for a director assignment.
    pub fn director() -> Self {
        Self { kind: InstigatorKind::Director, referencer: None }
    }
}

impl fmt::Display for Instigator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.referencer {
            Some(referencer) => write!(f, "{} of {}", self.kind, referencer),
            None => write!(f, "{}", self.kind),
        }
    }
}
