//! Multiprocess distribution: the director/worker split.
//!
//! A director session partitions cluster-resolved batches across worker
//! sessions over a typed message protocol, reclaims work from overloaded
//! workers through the retraction protocol, and fences phase transitions
//! until every worker acknowledges. The shipped transport is in-process
//! channel pairs; the director only sees the [`DirectorLink`] trait.

pub mod assign;
pub mod director;
pub mod protocol;
pub mod retract;
pub mod transport;
pub mod worker;

pub use assign::*;
pub use director::*;
pub use protocol::*;
pub use retract::*;
pub use transport::*;
pub use worker::*;
