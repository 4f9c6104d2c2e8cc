//! Save pipeline: the async-cache table, the prepare-save sub-machine,
//! and the queue pump that writes and commits prepared items.

pub mod cache;
pub mod prepare;
pub mod queue;

pub use cache::*;
pub use prepare::*;
pub use queue::*;
