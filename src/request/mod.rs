//! Request pipeline: the external inbox, discovery queue, and the
//! FIFO cluster resolver that gates items before load.

pub mod cluster;
pub mod inbox;

pub use cluster::*;
pub use inbox::*;
