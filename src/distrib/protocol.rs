//! Director/worker wire protocol.
//!
//! Small serde-derived message enums so the link layer can stay dumb:
//! the director pushes assignments, retraction requests, fences, and the
//! shutdown signal down; workers push heartbeats, per-item completions,
//! returned batches, and fence acks back up.

use serde::{Deserialize, Serialize};

use crate::item::record::{ItemId, Urgency};
use crate::profile::ProfileId;

/// Identity of a worker within one distributed session.
pub type WorkerId = usize;

/// One item handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkAssignment {
    /// The item to cook
    pub id: ItemId,
    /// Profiles the worker must commit
    pub profiles: Vec<ProfileId>,
    /// Scheduling tier on the worker
    pub urgency: Urgency,
}

/// Messages from the director to one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DirectorMsg {
    /// Cook these items
    Assign(Vec<WorkAssignment>),
    /// Return up to `max` not-yet-finished items for reassignment
    Retract {
        /// Retraction cap for this request
        max: usize,
    },
    /// Ack once every local queue has drained
    Fence {
        /// Fence sequence number, echoed in the ack
        fence: u64,
    },
    /// Finish up and disconnect
    Shutdown,
}

/// Messages from a worker to the director.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WorkerMsg {
    /// Periodic liveness signal
    Heartbeat {
        /// Items currently queued on the worker
        queued: usize,
    },
    /// One assigned item finished (committed or failed)
    ItemDone {
        /// The item
        id: ItemId,
        /// Whether every profile committed successfully
        success: bool,
    },
    /// Items handed back after a retraction request
    Returned {
        /// The returned items, least-progressed first
        items: Vec<ItemId>,
    },
    /// Every local queue has drained past the fence
    FenceAck {
        /// Echo of the fence sequence number
        fence: u64,
    },
    /// The worker is exiting
    ShuttingDown,
}
