//! External request and discovery channels.
//!
//! Build requests arrive from outside the scheduler thread (CLI, serve
//! mode, the director); discoveries arrive from load results. Both flow
//! through typed channels with explicit drain points in the tick, never
//! through callback fan-out.

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::item::instigator::Instigator;
use crate::item::record::{ItemId, Urgency, WorkerPin};
use crate::profile::ProfileId;

/// One external build request.
#[derive(Debug, Clone)]
pub struct BuildRequest {
    /// Requested item
    pub id: ItemId,
    /// Profiles to build for; empty means every active profile
    pub profiles: Vec<ProfileId>,
    /// Scheduling tier
    pub urgency: Urgency,
    /// Why the item is requested
    pub instigator: Instigator,
    /// Worker placement constraint
    pub pin: WorkerPin,
}

impl BuildRequest {
    /// Request for every active profile at normal urgency.
    pub fn new(id: ItemId, instigator: Instigator) -> Self {
        Self { id, profiles: Vec::new(), urgency: Urgency::Normal, instigator, pin: WorkerPin::None }
    }

    /// Restrict to specific profiles.
    pub fn with_profiles(mut self, profiles: Vec<ProfileId>) -> Self {
        self.profiles = profiles;
        self
    }

    /// Set the urgency tier.
    pub fn with_urgency(mut self, urgency: Urgency) -> Self {
        self.urgency = urgency;
        self
    }

    /// Set a worker placement constraint.
    pub fn with_pin(mut self, pin: WorkerPin) -> Self {
        self.pin = pin;
        self
    }
}

/// A dependency discovered while loading or transforming an item.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    /// Discovered item
    pub id: ItemId,
    /// Profiles the discovery applies to
    pub profiles: Vec<ProfileId>,
    /// Provenance chain
    pub instigator: Instigator,
    /// Inherited urgency
    pub urgency: Urgency,
}

/// Sending half of the request inbox, handed to external callers.
#[derive(Debug, Clone)]
pub struct RequestSender {
    tx: Sender<BuildRequest>,
}

impl RequestSender {
    /// Submit a request. Returns false if the session is gone.
    pub fn send(&self, request: BuildRequest) -> bool {
        self.tx.send(request).is_ok()
    }
}

/// The request inbox drained by the scheduler each tick.
#[derive(Debug)]
pub struct RequestInbox {
    tx: Sender<BuildRequest>,
    rx: Receiver<BuildRequest>,
}

impl RequestInbox {
    /// New empty inbox.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// A sender handle for external callers.
    pub fn sender(&self) -> RequestSender {
        RequestSender { tx: self.tx.clone() }
    }

    /// Enqueue from the scheduler side (generated items, redirects).
    pub fn push(&self, request: BuildRequest) {
        // the receiver lives as long as self, so this cannot fail
        let _ = self.tx.send(request);
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<BuildRequest> {
        let mut out = Vec::new();
        while let Ok(request) = self.rx.try_recv() {
            out.push(request);
        }
        out
    }

    /// Whether requests are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for RequestInbox {
    fn default() -> Self {
        Self::new()
    }
}

/// Discovery events queued during load, drained into the request
/// pipeline each tick.
#[derive(Debug)]
pub struct DiscoveryQueue {
    tx: Sender<DiscoveryEvent>,
    rx: Receiver<DiscoveryEvent>,
}

impl DiscoveryQueue {
    /// New empty queue.
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Self { tx, rx }
    }

    /// Enqueue a discovery.
    pub fn push(&self, event: DiscoveryEvent) {
        let _ = self.tx.send(event);
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<DiscoveryEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Whether discoveries are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for DiscoveryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_drain_order() {
        let inbox = RequestInbox::new();
        let sender = inbox.sender();
        assert!(sender.send(BuildRequest::new(ItemId::new("a"), Instigator::command_line())));
        assert!(sender.send(BuildRequest::new(ItemId::new("b"), Instigator::command_line())));

        let drained = inbox.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].id, ItemId::new("a"));
        assert_eq!(drained[1].id, ItemId::new("b"));
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_request_builder() {
        let request = BuildRequest::new(ItemId::new("a"), Instigator::build_request())
            .with_profiles(vec![ProfileId::new(1)])
            .with_urgency(Urgency::Blocking)
            .with_pin(WorkerPin::LocalOnly);
        assert_eq!(request.profiles, vec![ProfileId::new(1)]);
        assert_eq!(request.urgency, Urgency::Blocking);
        assert_eq!(request.pin, WorkerPin::LocalOnly);
    }

    #[test]
    fn test_discovery_queue() {
        let queue = DiscoveryQueue::new();
        queue.push(DiscoveryEvent {
            id: ItemId::new("dep"),
            profiles: vec![ProfileId::new(0)],
            instigator: Instigator::dependency(ItemId::new("root")),
            urgency: Urgency::Normal,
        });
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert!(queue.is_empty());
    }
}
