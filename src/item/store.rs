//! Authoritative item store and queue containers.
//!
//! The store owns every `ItemRecord` plus the queue containers that
//! mirror each record's state. All state transitions go through
//! [`ItemStore::move_to`], which updates the state field and the
//! container membership together, so the two can never disagree.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::error::DemoteReason;
use crate::item::instigator::Instigator;
use crate::item::record::{
    ItemId, ItemRecord, ItemState, LoadStage, RequestPhase, SaveStage, Urgency,
};

/// FIFO lanes, one per urgency tier. Pops always come from the highest
/// non-empty lane; order within a lane is insertion order.
#[derive(Debug, Default)]
pub struct UrgencyFifo {
    lanes: [VecDeque<ItemId>; Urgency::COUNT],
}

impl UrgencyFifo {
    /// Empty FIFO.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append at the given urgency.
    pub fn push(&mut self, id: ItemId, urgency: Urgency) {
        self.lanes[urgency.index()].push_back(id);
    }

    /// Front of the highest non-empty lane.
    pub fn front(&self) -> Option<&ItemId> {
        Urgency::descending().find_map(|u| self.lanes[u.index()].front())
    }

    /// Front of a specific lane.
    pub fn front_at(&self, urgency: Urgency) -> Option<&ItemId> {
        self.lanes[urgency.index()].front()
    }

    /// Remove a specific id at a known urgency. Returns whether it was
    /// present.
    pub fn remove(&mut self, id: &ItemId, urgency: Urgency) -> bool {
        let lane = &mut self.lanes[urgency.index()];
        if let Some(pos) = lane.iter().position(|x| x == id) {
            lane.remove(pos);
            true
        } else {
            false
        }
    }

    /// Rotate the front of a lane to its back (retry later without
    /// reordering across urgencies).
    pub fn rotate(&mut self, urgency: Urgency) {
        let lane = &mut self.lanes[urgency.index()];
        if let Some(front) = lane.pop_front() {
            lane.push_back(front);
        }
    }

    /// Total items across all lanes.
    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    /// Items at one urgency.
    pub fn len_at(&self, urgency: Urgency) -> usize {
        self.lanes[urgency.index()].len()
    }

    /// Items strictly above Normal urgency.
    pub fn urgent_len(&self) -> usize {
        self.len() - self.len_at(Urgency::Normal)
    }

    /// Whether the FIFO is empty.
    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    /// Whether the FIFO contains `id` at `urgency`.
    pub fn contains(&self, id: &ItemId, urgency: Urgency) -> bool {
        self.lanes[urgency.index()].iter().any(|x| x == id)
    }

    /// Iterate all ids, highest urgency first.
    pub fn iter(&self) -> impl Iterator<Item = &ItemId> {
        Urgency::descending().flat_map(move |u| self.lanes[u.index()].iter())
    }

    /// Drain every id, highest urgency first.
    pub fn drain_all(&mut self) -> Vec<ItemId> {
        let mut out = Vec::with_capacity(self.len());
        for u in Urgency::descending() {
            out.extend(self.lanes[u.index()].drain(..));
        }
        out
    }
}

/// Queue containers mirroring `ItemState`. Idle items are tracked in an
/// explicit set so membership can be verified exhaustively.
#[derive(Debug, Default)]
pub struct Queues {
    /// Idle items
    pub idle: HashSet<ItemId>,
    /// Request: waiting to be batched into a cluster
    pub request_staged: VecDeque<ItemId>,
    /// Request: owned by an in-flight cluster
    pub in_cluster: HashSet<ItemId>,
    /// Request: cluster complete, ready for load or assignment
    pub request_ready: UrgencyFifo,
    /// Handed to a worker
    pub assigned: HashSet<ItemId>,
    /// Load: arrival order
    pub load_inbox: VecDeque<ItemId>,
    /// Load: selected for preload, waiting for a slot
    pub load_pending_preload: VecDeque<ItemId>,
    /// Load: preload in flight
    pub load_active_preload: VecDeque<ItemId>,
    /// Load: ready for the blocking load call
    pub load_ready: UrgencyFifo,
    /// Save queue
    pub save: UrgencyFifo,
}

impl Queues {
    fn insert(&mut self, id: &ItemId, state: ItemState, urgency: Urgency) {
        match state {
            ItemState::Idle => {
                self.idle.insert(id.clone());
            }
            ItemState::Request(RequestPhase::Staged) => {
                self.request_staged.push_back(id.clone());
            }
            ItemState::Request(RequestPhase::InCluster) => {
                self.in_cluster.insert(id.clone());
            }
            ItemState::Request(RequestPhase::Ready) => {
                self.request_ready.push(id.clone(), urgency);
            }
            ItemState::AssignedToWorker => {
                self.assigned.insert(id.clone());
            }
            ItemState::Load(LoadStage::Inbox) => {
                self.load_inbox.push_back(id.clone());
            }
            ItemState::Load(LoadStage::PendingPreload) => {
                self.load_pending_preload.push_back(id.clone());
            }
            ItemState::Load(LoadStage::ActivePreload) => {
                self.load_active_preload.push_back(id.clone());
            }
            ItemState::Load(LoadStage::ReadyForLoad) => {
                self.load_ready.push(id.clone(), urgency);
            }
            ItemState::Save => {
                self.save.push(id.clone(), urgency);
            }
        }
    }

    fn remove(&mut self, id: &ItemId, state: ItemState, urgency: Urgency) -> bool {
        fn remove_deque(deque: &mut VecDeque<ItemId>, id: &ItemId) -> bool {
            if let Some(pos) = deque.iter().position(|x| x == id) {
                deque.remove(pos);
                true
            } else {
                false
            }
        }
        match state {
            ItemState::Idle => self.idle.remove(id),
            ItemState::Request(RequestPhase::Staged) => {
                remove_deque(&mut self.request_staged, id)
            }
            ItemState::Request(RequestPhase::InCluster) => self.in_cluster.remove(id),
            ItemState::Request(RequestPhase::Ready) => self.request_ready.remove(id, urgency),
            ItemState::AssignedToWorker => self.assigned.remove(id),
            ItemState::Load(LoadStage::Inbox) => remove_deque(&mut self.load_inbox, id),
            ItemState::Load(LoadStage::PendingPreload) => {
                remove_deque(&mut self.load_pending_preload, id)
            }
            ItemState::Load(LoadStage::ActivePreload) => {
                remove_deque(&mut self.load_active_preload, id)
            }
            ItemState::Load(LoadStage::ReadyForLoad) => self.load_ready.remove(id, urgency),
            ItemState::Save => self.save.remove(id, urgency),
        }
    }

    /// Count of items in any load stage.
    pub fn load_total(&self) -> usize {
        self.load_inbox.len()
            + self.load_pending_preload.len()
            + self.load_active_preload.len()
            + self.load_ready.len()
    }

    /// Count of items anywhere in the request pipeline.
    pub fn request_total(&self) -> usize {
        self.request_staged.len() + self.in_cluster.len() + self.request_ready.len()
    }
}

/// The authoritative record map plus its queue containers.
#[derive(Debug, Default)]
pub struct ItemStore {
    records: HashMap<ItemId, ItemRecord>,
    queues: Queues,
    profile_count: usize,
}

impl ItemStore {
    /// Empty store for `profile_count` active profiles.
    pub fn new(profile_count: usize) -> Self {
        Self { records: HashMap::new(), queues: Queues::default(), profile_count }
    }

    /// Number of profiles each record tracks.
    pub fn profile_count(&self) -> usize {
        self.profile_count
    }

    /// Read access to the queue containers.
    pub fn queues(&self) -> &Queues {
        &self.queues
    }

    /// Fetch a record.
    pub fn get(&self, id: &ItemId) -> Option<&ItemRecord> {
        self.records.get(id)
    }

    /// Fetch a record mutably. State must still only change through
    /// [`ItemStore::move_to`].
    pub fn get_mut(&mut self, id: &ItemId) -> Option<&mut ItemRecord> {
        self.records.get_mut(id)
    }

    /// Whether a record exists for `id`.
    pub fn contains(&self, id: &ItemId) -> bool {
        self.records.contains_key(id)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store has no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Iterate all records.
    pub fn iter(&self) -> impl Iterator<Item = &ItemRecord> {
        self.records.values()
    }

    /// Get the record for `id`, creating an Idle one if absent.
    pub fn ensure(&mut self, id: &ItemId, instigator: Instigator) -> &mut ItemRecord {
        let profile_count = self.profile_count;
        let queues = &mut self.queues;
        self.records.entry(id.clone()).or_insert_with(|| {
            queues.idle.insert(id.clone());
            ItemRecord::new(id.clone(), profile_count, instigator)
        })
    }

    /// Move an item to a new state: removes it from its current container
    /// and inserts it into the target container, then updates the state
    /// field. This is the only state transition operation.
    pub fn move_to(&mut self, id: &ItemId, next: ItemState) {
        let record = self.records.get_mut(id).expect("move_to on unknown item");
        let prev = record.state;
        let urgency = record.urgency;
        if prev == next {
            return;
        }
        let removed = self.queues.remove(id, prev, urgency);
        debug_assert!(removed, "item {} missing from container for {:?}", id, prev);
        self.queues.insert(id, next, urgency);
        let record = self.records.get_mut(id).expect("record vanished during move");
        record.state = next;
    }

    /// Change an item's urgency, repositioning it inside any
    /// urgency-keyed container it currently occupies. Urgency is never
    /// lowered by this call.
    pub fn raise_urgency(&mut self, id: &ItemId, urgency: Urgency) {
        let record = match self.records.get_mut(id) {
            Some(r) => r,
            None => return,
        };
        if urgency <= record.urgency {
            return;
        }
        let state = record.state;
        let old = record.urgency;
        self.queues.remove(id, state, old);
        let record = self.records.get_mut(id).expect("record vanished during raise");
        record.urgency = urgency;
        self.queues.insert(id, state, urgency);
    }

    /// Demote an item to Idle, recording the reason and the per-profile
    /// failure result when the reason is a failure. Clears in-flight
    /// machinery state.
    pub fn demote(&mut self, id: &ItemId, reason: DemoteReason) {
        self.move_to(id, ItemState::Idle);
        let record = self.records.get_mut(id).expect("demote on unknown item");
        if reason.is_failure() {
            for sub in record.platforms.iter_mut().filter(|p| p.reachable && !p.is_committed()) {
                sub.set_result(crate::item::record::CookResult::Failed);
            }
        }
        record.clear_in_flight();
        record.last_demote = Some(reason);
    }

    /// Verify that every record's state matches exactly one container
    /// membership and that no container holds an unknown id. Returns a
    /// description of the first violation found.
    pub fn verify_membership(&self) -> Result<(), String> {
        for record in self.records.values() {
            let id = &record.id;
            let mut found = 0usize;
            let q = &self.queues;
            let memberships: [(bool, &str); 10] = [
                (q.idle.contains(id), "idle"),
                (q.request_staged.iter().any(|x| x == id), "request_staged"),
                (q.in_cluster.contains(id), "in_cluster"),
                (q.request_ready.contains(id, record.urgency), "request_ready"),
                (q.assigned.contains(id), "assigned"),
                (q.load_inbox.iter().any(|x| x == id), "load_inbox"),
                (
                    q.load_pending_preload.iter().any(|x| x == id),
                    "load_pending_preload",
                ),
                (
                    q.load_active_preload.iter().any(|x| x == id),
                    "load_active_preload",
                ),
                (q.load_ready.contains(id, record.urgency), "load_ready"),
                (q.save.contains(id, record.urgency), "save"),
            ];
            for (present, _) in memberships {
                if present {
                    found += 1;
                }
            }
            if found != 1 {
                return Err(format!(
                    "item {} in state {:?} has {} container memberships",
                    id, record.state, found
                ));
            }
            let expected = match record.state {
                ItemState::Idle => "idle",
                ItemState::Request(RequestPhase::Staged) => "request_staged",
                ItemState::Request(RequestPhase::InCluster) => "in_cluster",
                ItemState::Request(RequestPhase::Ready) => "request_ready",
                ItemState::AssignedToWorker => "assigned",
                ItemState::Load(LoadStage::Inbox) => "load_inbox",
                ItemState::Load(LoadStage::PendingPreload) => "load_pending_preload",
                ItemState::Load(LoadStage::ActivePreload) => "load_active_preload",
                ItemState::Load(LoadStage::ReadyForLoad) => "load_ready",
                ItemState::Save => "save",
            };
            let actual = memberships.iter().find(|(present, _)| *present).map(|(_, n)| *n);
            if actual != Some(expected) {
                return Err(format!(
                    "item {} in state {:?} found in container {:?}, expected {}",
                    id, record.state, actual, expected
                ));
            }
        }
        Ok(())
    }

    /// Every non-Idle item id. Used by cancellation.
    pub fn active_items(&self) -> Vec<ItemId> {
        self.records
            .values()
            .filter(|r| r.state != ItemState::Idle)
            .map(|r| r.id.clone())
            .collect()
    }

    /// Rotate the front item of a load-ready lane to its back, to retry
    /// it after the rest of the lane.
    pub fn rotate_load_ready(&mut self, urgency: Urgency) {
        self.queues.load_ready.rotate(urgency);
    }

    /// Rotate the front item of a save lane to its back.
    pub fn rotate_save(&mut self, urgency: Urgency) {
        self.queues.save.rotate(urgency);
    }

    /// Reset the save sub-machine of an item back to its start. Used
    /// when a cache eviction invalidates partially-prepared state.
    pub fn reset_save_progress(&mut self, id: &ItemId) {
        if let Some(record) = self.records.get_mut(id) {
            record.save_stage = SaveStage::StartSave;
            record.prepared_object_count = 0;
        }
    }
}
