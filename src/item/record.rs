//! Item records: the unit of work tracked by the cooker.
//!
//! An `ItemRecord` carries everything the scheduler knows about one content
//! item: its identity, per-profile sub-records, current queue state,
//! urgency, provenance, and transient load/save machinery state.

use std::fmt;
use std::sync::Arc;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, Serializer};

use crate::collab::PreloadTicket;
use crate::item::generation::SharedGenerationHelper;
use crate::item::instigator::Instigator;
use crate::profile::ProfileId;

/// Stable identity of a content item: a normalized, `/`-separated
/// relative path without extension (e.g. `characters/hero`).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(Arc<str>);

impl ItemId {
    /// Create an item id, normalizing backslashes to forward slashes.
    pub fn new(name: impl AsRef<str>) -> Self {
        let name = name.as_ref();
        if name.contains('\\') {
            ItemId(Arc::from(name.replace('\\', "/").as_str()))
        } else {
            ItemId(Arc::from(name))
        }
    }

    /// The item name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this id starts with the given prefix (used for the
    /// never-cook list).
    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }

    /// For an id living under a generator's split namespace, the
    /// generator's id.
    pub fn split_origin(&self) -> Option<ItemId> {
        self.0.split_once("/_generated_/").map(|(generator, _)| ItemId::new(generator))
    }
}

impl fmt::Debug for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ItemId({})", self.0)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        ItemId::new(s)
    }
}

impl Serialize for ItemId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for ItemId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(ItemId::new(s))
    }
}

/// Scheduling priority tier. Orders scheduling across queues but never
/// reorders items within the same (queue, urgency) pair.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Default tier
    Normal,
    /// Serviced before Normal
    High,
    /// Serviced before everything else
    Blocking,
}

impl Urgency {
    /// Number of urgency tiers.
    pub const COUNT: usize = 3;

    /// Dense index, 0 = Normal.
    pub fn index(self) -> usize {
        match self {
            Urgency::Normal => 0,
            Urgency::High => 1,
            Urgency::Blocking => 2,
        }
    }

    /// Tier from a dense index.
    pub fn from_index(index: usize) -> Self {
        match index {
            0 => Urgency::Normal,
            1 => Urgency::High,
            _ => Urgency::Blocking,
        }
    }

    /// Tiers from highest to lowest.
    pub fn descending() -> impl Iterator<Item = Urgency> {
        [Urgency::Blocking, Urgency::High, Urgency::Normal].into_iter()
    }
}

impl Default for Urgency {
    fn default() -> Self {
        Urgency::Normal
    }
}

impl fmt::Display for Urgency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Urgency::Normal => write!(f, "normal"),
            Urgency::High => write!(f, "high"),
            Urgency::Blocking => write!(f, "blocking"),
        }
    }
}

/// Outcome of cooking one item for one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookResult {
    /// No cook was attempted yet
    NotAttempted,
    /// Artifact was produced and committed
    Succeeded,
    /// Cook was attempted and failed
    Failed,
    /// Item is deliberately not cooked; a placeholder result is recorded
    NeverCookPlaceholder,
}

impl fmt::Display for CookResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CookResult::NotAttempted => write!(f, "not attempted"),
            CookResult::Succeeded => write!(f, "succeeded"),
            CookResult::Failed => write!(f, "failed"),
            CookResult::NeverCookPlaceholder => write!(f, "never-cook placeholder"),
        }
    }
}

/// Per-(item, profile) state.
#[derive(Debug, Clone)]
pub struct PlatformSubRecord {
    /// Whether this profile transitively needs the item
    pub reachable: bool,
    /// Whether a cook was ever attempted for this profile
    pub cook_attempted: bool,
    /// Result of the most recent attempt
    pub result: CookResult,
    /// Set when the incremental oracle found the previous artifact valid
    pub incrementally_unmodified: bool,
    /// Whether the result has been committed to the artifact store
    committed: bool,
}

impl PlatformSubRecord {
    /// Fresh sub-record: unreachable, unattempted.
    pub fn new() -> Self {
        Self {
            reachable: false,
            cook_attempted: false,
            result: CookResult::NotAttempted,
            incrementally_unmodified: false,
            committed: false,
        }
    }

    /// Whether the result has been committed.
    pub fn is_committed(&self) -> bool {
        self.committed
    }

    /// Record a result and mark the cook attempted.
    pub fn set_result(&mut self, result: CookResult) {
        self.cook_attempted = true;
        self.result = result;
    }

    /// Commit the current result. Committing implies the cook was
    /// attempted, so the attempted flag is raised as well.
    pub fn mark_committed(&mut self) {
        self.cook_attempted = true;
        self.committed = true;
    }

    /// Whether this profile still needs a commit.
    pub fn needs_commit(&self) -> bool {
        self.reachable && !self.committed
    }
}

impl Default for PlatformSubRecord {
    fn default() -> Self {
        Self::new()
    }
}

/// Stage of an item inside the load queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadStage {
    /// Waiting to be considered for preload
    Inbox,
    /// Selected for preload, not yet started (preload slots full)
    PendingPreload,
    /// Preload in flight
    ActivePreload,
    /// Import data warm (or preload skipped); ready for the blocking load
    ReadyForLoad,
}

/// Stage of an item inside the prepare-save sub-machine.
///
/// Stages are monotonic within one pass; re-entrancy resets to an earlier
/// stage when new objects appear mid-preparation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SaveStage {
    /// Entry point; generation bookkeeping starts here
    StartSave,
    /// Collect the item's object set
    CreateObjectCache,
    /// First pass of async-cache begin calls
    BeginAsyncCacheFirst,
    /// Generator only: compute the generated-item list
    TryGenerateList,
    /// Generator only: enqueue requests for generated items
    QueueGeneratedItems,
    /// Generator only: begin caching objects that move into generated items
    BeginCacheObjectsToMove,
    /// Generator only: populate callbacks for each generated item
    CallPopulate,
    /// Async-cache begin calls for objects added after the move
    BeginAsyncCachePost,
    /// Wait for every acquired async-cache entry to report ready
    WaitForAsyncCache,
    /// All preparation complete; the item may be written
    ReadyForSave,
}

/// Top-level queue state of an item. An item is in exactly one of these,
/// and the owning container in the store matches it at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    /// Not in any active queue
    Idle,
    /// In the request pipeline
    Request(RequestPhase),
    /// Handed to a remote worker
    AssignedToWorker,
    /// In the load queue
    Load(LoadStage),
    /// In the save queue (sub-stage tracked on the record)
    Save,
}

/// Phase within the request pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestPhase {
    /// Waiting to be batched into the next cluster
    Staged,
    /// Owned by an in-flight request cluster
    InCluster,
    /// Cluster complete; ready for load or worker assignment
    Ready,
}

/// One object inside a loaded item. Objects are the unit of async
/// readiness tracking (e.g. one texture or one shader map).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CookObject {
    /// Object name, unique within the item
    pub name: String,
    /// Object class, used for per-class concurrency caps and splitter
    /// matching
    pub class: String,
}

impl CookObject {
    /// Convenience constructor.
    pub fn new(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self { name: name.into(), class: class.into() }
    }
}

/// The in-memory object set of a loaded item, plus prepare-save progress
/// markers over it.
#[derive(Debug, Clone, Default)]
pub struct ObjectCache {
    /// Objects owned by this item
    pub objects: Vec<CookObject>,
    /// How many objects have had async-cache begun
    pub begun_count: usize,
    /// Cache keys acquired so far, released on completion or demotion
    pub acquired: Vec<(String, ProfileId)>,
    /// Splitter index resolved for this item, if any
    pub splitter: Option<usize>,
    /// Requests for generated items have been queued
    pub generated_queued: bool,
    /// Populate callbacks have run
    pub populated: bool,
}

impl ObjectCache {
    /// Cache over the given object set.
    pub fn new(objects: Vec<CookObject>) -> Self {
        Self {
            objects,
            begun_count: 0,
            acquired: Vec::new(),
            splitter: None,
            generated_queued: false,
            populated: false,
        }
    }
}

/// Worker placement constraint for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPin {
    /// No constraint
    None,
    /// Must be assigned to this worker
    Worker(usize),
    /// Must not leave the local process
    LocalOnly,
}

impl Default for WorkerPin {
    fn default() -> Self {
        WorkerPin::None
    }
}

/// Authoritative per-item state.
pub struct ItemRecord {
    /// Item identity
    pub id: ItemId,
    /// Current queue state; mutated only through the store's move operation
    pub(crate) state: ItemState,
    /// Scheduling tier
    pub urgency: Urgency,
    /// Why this item was requested
    pub instigator: Instigator,
    /// One sub-record per active profile, indexed by `ProfileId`
    pub platforms: Vec<PlatformSubRecord>,
    /// Prepare-save progress; meaningful only in `ItemState::Save`
    pub save_stage: SaveStage,
    /// Loaded object set, present from load completion until eviction
    pub object_cache: Option<ObjectCache>,
    /// Generation helper shared with the generator/generated family
    pub generation: Option<SharedGenerationHelper>,
    /// In-flight preload, present only in `LoadStage::ActivePreload`
    pub preload: Option<PreloadTicket>,
    /// Preloaded bytes, carried from preload completion to load
    pub preloaded: Option<Vec<u8>>,
    /// Worker currently holding the item, in `AssignedToWorker`
    pub assigned_worker: Option<usize>,
    /// Placement constraint
    pub pin: WorkerPin,
    /// Dependencies resolved by the request cluster, leaf-to-root
    pub resolved_deps: Vec<ItemId>,
    /// Re-entrancy depth of the prepare-save machine
    pub prepare_depth: u8,
    /// Set when save preparation failed permanently for this session
    pub prepare_failed: bool,
    /// Object count at the last completed async-cache pass, for
    /// detecting objects that appear mid-preparation
    pub prepared_object_count: usize,
    /// Last demote reason, for diagnostics
    pub last_demote: Option<crate::error::DemoteReason>,
}

impl ItemRecord {
    /// New Idle record with one sub-record per profile.
    pub fn new(id: ItemId, profile_count: usize, instigator: Instigator) -> Self {
        Self {
            id,
            state: ItemState::Idle,
            urgency: Urgency::Normal,
            instigator,
            platforms: vec![PlatformSubRecord::new(); profile_count],
            save_stage: SaveStage::StartSave,
            object_cache: None,
            generation: None,
            preload: None,
            preloaded: None,
            assigned_worker: None,
            pin: WorkerPin::None,
            resolved_deps: Vec::new(),
            prepare_depth: 0,
            prepare_failed: false,
            prepared_object_count: 0,
            last_demote: None,
        }
    }

    /// Current queue state.
    pub fn state(&self) -> ItemState {
        self.state
    }

    /// Sub-record for one profile.
    pub fn platform(&self, profile: ProfileId) -> &PlatformSubRecord {
        &self.platforms[profile.index()]
    }

    /// Mutable sub-record for one profile.
    pub fn platform_mut(&mut self, profile: ProfileId) -> &mut PlatformSubRecord {
        &mut self.platforms[profile.index()]
    }

    /// Profiles that still need a commit.
    pub fn profiles_needing_commit(&self) -> Vec<ProfileId> {
        self.platforms
            .iter()
            .enumerate()
            .filter(|(_, p)| p.needs_commit())
            .map(|(i, _)| ProfileId::new(i))
            .collect()
    }

    /// Whether any profile still needs a commit.
    pub fn needs_any_commit(&self) -> bool {
        self.platforms.iter().any(|p| p.needs_commit())
    }

    /// Whether every reachable profile is committed.
    pub fn all_reachable_committed(&self) -> bool {
        self.platforms.iter().filter(|p| p.reachable).all(|p| p.is_committed())
    }

    /// Whether the given profiles are all committed already.
    pub fn committed_for_all(&self, profiles: &[ProfileId]) -> bool {
        profiles.iter().all(|p| self.platforms[p.index()].is_committed())
    }

    /// Mark every reachable profile committed with the given result.
    /// Used for redirects and never-cook placeholders.
    pub fn commit_all_reachable(&mut self, result: CookResult) {
        for sub in self.platforms.iter_mut().filter(|p| p.reachable) {
            sub.set_result(result);
            sub.mark_committed();
        }
    }

    /// Reset transient load/save machinery when the item leaves the
    /// active pipeline.
    pub fn clear_in_flight(&mut self) {
        self.preload = None;
        self.preloaded = None;
        self.save_stage = SaveStage::StartSave;
        self.prepare_depth = 0;
        self.prepared_object_count = 0;
        self.assigned_worker = None;
    }
}

impl fmt::Debug for ItemRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ItemRecord")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("urgency", &self.urgency)
            .field("save_stage", &self.save_stage)
            .field("platforms", &self.platforms)
            .finish_non_exhaustive()
    }
}
