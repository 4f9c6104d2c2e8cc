//! Async-cache entry table.
//!
//! One entry per (object, profile) pair with an outstanding readiness
//! call. Entries are reference-counted by the items depending on them
//! and released when the last dependent completes or is cancelled. A
//! per-class in-flight counter caps how many heavy compiles of one kind
//! run at once; a saturated class makes `try_begin` report so instead
//! of blocking.

use std::collections::HashMap;

use crate::collab::ReadinessProvider;
use crate::item::record::CookObject;
use crate::profile::{ProfileId, TargetProfile};

/// Lifecycle of one async-readiness call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// Entry exists but begin has not been called
    None,
    /// Begin called; completion pending
    BeginCalled,
    /// The external system reported the data ready
    IsLoadedTrue,
}

/// Outcome of a begin attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeginOutcome {
    /// Begin was called on the external system
    Begun,
    /// The call was already in flight or complete
    AlreadyActive,
    /// The object's class is at its concurrency cap; retry later
    Saturated,
}

/// Key of one cache entry.
pub type CacheKey = (String, ProfileId);

#[derive(Debug)]
struct CacheEntry {
    state: CacheState,
    refs: usize,
    class: String,
}

/// The session-wide async-cache table.
#[derive(Debug, Default)]
pub struct AsyncCacheTable {
    entries: HashMap<CacheKey, CacheEntry>,
    inflight_per_class: HashMap<String, usize>,
}

impl AsyncCacheTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one reference on an entry for a dependent item, creating it
    /// if needed. The caller tracks its acquired keys and must release
    /// them exactly once.
    pub fn acquire(&mut self, object: &CookObject, profile: ProfileId) -> CacheKey {
        let key = (object.name.clone(), profile);
        let entry = self.entries.entry(key.clone()).or_insert_with(|| CacheEntry {
            state: CacheState::None,
            refs: 0,
            class: object.class.clone(),
        });
        entry.refs += 1;
        key
    }

    /// Try to start the external readiness call for an entry, honoring
    /// the per-class concurrency cap.
    pub fn try_begin(
        &mut self,
        object: &CookObject,
        profile: ProfileId,
        target: &TargetProfile,
        readiness: &mut dyn ReadinessProvider,
        max_per_class: usize,
    ) -> BeginOutcome {
        let key = (object.name.clone(), profile);
        let entry = match self.entries.get_mut(&key) {
            Some(entry) => entry,
            None => return BeginOutcome::Saturated,
        };
        match entry.state {
            CacheState::BeginCalled | CacheState::IsLoadedTrue => BeginOutcome::AlreadyActive,
            CacheState::None => {
                let inflight = self.inflight_per_class.entry(object.class.clone()).or_insert(0);
                if *inflight >= max_per_class {
                    return BeginOutcome::Saturated;
                }
                *inflight += 1;
                entry.state = CacheState::BeginCalled;
                readiness.begin_cache(object, target);
                BeginOutcome::Begun
            }
        }
    }

    /// Poll one entry, reconciling completion into the table. Returns
    /// whether the entry is ready.
    pub fn poll(
        &mut self,
        key: &CacheKey,
        target: &TargetProfile,
        readiness: &mut dyn ReadinessProvider,
    ) -> bool {
        let entry = match self.entries.get_mut(key) {
            Some(entry) => entry,
            None => return false,
        };
        match entry.state {
            CacheState::IsLoadedTrue => true,
            CacheState::None => false,
            CacheState::BeginCalled => {
                let object = CookObject::new(key.0.clone(), entry.class.clone());
                if readiness.is_ready(&object, target) {
                    entry.state = CacheState::IsLoadedTrue;
                    decrement(&mut self.inflight_per_class, &entry.class);
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Sweep every in-flight entry once. Used by the readiness-service
    /// pollable; completions are reconciled here, on the scheduler
    /// thread, never from external callbacks.
    pub fn service(
        &mut self,
        profiles: &[TargetProfile],
        readiness: &mut dyn ReadinessProvider,
    ) -> usize {
        let keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == CacheState::BeginCalled)
            .map(|(k, _)| k.clone())
            .collect();
        let mut completed = 0;
        for key in keys {
            let target = match profiles.get(key.1.index()) {
                Some(target) => target.clone(),
                None => continue,
            };
            if self.poll(&key, &target, readiness) {
                completed += 1;
            }
        }
        completed
    }

    /// Release references taken by one item. Entries with no remaining
    /// dependents are dropped; an in-flight entry being dropped frees
    /// its class slot.
    pub fn release(&mut self, keys: &[CacheKey]) {
        for key in keys {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.refs = entry.refs.saturating_sub(1);
                if entry.refs == 0 {
                    if entry.state == CacheState::BeginCalled {
                        decrement(&mut self.inflight_per_class, &entry.class);
                    }
                    self.entries.remove(key);
                }
            }
        }
    }

    /// Current state of an entry.
    pub fn state(&self, key: &CacheKey) -> CacheState {
        self.entries.get(key).map(|e| e.state).unwrap_or(CacheState::None)
    }

    /// Entries still waiting on the external system.
    pub fn pending_count(&self) -> usize {
        self.entries.values().filter(|e| e.state == CacheState::BeginCalled).count()
    }

    /// In-flight calls for one class.
    pub fn inflight_for_class(&self, class: &str) -> usize {
        self.inflight_per_class.get(class).copied().unwrap_or(0)
    }

    /// Total entries in the table.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn decrement(counts: &mut HashMap<String, usize>, class: &str) {
    if let Some(count) = counts.get_mut(class) {
        *count = count.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ImmediateReadiness, StaggeredReadiness};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn target() -> TargetProfile {
        TargetProfile {
            name: "default".to_string(),
            out_dir: PathBuf::from("/tmp/out"),
            settings: BTreeMap::new(),
        }
    }

    #[test]
    fn test_acquire_begin_poll_release() {
        let mut table = AsyncCacheTable::new();
        let mut readiness = ImmediateReadiness::new();
        let object = CookObject::new("tex", "texture");
        let profile = ProfileId::new(0);

        let key = table.acquire(&object, profile);
        assert_eq!(table.state(&key), CacheState::None);

        let outcome = table.try_begin(&object, profile, &target(), &mut readiness, 4);
        assert_eq!(outcome, BeginOutcome::Begun);
        assert_eq!(table.inflight_for_class("texture"), 1);

        assert!(table.poll(&key, &target(), &mut readiness));
        assert_eq!(table.state(&key), CacheState::IsLoadedTrue);
        assert_eq!(table.inflight_for_class("texture"), 0);

        table.release(&[key.clone()]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_class_saturation() {
        let mut table = AsyncCacheTable::new();
        let mut readiness = StaggeredReadiness::new(100);
        let profile = ProfileId::new(0);

        let a = CookObject::new("a", "shader");
        let b = CookObject::new("b", "shader");
        let c = CookObject::new("c", "shader");
        table.acquire(&a, profile);
        table.acquire(&b, profile);
        table.acquire(&c, profile);

        assert_eq!(table.try_begin(&a, profile, &target(), &mut readiness, 2), BeginOutcome::Begun);
        assert_eq!(table.try_begin(&b, profile, &target(), &mut readiness, 2), BeginOutcome::Begun);
        assert_eq!(
            table.try_begin(&c, profile, &target(), &mut readiness, 2),
            BeginOutcome::Saturated
        );

        // a different class is unaffected
        let d = CookObject::new("d", "mesh");
        table.acquire(&d, profile);
        assert_eq!(table.try_begin(&d, profile, &target(), &mut readiness, 2), BeginOutcome::Begun);
    }

    #[test]
    fn test_refcounted_release() {
        let mut table = AsyncCacheTable::new();
        let mut readiness = ImmediateReadiness::new();
        let object = CookObject::new("shared", "mesh");
        let profile = ProfileId::new(0);

        let key1 = table.acquire(&object, profile);
        let key2 = table.acquire(&object, profile);
        table.try_begin(&object, profile, &target(), &mut readiness, 4);

        table.release(std::slice::from_ref(&key1));
        assert_eq!(table.len(), 1);
        table.release(std::slice::from_ref(&key2));
        assert!(table.is_empty());
    }

    #[test]
    fn test_release_inflight_frees_class_slot() {
        let mut table = AsyncCacheTable::new();
        let mut readiness = StaggeredReadiness::new(100);
        let object = CookObject::new("a", "shader");
        let profile = ProfileId::new(0);

        let key = table.acquire(&object, profile);
        table.try_begin(&object, profile, &target(), &mut readiness, 1);
        assert_eq!(table.inflight_for_class("shader"), 1);

        // cancelled mid-flight
        table.release(&[key]);
        assert_eq!(table.inflight_for_class("shader"), 0);
    }

    #[test]
    fn test_begin_idempotent() {
        let mut table = AsyncCacheTable::new();
        let mut readiness = StaggeredReadiness::new(100);
        let object = CookObject::new("a", "shader");
        let profile = ProfileId::new(0);

        table.acquire(&object, profile);
        assert_eq!(table.try_begin(&object, profile, &target(), &mut readiness, 4), BeginOutcome::Begun);
        assert_eq!(
            table.try_begin(&object, profile, &target(), &mut readiness, 4),
            BeginOutcome::AlreadyActive
        );
        assert_eq!(table.inflight_for_class("shader"), 1);
    }

    #[test]
    fn test_service_sweep() {
        let mut table = AsyncCacheTable::new();
        let mut readiness = StaggeredReadiness::new(1);
        let profile = ProfileId::new(0);
        let object = CookObject::new("a", "shader");

        let key = table.acquire(&object, profile);
        table.try_begin(&object, profile, &target(), &mut readiness, 4);
        assert_eq!(table.pending_count(), 1);

        let targets = vec![target()];
        // first sweep: not ready yet
        assert_eq!(table.service(&targets, &mut readiness), 0);
        // second sweep: ready
        assert_eq!(table.service(&targets, &mut readiness), 1);
        assert_eq!(table.pending_count(), 0);
        assert_eq!(table.state(&key), CacheState::IsLoadedTrue);
    }
}
