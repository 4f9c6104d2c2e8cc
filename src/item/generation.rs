//! Generator/generated item bookkeeping.
//!
//! A generator is an item whose build step produces additional items (a
//! one-to-many split). The generator and all items it generates share one
//! `GenerationHelper`, which owns the relative save-ordering constraint
//! and de-duplicates the generated-list computation. Helpers are
//! reference-counted; `force_uninitialize` breaks any cycle left at
//! session end.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::item::record::ItemId;

/// Relative save ordering between a generator and its generated items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationOrder {
    /// Generator must finish saving before any generated item
    GeneratorFirst,
    /// All generated items must finish saving before the generator
    GeneratedFirst,
    /// No ordering constraint
    Independent,
}

impl Default for GenerationOrder {
    fn default() -> Self {
        GenerationOrder::Independent
    }
}

/// Shared record for one generator and the items it generates.
#[derive(Debug)]
pub struct GenerationHelper {
    /// The generator item
    pub generator: ItemId,
    /// Items produced by the split, in generation order
    generated: Vec<ItemId>,
    /// Whether the generated list has been computed this session
    list_computed: bool,
    /// Family members whose save has started but not finished
    in_progress: HashSet<ItemId>,
    /// Family members whose save has finished
    finished: HashSet<ItemId>,
    /// Ordering constraint for this family
    order: GenerationOrder,
    /// Set once `force_uninitialize` has run
    torn_down: bool,
}

impl GenerationHelper {
    /// New helper for `generator` with the given ordering policy.
    pub fn new(generator: ItemId, order: GenerationOrder) -> Self {
        Self {
            generator,
            generated: Vec::new(),
            list_computed: false,
            in_progress: HashSet::new(),
            finished: HashSet::new(),
            order,
            torn_down: false,
        }
    }

    /// Whether the generated list has already been computed. Guards the
    /// splitter call so re-entrant save preparation does not recompute it.
    pub fn list_computed(&self) -> bool {
        self.list_computed
    }

    /// Record the computed generated list. Only the first call takes
    /// effect.
    pub fn set_generated(&mut self, generated: Vec<ItemId>) {
        if !self.list_computed {
            self.generated = generated;
            self.list_computed = true;
        }
    }

    /// The generated items.
    pub fn generated(&self) -> &[ItemId] {
        &self.generated
    }

    /// Whether `id` belongs to this family (generator or generated).
    pub fn contains(&self, id: &ItemId) -> bool {
        self.generator == *id || self.generated.iter().any(|g| g == id)
    }

    /// The ordering policy.
    pub fn order(&self) -> GenerationOrder {
        self.order
    }

    /// Override the ordering policy (per-splitter override).
    pub fn set_order(&mut self, order: GenerationOrder) {
        self.order = order;
    }

    /// Mark a family member's save as started.
    pub fn mark_started(&mut self, id: &ItemId) {
        if !self.finished.contains(id) {
            self.in_progress.insert(id.clone());
        }
    }

    /// Mark a family member's save as finished (committed or demoted).
    pub fn mark_finished(&mut self, id: &ItemId) {
        self.in_progress.remove(id);
        self.finished.insert(id.clone());
    }

    /// Family members still in progress.
    pub fn in_progress_count(&self) -> usize {
        self.in_progress.len()
    }

    /// Whether the generator and every generated item have finished.
    /// Gates releasing the helper: the family's bookkeeping must outlive
    /// its slowest member.
    pub fn family_complete(&self) -> bool {
        self.list_computed
            && self.finished.contains(&self.generator)
            && self.generated.iter().all(|g| self.finished.contains(g))
    }

    /// Whether the ordering constraint currently allows `id` to complete
    /// its save. Items blocked here report "incomplete" from their wait
    /// stage and retry later.
    pub fn may_save(&self, id: &ItemId) -> bool {
        if self.torn_down {
            return true;
        }
        let is_generator = *id == self.generator;
        match self.order {
            GenerationOrder::Independent => true,
            GenerationOrder::GeneratorFirst => {
                if is_generator {
                    true
                } else {
                    self.finished.contains(&self.generator)
                }
            }
            GenerationOrder::GeneratedFirst => {
                if is_generator {
                    self.list_computed
                        && self.generated.iter().all(|g| self.finished.contains(g))
                } else {
                    true
                }
            }
        }
    }

    /// Deterministic teardown at session end. Clears all membership so
    /// dangling references cannot keep items alive or block ordering.
    pub fn force_uninitialize(&mut self) {
        self.generated.clear();
        self.in_progress.clear();
        self.finished.clear();
        self.torn_down = true;
    }

    /// Whether teardown has run.
    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }
}

/// Shared ownership handle for a generation helper.
pub type SharedGenerationHelper = Rc<RefCell<GenerationHelper>>;

/// Session-wide pool of generation helpers, keyed by generator. Also
/// remembers object payloads for generated items so they can bypass the
/// loader.
#[derive(Debug, Default)]
pub struct GenerationPool {
    helpers: HashMap<ItemId, SharedGenerationHelper>,
    /// generated item -> its generator
    generated_index: HashMap<ItemId, ItemId>,
    /// pending object payloads for generated items
    pending_objects: HashMap<ItemId, Vec<crate::item::record::CookObject>>,
    /// generated items whose populate pass has run
    populated: HashSet<ItemId>,
}

impl GenerationPool {
    /// Empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the helper for `generator`. Created lazily on first
    /// save-preparation of a generator or generated item.
    pub fn helper_for_generator(
        &mut self,
        generator: &ItemId,
        order: GenerationOrder,
    ) -> SharedGenerationHelper {
        self.helpers
            .entry(generator.clone())
            .or_insert_with(|| {
                Rc::new(RefCell::new(GenerationHelper::new(generator.clone(), order)))
            })
            .clone()
    }

    /// Look up an existing helper by any family member.
    pub fn helper_for(&self, id: &ItemId) -> Option<SharedGenerationHelper> {
        if let Some(helper) = self.helpers.get(id) {
            return Some(helper.clone());
        }
        let generator = self.generated_index.get(id)?;
        self.helpers.get(generator).cloned()
    }

    /// The generator of a generated item, if known.
    pub fn generator_of(&self, generated: &ItemId) -> Option<&ItemId> {
        self.generated_index.get(generated)
    }

    /// Register a generated item and stash its object payload for the
    /// load short-circuit.
    pub fn register_generated(
        &mut self,
        generator: &ItemId,
        generated: ItemId,
        objects: Vec<crate::item::record::CookObject>,
    ) {
        self.generated_index.insert(generated.clone(), generator.clone());
        self.pending_objects.insert(generated, objects);
    }

    /// Replace the stashed objects for a generated item with the
    /// populate pass result and mark the item ready to load.
    pub fn set_pending_objects(
        &mut self,
        generated: &ItemId,
        objects: Vec<crate::item::record::CookObject>,
    ) {
        self.pending_objects.insert(generated.clone(), objects);
        self.populated.insert(generated.clone());
    }

    /// Whether the generator's populate pass has finalized this
    /// generated item's objects. Load must wait for this.
    pub fn is_populated(&self, generated: &ItemId) -> bool {
        self.populated.contains(generated)
    }

    /// Peek at the stashed objects for a generated item.
    pub fn pending_objects(
        &self,
        generated: &ItemId,
    ) -> Option<&Vec<crate::item::record::CookObject>> {
        self.pending_objects.get(generated)
    }

    /// Take the stashed objects for a generated item, if present.
    pub fn take_pending_objects(
        &mut self,
        generated: &ItemId,
    ) -> Option<Vec<crate::item::record::CookObject>> {
        self.pending_objects.remove(generated)
    }

    /// Whether an item is a known generated item.
    pub fn is_generated(&self, id: &ItemId) -> bool {
        self.generated_index.contains_key(id)
    }

    /// Release the helper for `generator` if nothing references it
    /// anymore (the pool's own reference is the last one).
    pub fn release_if_unreferenced(&mut self, generator: &ItemId) {
        if let Some(helper) = self.helpers.get(generator) {
            if Rc::strong_count(helper) == 1 {
                self.helpers.remove(generator);
                self.generated_index.retain(|_, g| g != generator);
            }
        }
    }

    /// Tear down every helper regardless of refcount. Called at session
    /// end; breaks Item <-> helper cycles deterministically.
    pub fn force_uninitialize_all(&mut self) -> usize {
        let mut dangling = 0;
        for helper in self.helpers.values() {
            if Rc::strong_count(helper) > 1 {
                dangling += 1;
            }
            helper.borrow_mut().force_uninitialize();
        }
        self.helpers.clear();
        self.generated_index.clear();
        self.pending_objects.clear();
        self.populated.clear();
        dangling
    }
}
