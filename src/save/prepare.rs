//! Prepare-save sub-machine.
//!
//! Before an item may be written, every per-object per-platform async
//! readiness dependency must resolve to true. The machine walks a
//! monotonic stage sequence, resumable whenever a stage reports
//! incomplete: begin async caching for every object, and for generator
//! items compute the generated list, queue requests for the generated
//! items, warm the objects that move into them, run the populate
//! callbacks, then wait for every acquired cache entry.
//!
//! Objects that appear in the cache mid-preparation (populate callbacks
//! commonly create them) re-enter the machine at the first begin stage,
//! guarded by a hard depth limit so a misbehaving splitter errors out
//! instead of looping forever.

use tracing::debug;

use crate::collab::{ReadinessProvider, SplitterRegistry};
use crate::config::KilnConfig;
use crate::error::DemoteReason;
use crate::item::generation::GenerationPool;
use crate::item::instigator::Instigator;
use crate::item::record::{CookObject, ItemId, SaveStage};
use crate::item::store::ItemStore;
use crate::profile::{ProfileId, TargetProfile};
use crate::request::BuildRequest;
use crate::save::cache::{AsyncCacheTable, BeginOutcome, CacheKey};

/// Outcome of one advance call.
#[derive(Debug)]
pub enum PrepareStep {
    /// Moved to a later stage; advance again
    Progressed,
    /// Blocked on an external condition; retry later
    Incomplete,
    /// Every stage complete; the item may be written
    Ready,
    /// Preparation failed permanently for this session
    Error(DemoteReason),
}

/// Everything the machine touches besides the store.
pub struct PrepareContext<'a> {
    /// Splitter hooks
    pub splitters: &'a mut SplitterRegistry,
    /// Async readiness collaborator
    pub readiness: &'a mut dyn ReadinessProvider,
    /// Session-wide async-cache table
    pub cache: &'a mut AsyncCacheTable,
    /// Generation bookkeeping
    pub gen_pool: &'a mut GenerationPool,
    /// Active profiles, indexed by `ProfileId`
    pub targets: &'a [TargetProfile],
    /// Session configuration
    pub config: &'a KilnConfig,
    /// Requests for generated items, drained by the caller
    pub new_requests: &'a mut Vec<BuildRequest>,
}

/// Advance the item's preparation by one stage.
pub fn advance_prepare(
    store: &mut ItemStore,
    id: &ItemId,
    ctx: &mut PrepareContext<'_>,
) -> PrepareStep {
    let stage = match store.get(id) {
        Some(record) => record.save_stage,
        None => return internal_error("record missing"),
    };
    match stage {
        SaveStage::StartSave => start_save(store, id, ctx),
        SaveStage::CreateObjectCache => create_object_cache(store, id, ctx),
        SaveStage::BeginAsyncCacheFirst => begin_async_cache(store, id, ctx, true),
        SaveStage::TryGenerateList => try_generate_list(store, id, ctx),
        SaveStage::QueueGeneratedItems => queue_generated_items(store, id, ctx),
        SaveStage::BeginCacheObjectsToMove => begin_cache_objects_to_move(store, id, ctx),
        SaveStage::CallPopulate => call_populate(store, id, ctx),
        SaveStage::BeginAsyncCachePost => begin_async_cache(store, id, ctx, false),
        SaveStage::WaitForAsyncCache => wait_for_async_cache(store, id, ctx),
        SaveStage::ReadyForSave => PrepareStep::Ready,
    }
}

fn internal_error(msg: &str) -> PrepareStep {
    PrepareStep::Error(DemoteReason::SaveError(msg.to_string()))
}

fn start_save(store: &mut ItemStore, id: &ItemId, ctx: &mut PrepareContext<'_>) -> PrepareStep {
    let record = match store.get_mut(id) {
        Some(record) => record,
        None => return internal_error("record missing"),
    };
    if record.prepare_failed {
        return internal_error("preparation already failed this session");
    }
    if record.object_cache.is_none() {
        return internal_error("no object cache");
    }
    if record.generation.is_none() {
        if let Some(helper) = ctx.gen_pool.helper_for(id) {
            record.generation = Some(helper);
        }
    }
    if let Some(helper) = &record.generation {
        helper.borrow_mut().mark_started(id);
    }
    record.save_stage = SaveStage::CreateObjectCache;
    PrepareStep::Progressed
}

fn create_object_cache(
    store: &mut ItemStore,
    id: &ItemId,
    ctx: &mut PrepareContext<'_>,
) -> PrepareStep {
    let (objects, splitter) = {
        let record = match store.get_mut(id) {
            Some(record) => record,
            None => return internal_error("record missing"),
        };
        let cache = match record.object_cache.as_mut() {
            Some(cache) => cache,
            None => return internal_error("object cache evicted"),
        };
        if cache.splitter.is_none() {
            cache.splitter = ctx.splitters.resolve(id, &cache.objects);
        }
        (cache.objects.clone(), cache.splitter)
    };
    if let Some(index) = splitter {
        if let Err(err) = ctx.splitters.get_mut(index).validate(id, &objects) {
            return PrepareStep::Error(DemoteReason::ValidationError(err));
        }
    }
    if let Some(record) = store.get_mut(id) {
        record.save_stage = SaveStage::BeginAsyncCacheFirst;
    }
    PrepareStep::Progressed
}

/// Take one cache reference and start the external call, honoring the
/// per-class cap. Keys already held by the item are never re-acquired.
fn begin_object(
    cache: &mut AsyncCacheTable,
    object: &CookObject,
    profile: ProfileId,
    target: &TargetProfile,
    readiness: &mut dyn ReadinessProvider,
    max_per_class: usize,
    acquired: &mut Vec<CacheKey>,
) -> BeginOutcome {
    let key: CacheKey = (object.name.clone(), profile);
    let newly = !acquired.contains(&key);
    if newly {
        cache.acquire(object, profile);
    }
    let outcome = cache.try_begin(object, profile, target, readiness, max_per_class);
    match outcome {
        BeginOutcome::Saturated => {
            if newly {
                cache.release(std::slice::from_ref(&key));
            }
        }
        BeginOutcome::Begun | BeginOutcome::AlreadyActive => {
            if newly {
                acquired.push(key);
            }
        }
    }
    outcome
}

fn begin_async_cache(
    store: &mut ItemStore,
    id: &ItemId,
    ctx: &mut PrepareContext<'_>,
    first_pass: bool,
) -> PrepareStep {
    let (objects, begun, needing, has_splitter, mut acquired) = {
        let record = match store.get_mut(id) {
            Some(record) => record,
            None => return internal_error("record missing"),
        };
        let needing = record.profiles_needing_commit();
        let cache = match record.object_cache.as_mut() {
            Some(cache) => cache,
            None => return internal_error("object cache evicted"),
        };
        (
            cache.objects.clone(),
            cache.begun_count,
            needing,
            cache.splitter.is_some(),
            std::mem::take(&mut cache.acquired),
        )
    };

    let max_per_class = ctx.config.scheduler.max_async_cache_per_class;
    let mut new_begun = begun;
    let mut saturated = false;
    'objects: for object in &objects[begun..] {
        for profile in &needing {
            let target = match ctx.targets.get(profile.index()) {
                Some(target) => target,
                None => continue,
            };
            let outcome = begin_object(
                ctx.cache,
                object,
                *profile,
                target,
                ctx.readiness,
                max_per_class,
                &mut acquired,
            );
            if outcome == BeginOutcome::Saturated {
                saturated = true;
                break 'objects;
            }
        }
        new_begun += 1;
    }

    let record = match store.get_mut(id) {
        Some(record) => record,
        None => return internal_error("record missing"),
    };
    if let Some(cache) = record.object_cache.as_mut() {
        cache.begun_count = new_begun;
        cache.acquired = acquired;
    }
    if saturated {
        return PrepareStep::Incomplete;
    }
    record.prepared_object_count = objects.len();
    record.save_stage = if first_pass && has_splitter {
        SaveStage::TryGenerateList
    } else {
        SaveStage::WaitForAsyncCache
    };
    PrepareStep::Progressed
}

fn try_generate_list(
    store: &mut ItemStore,
    id: &ItemId,
    ctx: &mut PrepareContext<'_>,
) -> PrepareStep {
    let (objects, splitter) = {
        let record = match store.get(id) {
            Some(record) => record,
            None => return internal_error("record missing"),
        };
        match record.object_cache.as_ref() {
            Some(cache) => (cache.objects.clone(), cache.splitter),
            None => return internal_error("object cache evicted"),
        }
    };
    let index = match splitter {
        Some(index) => index,
        None => {
            if let Some(record) = store.get_mut(id) {
                record.save_stage = SaveStage::WaitForAsyncCache;
            }
            return PrepareStep::Progressed;
        }
    };

    let order = ctx
        .splitters
        .get_mut(index)
        .order_override()
        .unwrap_or(ctx.config.generation.order);
    let helper = ctx.gen_pool.helper_for_generator(id, order);
    if !helper.borrow().list_computed() {
        let specs = match ctx.splitters.get_mut(index).generate_list(id, &objects) {
            Ok(specs) => specs,
            Err(err) => {
                return PrepareStep::Error(DemoteReason::SaveError(format!(
                    "generate list: {}",
                    err
                )));
            }
        };
        let mut generated = Vec::with_capacity(specs.len());
        for spec in specs {
            let generated_id = spec.item_id(id);
            ctx.gen_pool
                .register_generated(id, generated_id.clone(), spec.objects);
            generated.push(generated_id);
        }
        debug!(item = %id, count = generated.len(), "computed generated list");
        helper.borrow_mut().set_generated(generated);
    }

    let record = match store.get_mut(id) {
        Some(record) => record,
        None => return internal_error("record missing"),
    };
    helper.borrow_mut().mark_started(id);
    record.generation = Some(helper);
    record.save_stage = SaveStage::QueueGeneratedItems;
    PrepareStep::Progressed
}

fn queue_generated_items(
    store: &mut ItemStore,
    id: &ItemId,
    ctx: &mut PrepareContext<'_>,
) -> PrepareStep {
    let record = match store.get_mut(id) {
        Some(record) => record,
        None => return internal_error("record missing"),
    };
    let needing = record.profiles_needing_commit();
    let urgency = record.urgency;
    let queued = record
        .object_cache
        .as_ref()
        .map(|cache| cache.generated_queued)
        .unwrap_or(true);
    let generated: Vec<ItemId> = record
        .generation
        .as_ref()
        .map(|helper| helper.borrow().generated().to_vec())
        .unwrap_or_default();
    if !queued {
        for generated_id in &generated {
            ctx.new_requests.push(
                BuildRequest::new(generated_id.clone(), Instigator::generated(id.clone()))
                    .with_profiles(needing.clone())
                    .with_urgency(urgency),
            );
        }
        if let Some(cache) = record.object_cache.as_mut() {
            cache.generated_queued = true;
        }
    }
    record.save_stage = SaveStage::BeginCacheObjectsToMove;
    PrepareStep::Progressed
}

fn begin_cache_objects_to_move(
    store: &mut ItemStore,
    id: &ItemId,
    ctx: &mut PrepareContext<'_>,
) -> PrepareStep {
    let (needing, generated, mut acquired) = {
        let record = match store.get_mut(id) {
            Some(record) => record,
            None => return internal_error("record missing"),
        };
        let needing = record.profiles_needing_commit();
        let generated: Vec<ItemId> = record
            .generation
            .as_ref()
            .map(|helper| helper.borrow().generated().to_vec())
            .unwrap_or_default();
        let acquired = match record.object_cache.as_mut() {
            Some(cache) => std::mem::take(&mut cache.acquired),
            None => return internal_error("object cache evicted"),
        };
        (needing, generated, acquired)
    };

    let max_per_class = ctx.config.scheduler.max_async_cache_per_class;
    let mut saturated = false;
    'generated: for generated_id in &generated {
        let objects = match ctx.gen_pool.pending_objects(generated_id) {
            Some(objects) => objects.clone(),
            None => continue,
        };
        for object in &objects {
            for profile in &needing {
                let target = match ctx.targets.get(profile.index()) {
                    Some(target) => target,
                    None => continue,
                };
                let outcome = begin_object(
                    ctx.cache,
                    object,
                    *profile,
                    target,
                    ctx.readiness,
                    max_per_class,
                    &mut acquired,
                );
                if outcome == BeginOutcome::Saturated {
                    saturated = true;
                    break 'generated;
                }
            }
        }
    }

    let record = match store.get_mut(id) {
        Some(record) => record,
        None => return internal_error("record missing"),
    };
    if let Some(cache) = record.object_cache.as_mut() {
        cache.acquired = acquired;
    }
    if saturated {
        return PrepareStep::Incomplete;
    }
    record.save_stage = SaveStage::CallPopulate;
    PrepareStep::Progressed
}

fn call_populate(store: &mut ItemStore, id: &ItemId, ctx: &mut PrepareContext<'_>) -> PrepareStep {
    let (splitter, populated, mut generator_objects, generated) = {
        let record = match store.get(id) {
            Some(record) => record,
            None => return internal_error("record missing"),
        };
        let cache = match record.object_cache.as_ref() {
            Some(cache) => cache,
            None => return internal_error("object cache evicted"),
        };
        let generated: Vec<ItemId> = record
            .generation
            .as_ref()
            .map(|helper| helper.borrow().generated().to_vec())
            .unwrap_or_default();
        (cache.splitter, cache.populated, cache.objects.clone(), generated)
    };

    if !populated {
        if let Some(index) = splitter {
            for generated_id in &generated {
                let generated_objects = ctx
                    .gen_pool
                    .pending_objects(generated_id)
                    .cloned()
                    .unwrap_or_default();
                let finalized = match ctx.splitters.get_mut(index).populate(
                    id,
                    generated_id,
                    &mut generator_objects,
                    &generated_objects,
                ) {
                    Ok(finalized) => finalized,
                    Err(err) => {
                        return PrepareStep::Error(DemoteReason::SaveError(format!(
                            "populate {}: {}",
                            generated_id, err
                        )));
                    }
                };
                ctx.gen_pool.set_pending_objects(generated_id, finalized);
            }
        }
    }

    let record = match store.get_mut(id) {
        Some(record) => record,
        None => return internal_error("record missing"),
    };
    if let Some(cache) = record.object_cache.as_mut() {
        if !populated {
            cache.objects = generator_objects;
            cache.populated = true;
        }
    }
    record.save_stage = SaveStage::BeginAsyncCachePost;
    PrepareStep::Progressed
}

fn wait_for_async_cache(
    store: &mut ItemStore,
    id: &ItemId,
    ctx: &mut PrepareContext<'_>,
) -> PrepareStep {
    // Objects that appeared after the last begin pass send the machine
    // back to the first begin stage, under the depth limit.
    {
        let record = match store.get_mut(id) {
            Some(record) => record,
            None => return internal_error("record missing"),
        };
        let object_count = record
            .object_cache
            .as_ref()
            .map(|cache| cache.objects.len())
            .unwrap_or(0);
        if object_count > record.prepared_object_count {
            record.prepare_depth += 1;
            if record.prepare_depth > ctx.config.generation.prepare_depth_limit {
                return internal_error("object cache kept growing during preparation");
            }
            debug!(
                item = %id,
                depth = record.prepare_depth,
                "objects appeared mid-preparation, re-entering"
            );
            record.save_stage = SaveStage::BeginAsyncCacheFirst;
            return PrepareStep::Progressed;
        }
    }

    let acquired: Vec<CacheKey> = match store.get(id).and_then(|r| r.object_cache.as_ref()) {
        Some(cache) => cache.acquired.clone(),
        None => return internal_error("object cache evicted"),
    };
    for key in &acquired {
        let target = match ctx.targets.get(key.1.index()) {
            Some(target) => target,
            None => continue,
        };
        if !ctx.cache.poll(key, target, ctx.readiness) {
            return PrepareStep::Incomplete;
        }
    }

    // Generation ordering: a blocked family member stays incomplete
    // until the constraint is satisfied.
    let allowed = match store.get(id) {
        Some(record) => record
            .generation
            .as_ref()
            .map(|helper| helper.borrow().may_save(id))
            .unwrap_or(true),
        None => return internal_error("record missing"),
    };
    if !allowed {
        return PrepareStep::Incomplete;
    }

    if let Some(record) = store.get_mut(id) {
        record.save_stage = SaveStage::ReadyForSave;
    }
    PrepareStep::Ready
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{ImmediateReadiness, ObjectClassSplitter, StaggeredReadiness};
    use crate::config::default_config;
    use crate::item::generation::GenerationOrder;
    use crate::item::record::{ItemState, ObjectCache, RequestPhase};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn targets() -> Vec<TargetProfile> {
        vec![TargetProfile {
            name: "default".to_string(),
            out_dir: PathBuf::from("/tmp/out"),
            settings: BTreeMap::new(),
        }]
    }

    fn save_item(store: &mut ItemStore, name: &str, objects: Vec<CookObject>) -> ItemId {
        let id = ItemId::new(name);
        store.ensure(&id, Instigator::command_line());
        store.get_mut(&id).unwrap().platform_mut(ProfileId::new(0)).reachable = true;
        store.move_to(&id, ItemState::Request(RequestPhase::InCluster));
        store.move_to(&id, ItemState::Save);
        store.get_mut(&id).unwrap().object_cache = Some(ObjectCache::new(objects));
        id
    }

    struct Harness {
        splitters: SplitterRegistry,
        readiness: Box<dyn ReadinessProvider>,
        cache: AsyncCacheTable,
        gen_pool: GenerationPool,
        targets: Vec<TargetProfile>,
        config: crate::config::KilnConfig,
        new_requests: Vec<BuildRequest>,
    }

    impl Harness {
        fn new(readiness: Box<dyn ReadinessProvider>) -> Self {
            Self {
                splitters: SplitterRegistry::new(),
                readiness,
                cache: AsyncCacheTable::new(),
                gen_pool: GenerationPool::new(),
                targets: targets(),
                config: default_config(),
                new_requests: Vec::new(),
            }
        }

        fn advance(&mut self, store: &mut ItemStore, id: &ItemId) -> PrepareStep {
            let mut ctx = PrepareContext {
                splitters: &mut self.splitters,
                readiness: self.readiness.as_mut(),
                cache: &mut self.cache,
                gen_pool: &mut self.gen_pool,
                targets: &self.targets,
                config: &self.config,
                new_requests: &mut self.new_requests,
            };
            advance_prepare(store, id, &mut ctx)
        }

        fn drive(&mut self, store: &mut ItemStore, id: &ItemId, max_steps: usize) -> PrepareStep {
            for _ in 0..max_steps {
                match self.advance(store, id) {
                    PrepareStep::Progressed => continue,
                    step => return step,
                }
            }
            panic!("machine did not reach a terminal step");
        }
    }

    #[test]
    fn test_plain_item_reaches_ready() {
        let mut store = ItemStore::new(1);
        let id = save_item(&mut store, "a", vec![CookObject::new("a", "mesh")]);
        let mut harness = Harness::new(Box::new(ImmediateReadiness::new()));

        assert!(matches!(harness.drive(&mut store, &id, 16), PrepareStep::Ready));
        assert_eq!(store.get(&id).unwrap().save_stage, SaveStage::ReadyForSave);
        // the acquired entry is held until the write completes
        assert_eq!(store.get(&id).unwrap().object_cache.as_ref().unwrap().acquired.len(), 1);
    }

    #[test]
    fn test_slow_readiness_stays_incomplete_then_ready() {
        let mut store = ItemStore::new(1);
        let id = save_item(&mut store, "a", vec![CookObject::new("a", "shader")]);
        let mut harness = Harness::new(Box::new(StaggeredReadiness::new(2)));

        assert!(matches!(harness.drive(&mut store, &id, 16), PrepareStep::Incomplete));
        // resumable: re-entering keeps the stage and eventually completes
        let mut ready = false;
        for _ in 0..8 {
            if matches!(harness.drive(&mut store, &id, 16), PrepareStep::Ready) {
                ready = true;
                break;
            }
        }
        assert!(ready);
    }

    #[test]
    fn test_class_saturation_reports_incomplete() {
        let mut store = ItemStore::new(1);
        let objects = vec![
            CookObject::new("s0", "shader"),
            CookObject::new("s1", "shader"),
            CookObject::new("s2", "shader"),
        ];
        let id = save_item(&mut store, "a", objects);
        let mut harness = Harness::new(Box::new(StaggeredReadiness::new(100)));
        harness.config.scheduler.max_async_cache_per_class = 2;

        assert!(matches!(harness.drive(&mut store, &id, 16), PrepareStep::Incomplete));
        // only the cap's worth of compiles started
        assert_eq!(harness.cache.inflight_for_class("shader"), 2);
        // progress survives: two objects begun, one pending
        assert_eq!(store.get(&id).unwrap().object_cache.as_ref().unwrap().begun_count, 2);
    }

    #[test]
    fn test_generator_queues_generated_requests() {
        let mut store = ItemStore::new(1);
        let objects = vec![
            CookObject::new("tiles", "generator"),
            CookObject::new("base", "mesh"),
        ];
        let id = save_item(&mut store, "world", objects);
        let mut harness = Harness::new(Box::new(ImmediateReadiness::new()));
        harness.splitters.register(Box::new(ObjectClassSplitter::new("generator")));

        assert!(matches!(harness.drive(&mut store, &id, 32), PrepareStep::Ready));
        assert_eq!(harness.new_requests.len(), 1);
        assert_eq!(
            harness.new_requests[0].id,
            ItemId::new("world/_generated_/tiles")
        );
        assert_eq!(
            harness.new_requests[0].instigator,
            Instigator::generated(id.clone())
        );
        // the generated item can bypass the loader once populated
        assert!(harness.gen_pool.is_generated(&ItemId::new("world/_generated_/tiles")));
        assert!(harness.gen_pool.is_populated(&ItemId::new("world/_generated_/tiles")));
    }

    #[test]
    fn test_generated_first_blocks_generator_until_family_done() {
        let mut store = ItemStore::new(1);
        let objects = vec![CookObject::new("tiles", "generator")];
        let id = save_item(&mut store, "world", objects);
        let mut harness = Harness::new(Box::new(ImmediateReadiness::new()));
        harness.splitters.register(Box::new(ObjectClassSplitter::new("generator")));
        harness.config.generation.order = GenerationOrder::GeneratedFirst;

        // blocked at the wait stage until the generated item finishes
        assert!(matches!(harness.drive(&mut store, &id, 32), PrepareStep::Incomplete));
        assert_eq!(store.get(&id).unwrap().save_stage, SaveStage::WaitForAsyncCache);

        let generated = ItemId::new("world/_generated_/tiles");
        let helper = harness.gen_pool.helper_for(&id).unwrap();
        helper.borrow_mut().mark_finished(&generated);
        drop(helper);

        assert!(matches!(harness.drive(&mut store, &id, 8), PrepareStep::Ready));
    }

    #[test]
    fn test_mid_preparation_objects_reenter_machine() {
        let mut store = ItemStore::new(1);
        let id = save_item(&mut store, "a", vec![CookObject::new("a", "mesh")]);
        let mut harness = Harness::new(Box::new(ImmediateReadiness::new()));

        // run up to the wait stage, then grow the cache behind its back
        loop {
            match harness.advance(&mut store, &id) {
                PrepareStep::Progressed => {
                    if store.get(&id).unwrap().save_stage == SaveStage::WaitForAsyncCache {
                        break;
                    }
                }
                step => panic!("unexpected step before wait: {:?}", step),
            }
        }
        store
            .get_mut(&id)
            .unwrap()
            .object_cache
            .as_mut()
            .unwrap()
            .objects
            .push(CookObject::new("late", "mesh"));

        assert!(matches!(harness.advance(&mut store, &id), PrepareStep::Progressed));
        let record = store.get(&id).unwrap();
        assert_eq!(record.save_stage, SaveStage::BeginAsyncCacheFirst);
        assert_eq!(record.prepare_depth, 1);

        assert!(matches!(harness.drive(&mut store, &id, 16), PrepareStep::Ready));
        assert_eq!(store.get(&id).unwrap().object_cache.as_ref().unwrap().acquired.len(), 2);
    }

    #[test]
    fn test_runaway_reentry_errors_out() {
        let mut store = ItemStore::new(1);
        let id = save_item(&mut store, "a", vec![CookObject::new("a", "mesh")]);
        let mut harness = Harness::new(Box::new(ImmediateReadiness::new()));
        harness.config.generation.prepare_depth_limit = 3;

        let mut counter = 0usize;
        let step = loop {
            match harness.advance(&mut store, &id) {
                PrepareStep::Progressed => {
                    if store.get(&id).unwrap().save_stage == SaveStage::WaitForAsyncCache {
                        // an object appears every time the machine waits
                        counter += 1;
                        store
                            .get_mut(&id)
                            .unwrap()
                            .object_cache
                            .as_mut()
                            .unwrap()
                            .objects
                            .push(CookObject::new(format!("late{}", counter), "mesh"));
                    }
                }
                step => break step,
            }
        };
        assert!(matches!(step, PrepareStep::Error(DemoteReason::SaveError(_))));
    }

    #[test]
    fn test_validation_failure_is_validation_error() {
        struct RejectingSplitter;
        impl crate::collab::ItemSplitter for RejectingSplitter {
            fn name(&self) -> &str {
                "rejecting"
            }
            fn matches(&self, _id: &ItemId, _objects: &[CookObject]) -> bool {
                true
            }
            fn generate_list(
                &mut self,
                _id: &ItemId,
                _objects: &[CookObject],
            ) -> Result<Vec<crate::collab::GeneratedSpec>, String> {
                Ok(Vec::new())
            }
            fn populate(
                &mut self,
                _generator: &ItemId,
                _generated: &ItemId,
                _generator_objects: &mut Vec<CookObject>,
                generated_objects: &[CookObject],
            ) -> Result<Vec<CookObject>, String> {
                Ok(generated_objects.to_vec())
            }
            fn validate(&mut self, id: &ItemId, _objects: &[CookObject]) -> Result<(), String> {
                Err(format!("{} rejected", id))
            }
        }

        let mut store = ItemStore::new(1);
        let id = save_item(&mut store, "bad", vec![CookObject::new("b", "mesh")]);
        let mut harness = Harness::new(Box::new(ImmediateReadiness::new()));
        harness.splitters.register(Box::new(RejectingSplitter));

        let step = harness.drive(&mut store, &id, 8);
        assert!(matches!(step, PrepareStep::Error(DemoteReason::ValidationError(_))));
    }
}
