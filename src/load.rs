//! Load queue and preloader.
//!
//! Items flow Inbox -> PendingPreload -> ActivePreload -> ReadyForLoad,
//! then through the blocking load call into the save queue. Preloading
//! warms raw import data on background threads, bounded by a concurrent
//! preload cap; the batch size bounds how many blocking loads one pump
//! call performs so load stays fair against save.

use tracing::debug;

use crate::collab::ItemLoader;
use crate::config::SchedulerConfig;
use crate::error::DemoteReason;
use crate::item::generation::GenerationPool;
use crate::item::instigator::Instigator;
use crate::item::record::{ItemId, ItemState, LoadStage, ObjectCache, SaveStage};
use crate::item::store::ItemStore;
use crate::profile::ProfileId;
use crate::request::{BuildRequest, DiscoveryEvent};

/// Result of one load pump call.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoadPumpOutcome {
    /// Items pushed through the blocking load into save
    pub pushed: usize,
    /// Work exists but nothing could progress this call
    pub busy: bool,
}

/// Side effects of a load pump, drained by the session.
#[derive(Debug, Default)]
pub struct LoadOutputs {
    /// Dependencies discovered while loading
    pub discoveries: Vec<DiscoveryEvent>,
    /// Follow-up requests (redirect targets)
    pub new_requests: Vec<BuildRequest>,
    /// Items demoted during this pump
    pub demoted: Vec<(ItemId, DemoteReason)>,
}

/// Pump the load pipeline.
///
/// Tops the pipeline up from ready requests to `desired` items, walks
/// the preload stages, and performs at most `config.load_batch_size`
/// blocking loads.
pub fn pump_loads(
    store: &mut ItemStore,
    loader: &mut dyn ItemLoader,
    gen_pool: &mut GenerationPool,
    config: &SchedulerConfig,
    desired: usize,
    outputs: &mut LoadOutputs,
) -> LoadPumpOutcome {
    let mut outcome = LoadPumpOutcome::default();
    let mut progressed = false;

    // Top up from completed request clusters.
    while store.queues().load_total() < desired {
        let id = match store.queues().request_ready.front() {
            Some(id) => id.clone(),
            None => break,
        };
        store.move_to(&id, ItemState::Load(LoadStage::Inbox));
        progressed = true;
    }

    // Inbox items all advance to the preload stage.
    while let Some(id) = store.queues().load_inbox.front().cloned() {
        store.move_to(&id, ItemState::Load(LoadStage::PendingPreload));
        progressed = true;
    }

    // Start preloads up to the concurrency cap. Generated items skip
    // preloading entirely; their objects are already in memory.
    while store.queues().load_active_preload.len() < config.max_concurrent_preloads {
        let id = match store.queues().load_pending_preload.front().cloned() {
            Some(id) => id,
            None => break,
        };
        if gen_pool.is_generated(&id) {
            store.move_to(&id, ItemState::Load(LoadStage::ReadyForLoad));
            progressed = true;
            continue;
        }
        match loader.begin_preload(&id) {
            Some(ticket) => {
                if let Some(record) = store.get_mut(&id) {
                    record.preload = Some(ticket);
                }
                store.move_to(&id, ItemState::Load(LoadStage::ActivePreload));
            }
            None => {
                store.move_to(&id, ItemState::Load(LoadStage::ReadyForLoad));
            }
        }
        progressed = true;
    }

    // Poll active preloads.
    let active: Vec<ItemId> = store.queues().load_active_preload.iter().cloned().collect();
    for id in active {
        let finished = match store.get_mut(&id).and_then(|r| r.preload.as_mut()) {
            Some(ticket) => ticket.poll(),
            None => true,
        };
        if finished {
            if let Some(record) = store.get_mut(&id) {
                record.preloaded = record.preload.take().and_then(|mut t| t.take());
            }
            store.move_to(&id, ItemState::Load(LoadStage::ReadyForLoad));
            progressed = true;
        }
    }

    // Blocking loads, bounded by the batch size.
    let mut seen: std::collections::HashSet<ItemId> = std::collections::HashSet::new();
    for _ in 0..config.load_batch_size {
        let id = match store.queues().load_ready.front() {
            Some(id) => id.clone(),
            None => break,
        };
        if !seen.insert(id.clone()) {
            break;
        }
        // A generated item may not load until its generator's populate
        // pass has finalized its objects.
        if gen_pool.is_generated(&id) && !gen_pool.is_populated(&id) {
            let urgency = store.get(&id).map(|r| r.urgency).unwrap_or_default();
            store.rotate_load_ready(urgency);
            continue;
        }
        load_one(store, loader, gen_pool, &id, outputs);
        outcome.pushed += 1;
        progressed = true;
    }

    outcome.busy = store.queues().load_total() > 0 && !progressed;
    outcome
}

/// Load a single item and route it onward.
fn load_one(
    store: &mut ItemStore,
    loader: &mut dyn ItemLoader,
    gen_pool: &mut GenerationPool,
    id: &ItemId,
    outputs: &mut LoadOutputs,
) {
    // Committed while queued (e.g. by a redirect of a twin request):
    // demote without loading.
    let record = match store.get(id) {
        Some(record) => record,
        None => return,
    };
    if !record.needs_any_commit() {
        store.demote(id, DemoteReason::AlreadyCooked);
        outputs.demoted.push((id.clone(), DemoteReason::AlreadyCooked));
        return;
    }
    let urgency = record.urgency;
    let needing: Vec<ProfileId> = record.profiles_needing_commit();

    // An id under a split namespace whose generator never registered it
    // has no object source at all.
    if id.split_origin().is_some() && !gen_pool.is_generated(id) {
        store.demote(id, DemoteReason::OrphanedGenerated);
        outputs.demoted.push((id.clone(), DemoteReason::OrphanedGenerated));
        return;
    }

    // Generated items bypass the loader; their objects were produced by
    // the generator's split.
    if let Some(objects) = gen_pool.take_pending_objects(id) {
        if let Some(record) = store.get_mut(id) {
            record.object_cache = Some(ObjectCache::new(objects));
            record.save_stage = SaveStage::StartSave;
        }
        store.move_to(id, ItemState::Save);
        return;
    }

    let preloaded = store.get_mut(id).and_then(|r| r.preloaded.take());
    match loader.load(id, preloaded) {
        Err(err) => {
            debug!(item = %id, error = %err, "load failed");
            store.demote(id, DemoteReason::LoadError(err.clone()));
            outputs.demoted.push((id.clone(), DemoteReason::LoadError(err)));
        }
        Ok(loaded) => {
            if let Some(target) = loaded.redirect {
                // The original is finished under its old name; the
                // resolved name goes through a fresh request so it is
                // never processed under a stale identity.
                if let Some(record) = store.get_mut(id) {
                    record.commit_all_reachable(
                        crate::item::record::CookResult::NeverCookPlaceholder,
                    );
                }
                store.demote(id, DemoteReason::Redirected(target.as_str().to_string()));
                outputs
                    .demoted
                    .push((id.clone(), DemoteReason::Redirected(target.as_str().to_string())));
                outputs.new_requests.push(
                    BuildRequest::new(target, Instigator::dependency(id.clone()))
                        .with_profiles(needing)
                        .with_urgency(urgency),
                );
                return;
            }
            for reference in loaded.references {
                outputs.discoveries.push(DiscoveryEvent {
                    id: reference,
                    profiles: needing.clone(),
                    instigator: Instigator::dependency(id.clone()),
                    urgency,
                });
            }
            if let Some(record) = store.get_mut(id) {
                record.object_cache = Some(ObjectCache::new(loaded.objects));
                record.save_stage = SaveStage::StartSave;
            }
            store.move_to(id, ItemState::Save);
        }
    }
}
