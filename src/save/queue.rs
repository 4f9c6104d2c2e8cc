//! Save queue: drives the prepare-save machine and artifact writes.
//!
//! Each pump call walks the front of the save FIFO, highest urgency
//! first. An item advances through its preparation stages until it is
//! ready, blocked, or failed: ready items are written and committed for
//! every profile that still needs them, blocked items rotate to the back
//! of their lane, failures demote with `SaveError`. A batch bound keeps
//! save fair against load within one tick.

use std::collections::HashSet;

use tracing::debug;

use crate::collab::{
    ArtifactWriter, CommittedArtifact, ReadinessProvider, SplitterRegistry,
};
use crate::config::KilnConfig;
use crate::error::DemoteReason;
use crate::item::generation::GenerationPool;
use crate::item::record::{CookResult, ItemId, ItemState};
use crate::item::store::ItemStore;
use crate::profile::{ProfileId, TargetProfile};
use crate::request::BuildRequest;
use crate::save::cache::AsyncCacheTable;
use crate::save::prepare::{advance_prepare, PrepareContext, PrepareStep};

/// Result of one save pump call.
#[derive(Debug, Default, Clone, Copy)]
pub struct SavePumpOutcome {
    /// Items written and committed
    pub saved: usize,
    /// Work exists but nothing could progress this call
    pub busy: bool,
}

/// One committed (item, profile) result.
#[derive(Debug)]
pub struct CommittedItem {
    /// The item
    pub id: ItemId,
    /// The profile the artifact was committed for
    pub profile: ProfileId,
    /// What the writer produced
    pub artifact: CommittedArtifact,
    /// Items this one generated, recorded for the incremental oracle
    pub generated: Vec<ItemId>,
}

/// Side effects of a save pump, drained by the session.
#[derive(Debug, Default)]
pub struct SaveOutputs {
    /// Per-profile commits
    pub committed: Vec<CommittedItem>,
    /// Items that finished every profile and returned to Idle
    pub finished: Vec<ItemId>,
    /// Requests queued for generated items
    pub new_requests: Vec<BuildRequest>,
    /// Items demoted during this pump
    pub demoted: Vec<(ItemId, DemoteReason)>,
}

/// Pump the save queue, processing at most `max_items` distinct items.
#[allow(clippy::too_many_arguments)]
pub fn pump_saves(
    store: &mut ItemStore,
    writer: &mut dyn ArtifactWriter,
    splitters: &mut SplitterRegistry,
    readiness: &mut dyn ReadinessProvider,
    cache: &mut AsyncCacheTable,
    gen_pool: &mut GenerationPool,
    targets: &[TargetProfile],
    config: &KilnConfig,
    max_items: usize,
    outputs: &mut SaveOutputs,
) -> SavePumpOutcome {
    let mut outcome = SavePumpOutcome::default();
    let mut progressed = false;
    let mut new_requests: Vec<BuildRequest> = Vec::new();
    let mut seen: HashSet<ItemId> = HashSet::new();

    for _ in 0..max_items {
        let id = match store.queues().save.front() {
            Some(id) => id.clone(),
            None => break,
        };
        if !seen.insert(id.clone()) {
            break;
        }

        let step = {
            let mut ctx = PrepareContext {
                splitters: &mut *splitters,
                readiness: &mut *readiness,
                cache: &mut *cache,
                gen_pool: &mut *gen_pool,
                targets,
                config,
                new_requests: &mut new_requests,
            };
            loop {
                match advance_prepare(store, &id, &mut ctx) {
                    PrepareStep::Progressed => progressed = true,
                    step => break step,
                }
            }
        };

        match step {
            PrepareStep::Progressed => {}
            PrepareStep::Incomplete => {
                let urgency = store.get(&id).map(|r| r.urgency).unwrap_or_default();
                store.rotate_save(urgency);
            }
            PrepareStep::Error(reason) => {
                fail_item(store, cache, gen_pool, &id, reason, outputs);
                progressed = true;
            }
            PrepareStep::Ready => match write_item(store, writer, targets, &id) {
                Ok(mut committed) => {
                    debug!(item = %id, profiles = committed.len(), "item saved");
                    finish_item(store, cache, gen_pool, &id);
                    outputs.committed.append(&mut committed);
                    outputs.finished.push(id.clone());
                    outcome.saved += 1;
                    progressed = true;
                }
                Err(err) => {
                    fail_item(
                        store,
                        cache,
                        gen_pool,
                        &id,
                        DemoteReason::SaveError(err),
                        outputs,
                    );
                    progressed = true;
                }
            },
        }
    }

    outputs.new_requests.append(&mut new_requests);
    outcome.busy = !store.queues().save.is_empty() && !progressed;
    outcome
}

/// Write and commit one item for every profile that still needs it.
fn write_item(
    store: &mut ItemStore,
    writer: &mut dyn ArtifactWriter,
    targets: &[TargetProfile],
    id: &ItemId,
) -> Result<Vec<CommittedItem>, String> {
    let (objects, needing, generated) = {
        let record = store.get(id).ok_or_else(|| "record missing".to_string())?;
        let objects = record
            .object_cache
            .as_ref()
            .map(|cache| cache.objects.clone())
            .unwrap_or_default();
        let generated = record
            .generation
            .as_ref()
            .map(|helper| helper.borrow().generated().to_vec())
            .unwrap_or_default();
        (objects, record.profiles_needing_commit(), generated)
    };

    let mut committed = Vec::with_capacity(needing.len());
    for profile in needing {
        let target = targets
            .get(profile.index())
            .ok_or_else(|| format!("unknown profile {}", profile))?;
        writer.open_item(target, id)?;
        for object in &objects {
            let payload = format!("{}:{}", object.class, object.name);
            writer.write_object(target, id, object, payload.as_bytes())?;
        }
        let artifact = writer.commit_item(target, id)?;
        let record = store
            .get_mut(id)
            .ok_or_else(|| "record missing".to_string())?;
        let sub = record.platform_mut(profile);
        sub.set_result(CookResult::Succeeded);
        sub.mark_committed();
        committed.push(CommittedItem {
            id: id.clone(),
            profile,
            artifact,
            generated: generated.clone(),
        });
    }
    Ok(committed)
}

/// Return a fully written item to Idle, releasing its prepare state.
fn finish_item(
    store: &mut ItemStore,
    cache: &mut AsyncCacheTable,
    gen_pool: &mut GenerationPool,
    id: &ItemId,
) {
    let generator = release_prepare_state(store, cache, id);
    store.move_to(id, ItemState::Idle);
    if let Some(record) = store.get_mut(id) {
        record.clear_in_flight();
        record.last_demote = None;
    }
    release_family_if_complete(gen_pool, generator);
}

/// Release the family's helper once its last member is done. Earlier
/// finishers must leave the bookkeeping in place for the rest.
pub(crate) fn release_family_if_complete(gen_pool: &mut GenerationPool, generator: Option<ItemId>) {
    if let Some(generator) = generator {
        let complete = gen_pool
            .helper_for(&generator)
            .map(|helper| helper.borrow().family_complete())
            .unwrap_or(false);
        if complete {
            gen_pool.release_if_unreferenced(&generator);
        }
    }
}

/// Demote a failed item, releasing partially-acquired cache entries.
fn fail_item(
    store: &mut ItemStore,
    cache: &mut AsyncCacheTable,
    gen_pool: &mut GenerationPool,
    id: &ItemId,
    reason: DemoteReason,
    outputs: &mut SaveOutputs,
) {
    let generator = release_prepare_state(store, cache, id);
    if let Some(record) = store.get_mut(id) {
        record.prepare_failed = true;
    }
    store.demote(id, reason.clone());
    release_family_if_complete(gen_pool, generator);
    outputs.demoted.push((id.clone(), reason));
}

/// Release acquired cache entries and the generation reference, marking
/// the item finished within its family. Returns the family's generator.
fn release_prepare_state(
    store: &mut ItemStore,
    cache: &mut AsyncCacheTable,
    id: &ItemId,
) -> Option<ItemId> {
    let record = store.get_mut(id)?;
    let keys = record
        .object_cache
        .as_mut()
        .map(|c| std::mem::take(&mut c.acquired))
        .unwrap_or_default();
    record.object_cache = None;
    let generator = record.generation.take().map(|helper| {
        let mut helper = helper.borrow_mut();
        helper.mark_finished(id);
        helper.generator.clone()
    });
    cache.release(&keys);
    generator
}
