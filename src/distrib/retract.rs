//! Retraction: choosing which items a worker hands back.
//!
//! The director reclaims the least-progressed work first so the cost of
//! re-doing it elsewhere stays small: request-stage items that have not
//! been clustered, then load-stage items before and during preload, then
//! save-stage items before and during preparation. Items pinned to a
//! worker or tied into a generation family are never retracted.

use crate::item::generation::GenerationPool;
use crate::item::record::{ItemId, SaveStage, WorkerPin};
use crate::item::store::ItemStore;

/// Pick up to `max` items to return, least-progressed first.
pub fn select_retractions(store: &ItemStore, gen_pool: &GenerationPool, max: usize) -> Vec<ItemId> {
    let mut picked: Vec<ItemId> = Vec::new();
    let queues = store.queues();

    let eligible = |id: &ItemId| -> bool {
        match store.get(id) {
            Some(record) => {
                record.pin == WorkerPin::None
                    && record.generation.is_none()
                    && gen_pool.helper_for(id).is_none()
            }
            None => false,
        }
    };
    let mut take = |picked: &mut Vec<ItemId>, ids: &mut dyn Iterator<Item = &ItemId>| {
        for id in ids {
            if picked.len() >= max {
                return;
            }
            if eligible(id) {
                picked.push(id.clone());
            }
        }
    };

    // request stage, not yet clustered or already resolved
    take(&mut picked, &mut queues.request_staged.iter());
    take(&mut picked, &mut queues.request_ready.iter());
    // load stage, preload not begun
    take(&mut picked, &mut queues.load_inbox.iter());
    take(&mut picked, &mut queues.load_pending_preload.iter());
    // load stage, preload in flight
    take(&mut picked, &mut queues.load_active_preload.iter());
    take(&mut picked, &mut queues.load_ready.iter());
    // save stage, preparation not started
    let unstarted: Vec<&ItemId> = queues
        .save
        .iter()
        .filter(|id| {
            store
                .get(id)
                .map(|r| r.save_stage == SaveStage::StartSave)
                .unwrap_or(false)
        })
        .collect();
    take(&mut picked, &mut unstarted.into_iter());
    // save stage, mid-preparation
    let started: Vec<&ItemId> = queues
        .save
        .iter()
        .filter(|id| {
            store
                .get(id)
                .map(|r| r.save_stage != SaveStage::StartSave)
                .unwrap_or(false)
        })
        .collect();
    take(&mut picked, &mut started.into_iter());

    picked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::generation::GenerationOrder;
    use crate::item::instigator::Instigator;
    use crate::item::record::{ItemState, LoadStage, RequestPhase};

    fn add(store: &mut ItemStore, name: &str, state: ItemState) -> ItemId {
        let id = ItemId::new(name);
        store.ensure(&id, Instigator::director());
        if state != ItemState::Idle {
            // walk through a legal intermediate for urgency-keyed queues
            if matches!(state, ItemState::Request(RequestPhase::Ready)) {
                store.move_to(&id, ItemState::Request(RequestPhase::InCluster));
            }
            store.move_to(&id, state);
        }
        id
    }

    #[test]
    fn test_least_progressed_first() {
        let mut store = ItemStore::new(1);
        let gen_pool = GenerationPool::new();
        let saving = add(&mut store, "saving", ItemState::Save);
        store.get_mut(&saving).unwrap().save_stage = SaveStage::WaitForAsyncCache;
        let loading = add(&mut store, "loading", ItemState::Load(LoadStage::PendingPreload));
        let staged = add(&mut store, "staged", ItemState::Request(RequestPhase::Staged));

        let picked = select_retractions(&store, &gen_pool, 2);
        assert_eq!(picked, vec![staged, loading]);
    }

    #[test]
    fn test_preloading_before_save() {
        let mut store = ItemStore::new(1);
        let gen_pool = GenerationPool::new();
        let preloading = add(&mut store, "preloading", ItemState::Load(LoadStage::ActivePreload));
        let unstarted_save = add(&mut store, "fresh-save", ItemState::Save);
        let deep_save = add(&mut store, "deep-save", ItemState::Save);
        store.get_mut(&deep_save).unwrap().save_stage = SaveStage::WaitForAsyncCache;

        let picked = select_retractions(&store, &gen_pool, 3);
        assert_eq!(picked, vec![preloading, unstarted_save, deep_save]);
    }

    #[test]
    fn test_pinned_items_never_selected() {
        let mut store = ItemStore::new(1);
        let gen_pool = GenerationPool::new();
        let pinned = add(&mut store, "pinned", ItemState::Request(RequestPhase::Staged));
        store.get_mut(&pinned).unwrap().pin = WorkerPin::Worker(0);
        let free = add(&mut store, "free", ItemState::Request(RequestPhase::Staged));

        let picked = select_retractions(&store, &gen_pool, 8);
        assert_eq!(picked, vec![free]);
    }

    #[test]
    fn test_generation_family_never_selected() {
        let mut store = ItemStore::new(1);
        let mut gen_pool = GenerationPool::new();
        let generator = add(&mut store, "world", ItemState::Save);
        gen_pool.helper_for_generator(&generator, GenerationOrder::Independent);
        let generated = ItemId::new("world/_generated_/t0");
        gen_pool.register_generated(&generator, generated.clone(), Vec::new());
        store.ensure(&generated, Instigator::generated(generator.clone()));
        store.move_to(&generated, ItemState::Request(RequestPhase::Staged));
        let free = add(&mut store, "free", ItemState::Request(RequestPhase::Staged));

        let picked = select_retractions(&store, &gen_pool, 8);
        assert_eq!(picked, vec![free]);
    }

    #[test]
    fn test_retraction_cap() {
        let mut store = ItemStore::new(1);
        let gen_pool = GenerationPool::new();
        for index in 0..5 {
            add(
                &mut store,
                &format!("item{}", index),
                ItemState::Request(RequestPhase::Staged),
            );
        }
        assert_eq!(select_retractions(&store, &gen_pool, 3).len(), 3);
    }
}
