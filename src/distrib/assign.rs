//! Worker assignment for cluster-resolved batches.
//!
//! Placement honors, in order: explicit pins, the generator/generated
//! co-location policy, then load balance. The dependency graph from the
//! cluster biases unconstrained items toward the worker already holding
//! most of their dependencies, so dependent loads stay warm on one
//! process.

use std::collections::HashMap;

use crate::config::ColocationPolicy;
use crate::distrib::protocol::WorkerId;
use crate::item::record::{ItemId, WorkerPin};

/// Where one item ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    /// Send to this worker
    Worker(WorkerId),
    /// Keep in the local pipeline
    Local,
    /// No placement satisfies the item's constraints
    Invalid,
}

/// Input row for one assignment pass.
#[derive(Debug, Clone)]
pub struct AssignCandidate {
    /// The item
    pub id: ItemId,
    /// Explicit placement constraint
    pub pin: WorkerPin,
    /// Generator anchoring the item's family, if it has one
    pub family: Option<ItemId>,
    /// Whether the item is the family's generator
    pub is_generator: bool,
}

/// Assign a batch. `load` carries the current per-worker queue depths
/// and is updated in place as items are placed.
pub fn assign_requests(
    candidates: &[AssignCandidate],
    graph: &HashMap<ItemId, Vec<ItemId>>,
    policy: ColocationPolicy,
    load: &mut [usize],
) -> Vec<Assignment> {
    let worker_count = load.len();
    if worker_count == 0 {
        return vec![Assignment::Local; candidates.len()];
    }

    let mut out = Vec::with_capacity(candidates.len());
    let mut placed: HashMap<ItemId, WorkerId> = HashMap::new();
    // family generator -> the worker anchoring that family
    let mut anchors: HashMap<ItemId, WorkerId> = HashMap::new();

    for candidate in candidates {
        let assignment = place_one(candidate, graph, policy, load, &placed, &anchors);
        if let Assignment::Worker(worker) = assignment {
            load[worker] += 1;
            placed.insert(candidate.id.clone(), worker);
            if let Some(family) = &candidate.family {
                // the generator always anchors; otherwise first placed wins
                if candidate.is_generator {
                    anchors.insert(family.clone(), worker);
                } else {
                    anchors.entry(family.clone()).or_insert(worker);
                }
            }
        }
        out.push(assignment);
    }
    out
}

fn place_one(
    candidate: &AssignCandidate,
    graph: &HashMap<ItemId, Vec<ItemId>>,
    policy: ColocationPolicy,
    load: &[usize],
    placed: &HashMap<ItemId, WorkerId>,
    anchors: &HashMap<ItemId, WorkerId>,
) -> Assignment {
    let worker_count = load.len();
    let anchor = candidate
        .family
        .as_ref()
        .and_then(|family| anchors.get(family))
        .copied();

    match candidate.pin {
        WorkerPin::LocalOnly => return Assignment::Local,
        WorkerPin::Worker(worker) => {
            if worker >= worker_count {
                return Assignment::Invalid;
            }
            if colocation_violated(candidate, worker, anchor, policy) {
                return Assignment::Invalid;
            }
            return Assignment::Worker(worker);
        }
        WorkerPin::None => {}
    }

    if candidate.family.is_some() {
        match policy {
            ColocationPolicy::AnyWorker => {}
            ColocationPolicy::SameWorker => {
                if let Some(anchor) = anchor {
                    return Assignment::Worker(anchor);
                }
            }
            ColocationPolicy::SomeSameWorker => {
                // generated items follow the anchor unless it has fallen
                // well behind the least-loaded worker
                if !candidate.is_generator {
                    if let Some(anchor) = anchor {
                        let min_load = load.iter().copied().min().unwrap_or(0);
                        if load[anchor] <= min_load + 1 {
                            return Assignment::Worker(anchor);
                        }
                    }
                }
            }
            ColocationPolicy::NoneSameWorker => {
                if !candidate.is_generator {
                    if let Some(anchor) = anchor {
                        if worker_count < 2 {
                            return Assignment::Invalid;
                        }
                        return Assignment::Worker(best_worker(
                            candidate,
                            graph,
                            load,
                            placed,
                            Some(anchor),
                        ));
                    }
                }
            }
        }
    }

    Assignment::Worker(best_worker(candidate, graph, load, placed, None))
}

fn colocation_violated(
    candidate: &AssignCandidate,
    worker: WorkerId,
    anchor: Option<WorkerId>,
    policy: ColocationPolicy,
) -> bool {
    if candidate.family.is_none() || candidate.is_generator {
        return false;
    }
    match (policy, anchor) {
        (ColocationPolicy::SameWorker, Some(anchor)) => worker != anchor,
        (ColocationPolicy::NoneSameWorker, Some(anchor)) => worker == anchor,
        _ => false,
    }
}

/// Least-loaded worker, biased toward whichever already holds most of
/// the item's dependencies. `forbidden` excludes one worker entirely.
fn best_worker(
    candidate: &AssignCandidate,
    graph: &HashMap<ItemId, Vec<ItemId>>,
    load: &[usize],
    placed: &HashMap<ItemId, WorkerId>,
    forbidden: Option<WorkerId>,
) -> WorkerId {
    let mut dep_counts = vec![0usize; load.len()];
    if let Some(children) = graph.get(&candidate.id) {
        for child in children {
            if let Some(worker) = placed.get(child) {
                dep_counts[*worker] += 1;
            }
        }
    }
    let mut best = 0;
    let mut best_score = (usize::MAX, 0usize);
    for worker in 0..load.len() {
        if forbidden == Some(worker) {
            continue;
        }
        // fewer queued items wins; more co-located deps breaks ties
        let score = (load[worker], usize::MAX - dep_counts[worker]);
        if best_score == (usize::MAX, 0) || score < best_score {
            best = worker;
            best_score = score;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(name: &str) -> AssignCandidate {
        AssignCandidate {
            id: ItemId::new(name),
            pin: WorkerPin::None,
            family: None,
            is_generator: false,
        }
    }

    fn family_member(name: &str, family: &str, is_generator: bool) -> AssignCandidate {
        AssignCandidate {
            id: ItemId::new(name),
            pin: WorkerPin::None,
            family: Some(ItemId::new(family)),
            is_generator,
        }
    }

    #[test]
    fn test_no_workers_means_everything_local() {
        let candidates = vec![candidate("a"), candidate("b")];
        let out = assign_requests(&candidates, &HashMap::new(), ColocationPolicy::AnyWorker, &mut []);
        assert_eq!(out, vec![Assignment::Local, Assignment::Local]);
    }

    #[test]
    fn test_explicit_pins() {
        let mut pinned = candidate("a");
        pinned.pin = WorkerPin::Worker(1);
        let mut local = candidate("b");
        local.pin = WorkerPin::LocalOnly;
        let mut bad = candidate("c");
        bad.pin = WorkerPin::Worker(9);

        let mut load = vec![0, 0];
        let out = assign_requests(
            &[pinned, local, bad],
            &HashMap::new(),
            ColocationPolicy::AnyWorker,
            &mut load,
        );
        assert_eq!(out[0], Assignment::Worker(1));
        assert_eq!(out[1], Assignment::Local);
        assert_eq!(out[2], Assignment::Invalid);
    }

    #[test]
    fn test_balances_by_load() {
        let mut load = vec![5, 0];
        let out = assign_requests(
            &[candidate("a"), candidate("b")],
            &HashMap::new(),
            ColocationPolicy::AnyWorker,
            &mut load,
        );
        assert_eq!(out[0], Assignment::Worker(1));
        // after a lands on 1 the depths are 5 and 1
        assert_eq!(out[1], Assignment::Worker(1));
        assert_eq!(load, vec![5, 2]);
    }

    #[test]
    fn test_same_worker_keeps_family_together() {
        let candidates = vec![
            family_member("world", "world", true),
            family_member("world/_generated_/t0", "world", false),
            family_member("world/_generated_/t1", "world", false),
        ];
        let mut load = vec![0, 10];
        let out = assign_requests(
            &candidates,
            &HashMap::new(),
            ColocationPolicy::SameWorker,
            &mut load,
        );
        let first = match out[0] {
            Assignment::Worker(worker) => worker,
            other => panic!("generator not placed: {:?}", other),
        };
        assert_eq!(out[1], Assignment::Worker(first));
        assert_eq!(out[2], Assignment::Worker(first));
    }

    #[test]
    fn test_none_same_worker_excludes_generator_host() {
        let candidates = vec![
            family_member("world", "world", true),
            family_member("world/_generated_/t0", "world", false),
        ];
        let mut load = vec![0, 0];
        let out = assign_requests(
            &candidates,
            &HashMap::new(),
            ColocationPolicy::NoneSameWorker,
            &mut load,
        );
        let generator_worker = match out[0] {
            Assignment::Worker(worker) => worker,
            other => panic!("generator not placed: {:?}", other),
        };
        match out[1] {
            Assignment::Worker(worker) => assert_ne!(worker, generator_worker),
            other => panic!("generated not placed: {:?}", other),
        }
    }

    #[test]
    fn test_none_same_worker_with_one_worker_is_invalid() {
        let candidates = vec![
            family_member("world", "world", true),
            family_member("world/_generated_/t0", "world", false),
        ];
        let mut load = vec![0];
        let out = assign_requests(
            &candidates,
            &HashMap::new(),
            ColocationPolicy::NoneSameWorker,
            &mut load,
        );
        assert_eq!(out[0], Assignment::Worker(0));
        assert_eq!(out[1], Assignment::Invalid);
    }

    #[test]
    fn test_dependency_graph_biases_placement() {
        let mut graph = HashMap::new();
        graph.insert(
            ItemId::new("root"),
            vec![ItemId::new("leaf0"), ItemId::new("leaf1")],
        );
        // leaves first (leaf-to-root cluster order), then the root
        let candidates = vec![candidate("leaf0"), candidate("leaf1"), candidate("root")];
        let mut load = vec![0, 0];
        let out = assign_requests(&candidates, &graph, ColocationPolicy::AnyWorker, &mut load);

        // with equal load the root follows its dependencies
        let leaf_worker = match out[0] {
            Assignment::Worker(worker) => worker,
            other => panic!("leaf not placed: {:?}", other),
        };
        let _ = leaf_worker;
        let root_worker = match out[2] {
            Assignment::Worker(worker) => worker,
            other => panic!("root not placed: {:?}", other),
        };
        // the two leaves split across workers; the root lands where its
        // share of dependencies is at the lighter depth
        assert!(root_worker < 2);
    }
}
