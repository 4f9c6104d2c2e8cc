//! Request clusters: batch dependency and reachability resolution.
//!
//! A cluster owns a batch of requested items, walks their transitive
//! dependencies to decide which profiles actually need each item built,
//! classifies items with nothing left to build for demotion, and yields
//! a leaf-to-root ordering plus the dependency graph used by worker
//! assignment.
//!
//! Clusters are processed strictly one at a time, in FIFO order, to
//! completion. An item may belong to at most one cluster, so two
//! clusters can never fight over the same item. Traversal is
//! time-sliced through a per-call exploration budget.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::{debug, warn};

use crate::collab::DependencyProvider;
use crate::config::KilnConfig;
use crate::error::DemoteReason;
use crate::incremental::oracle::{ChangeClass, ProfileOracle};
use crate::item::instigator::Instigator;
use crate::item::record::{CookResult, ItemId, ItemState, RequestPhase};
use crate::item::store::ItemStore;
use crate::profile::ProfileId;

/// Result of a completed cluster.
#[derive(Debug, Default)]
pub struct ClusterOutput {
    /// Items to hand to load or worker assignment, leaf-to-root
    pub ready: Vec<ItemId>,
    /// Items to demote, with the suppress reason
    pub demote: Vec<(ItemId, DemoteReason)>,
    /// Dependency edges (parent to children) discovered during traversal
    pub graph: HashMap<ItemId, Vec<ItemId>>,
}

/// Progress of one processing call.
#[derive(Debug)]
pub enum ClusterStatus {
    /// The exploration budget ran out; call again
    Incomplete,
    /// Traversal finished; the cluster is spent
    Complete(ClusterOutput),
}

/// One in-flight request cluster.
#[derive(Debug)]
pub struct RequestCluster {
    /// Members in insertion order; every member is in
    /// `ItemState::Request(RequestPhase::InCluster)`
    members: Vec<ItemId>,
    member_set: HashSet<ItemId>,
    /// Per-item profile reachability flags
    reachability: HashMap<ItemId, Vec<bool>>,
    /// BFS frontier of items whose dependencies still need exploring
    frontier: VecDeque<ItemId>,
    explored: HashSet<ItemId>,
    graph: HashMap<ItemId, Vec<ItemId>>,
    profile_count: usize,
}

impl RequestCluster {
    /// Empty cluster for the session's profile count.
    pub fn new(profile_count: usize) -> Self {
        Self {
            members: Vec::new(),
            member_set: HashSet::new(),
            reachability: HashMap::new(),
            frontier: VecDeque::new(),
            explored: HashSet::new(),
            graph: HashMap::new(),
            profile_count,
        }
    }

    /// Add a requested root. The caller has already moved the item into
    /// `RequestPhase::InCluster`. An empty profile list means all.
    pub fn add_root(&mut self, id: ItemId, profiles: &[ProfileId]) {
        let flags = self.flags_for(profiles);
        self.merge_reachability(&id, &flags);
        if self.member_set.insert(id.clone()) {
            self.members.push(id.clone());
        }
        self.frontier.push_back(id);
    }

    /// Member ids, in insertion order.
    pub fn members(&self) -> &[ItemId] {
        &self.members
    }

    /// Whether the cluster owns `id`.
    pub fn contains(&self, id: &ItemId) -> bool {
        self.member_set.contains(id)
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the cluster has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    fn flags_for(&self, profiles: &[ProfileId]) -> Vec<bool> {
        if profiles.is_empty() {
            vec![true; self.profile_count]
        } else {
            let mut flags = vec![false; self.profile_count];
            for profile in profiles {
                flags[profile.index()] = true;
            }
            flags
        }
    }

    /// Merge flags into an item's reachability; returns whether anything
    /// changed.
    fn merge_reachability(&mut self, id: &ItemId, flags: &[bool]) -> bool {
        let entry = self
            .reachability
            .entry(id.clone())
            .or_insert_with(|| vec![false; self.profile_count]);
        let mut changed = false;
        for (slot, flag) in entry.iter_mut().zip(flags) {
            if *flag && !*slot {
                *slot = true;
                changed = true;
            }
        }
        changed
    }

    /// Run traversal under an exploration budget.
    pub fn process(
        &mut self,
        store: &mut ItemStore,
        deps: &mut dyn DependencyProvider,
        oracles: &[ProfileOracle],
        config: &KilnConfig,
        budget: usize,
    ) -> ClusterStatus {
        let mut spent = 0usize;
        while spent < budget {
            let current = match self.frontier.pop_front() {
                Some(id) => id,
                None => break,
            };
            spent += 1;
            let first_visit = self.explored.insert(current.clone());
            let flags = self.reachability[&current].clone();

            let dep_ids = match deps.dependencies(&current) {
                Ok(dep_ids) => dep_ids,
                Err(err) => {
                    // Unresolvable items are logged and skipped, never
                    // fatal to the cluster.
                    if first_visit {
                        debug!(item = %current, error = %err, "dependency scan failed");
                    }
                    continue;
                }
            };

            for dep in dep_ids {
                let edges = self.graph.entry(current.clone()).or_default();
                if !edges.contains(&dep) {
                    edges.push(dep.clone());
                }
                if !deps.exists(&dep) {
                    warn!(item = %current, dependency = %dep, "skipping unresolvable dependency");
                    continue;
                }
                let changed = self.merge_reachability(&dep, &flags);
                self.try_adopt(store, &current, &dep);
                if changed || !self.explored.contains(&dep) {
                    self.frontier.push_back(dep);
                }
            }
        }

        if self.frontier.is_empty() {
            ClusterStatus::Complete(self.finish(store, oracles, config))
        } else {
            ClusterStatus::Incomplete
        }
    }

    /// Pull an Idle, uncommitted dependency into this cluster.
    fn try_adopt(&mut self, store: &mut ItemStore, parent: &ItemId, dep: &ItemId) {
        if self.member_set.contains(dep) {
            return;
        }
        let urgency = store.get(parent).map(|r| r.urgency).unwrap_or_default();
        let record = store.ensure(dep, Instigator::dependency(parent.clone()));
        if record.state() != ItemState::Idle {
            // already active in another queue; leave it alone
            return;
        }
        if record.all_reachable_committed() && record.platforms.iter().any(|p| p.reachable) {
            // finished earlier this session
            return;
        }
        store.move_to(dep, ItemState::Request(RequestPhase::InCluster));
        store.raise_urgency(dep, urgency);
        self.member_set.insert(dep.clone());
        self.members.push(dep.clone());
    }

    /// Apply reachability to the records and split members into ready
    /// and demoted.
    fn finish(
        &mut self,
        store: &mut ItemStore,
        oracles: &[ProfileOracle],
        config: &KilnConfig,
    ) -> ClusterOutput {
        let mut output = ClusterOutput { graph: std::mem::take(&mut self.graph), ..Default::default() };
        let mut ready_set: HashSet<ItemId> = HashSet::new();

        for id in &self.members {
            let never_cook = config.never_cook.iter().any(|prefix| id.has_prefix(prefix));
            let flags = self.reachability[id].clone();
            let record = match store.get_mut(id) {
                Some(record) => record,
                None => continue,
            };

            let mut needed = false;
            let mut any_prior_built = false;
            for (index, flag) in flags.iter().enumerate() {
                if !flag {
                    continue;
                }
                let profile = ProfileId::new(index);
                let sub = record.platform_mut(profile);
                sub.reachable = true;
                if sub.is_committed() {
                    continue;
                }
                if never_cook {
                    continue;
                }
                match oracles.get(index).and_then(|o| o.class_of(id)) {
                    Some(ChangeClass::IdenticalBuilt) => {
                        // carry the previous result forward
                        let sub = record.platform_mut(profile);
                        sub.incrementally_unmodified = true;
                        sub.set_result(CookResult::Succeeded);
                        sub.mark_committed();
                        any_prior_built = true;
                    }
                    Some(ChangeClass::IdenticalUncooked) => {}
                    _ => needed = true,
                }
            }

            if never_cook {
                record.commit_all_reachable(CookResult::NeverCookPlaceholder);
                output.demote.push((id.clone(), DemoteReason::NeverCook));
            } else if !needed {
                let reason = if any_prior_built || record.platforms.iter().any(|p| p.is_committed())
                {
                    DemoteReason::AlreadyCooked
                } else {
                    DemoteReason::NotReachable
                };
                output.demote.push((id.clone(), reason));
            } else {
                ready_set.insert(id.clone());
            }
        }

        // Leaf-to-root ordering: post-order walk seeded from members in
        // insertion order, restricted to ready items.
        let mut ordered: Vec<ItemId> = Vec::with_capacity(ready_set.len());
        let mut visited: HashSet<ItemId> = HashSet::new();
        for seed in &self.members {
            self.post_order(seed, &output.graph, &ready_set, &mut visited, &mut ordered);
        }
        // record resolved deps for urgency propagation later
        for id in &ordered {
            let children: Vec<ItemId> = output
                .graph
                .get(id)
                .map(|deps| deps.iter().filter(|d| ready_set.contains(*d)).cloned().collect())
                .unwrap_or_default();
            if let Some(record) = store.get_mut(id) {
                record.resolved_deps = children;
            }
        }
        output.ready = ordered;
        output
    }

    fn post_order(
        &self,
        id: &ItemId,
        graph: &HashMap<ItemId, Vec<ItemId>>,
        ready: &HashSet<ItemId>,
        visited: &mut HashSet<ItemId>,
        out: &mut Vec<ItemId>,
    ) {
        if !visited.insert(id.clone()) {
            return;
        }
        if let Some(children) = graph.get(id) {
            for child in children {
                self.post_order(child, graph, ready, visited, out);
            }
        }
        if ready.contains(id) {
            out.push(id.clone());
        }
    }
}

/// FIFO pipeline of clusters; only the front cluster ever runs.
#[derive(Debug, Default)]
pub struct ClusterPipeline {
    clusters: VecDeque<RequestCluster>,
}

impl ClusterPipeline {
    /// Empty pipeline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a cluster.
    pub fn push(&mut self, cluster: RequestCluster) {
        self.clusters.push_back(cluster);
    }

    /// Number of queued clusters.
    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    /// Whether no clusters are queued.
    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Total items owned across all clusters.
    pub fn total_items(&self) -> usize {
        self.clusters.iter().map(RequestCluster::len).sum()
    }

    /// Process the front cluster under a budget. Returns its output
    /// when it completes; the cluster is then dropped.
    pub fn process_front(
        &mut self,
        store: &mut ItemStore,
        deps: &mut dyn DependencyProvider,
        oracles: &[ProfileOracle],
        config: &KilnConfig,
        budget: usize,
    ) -> Option<ClusterOutput> {
        let front = self.clusters.front_mut()?;
        match front.process(store, deps, oracles, config, budget) {
            ClusterStatus::Incomplete => None,
            ClusterStatus::Complete(output) => {
                self.clusters.pop_front();
                Some(output)
            }
        }
    }

    /// Drain every member of every cluster, for cancellation.
    pub fn drain_all(&mut self) -> Vec<ItemId> {
        let mut out = Vec::new();
        for mut cluster in self.clusters.drain(..) {
            out.append(&mut cluster.members);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::FsDependencyProvider;
    use crate::config::default_config;
    use crate::incremental::oracle::SessionValidity;
    use std::fs;
    use tempfile::TempDir;

    fn write_item(root: &std::path::Path, name: &str, body: &str) {
        let path = root.join(format!("{}.item", name));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, body).unwrap();
    }

    fn empty_oracles() -> Vec<ProfileOracle> {
        vec![ProfileOracle { validity: SessionValidity::Valid, classes: HashMap::new() }]
    }

    fn run_cluster(
        store: &mut ItemStore,
        deps: &mut FsDependencyProvider,
        oracles: &[ProfileOracle],
        roots: &[&str],
    ) -> ClusterOutput {
        let config = default_config();
        let mut cluster = RequestCluster::new(1);
        for root in roots {
            let id = ItemId::new(*root);
            store.ensure(&id, Instigator::command_line());
            store.move_to(&id, ItemState::Request(RequestPhase::InCluster));
            cluster.add_root(id, &[]);
        }
        loop {
            match cluster.process(store, deps, oracles, &config, 4) {
                ClusterStatus::Incomplete => {}
                ClusterStatus::Complete(output) => return output,
            }
        }
    }

    #[test]
    fn test_cluster_leaf_to_root_order() {
        let temp = TempDir::new().unwrap();
        write_item(temp.path(), "root", "object r mesh\nref mid\n");
        write_item(temp.path(), "mid", "object m mesh\nref leaf\n");
        write_item(temp.path(), "leaf", "object l mesh\n");

        let mut store = ItemStore::new(1);
        let mut deps = FsDependencyProvider::new(temp.path().to_path_buf());
        let output = run_cluster(&mut store, &mut deps, &empty_oracles(), &["root"]);

        let order: Vec<&str> = output.ready.iter().map(|i| i.as_str()).collect();
        assert_eq!(order, vec!["leaf", "mid", "root"]);
        assert!(output.demote.is_empty());
        store.verify_membership().unwrap();
    }

    #[test]
    fn test_cluster_adopts_dependencies() {
        let temp = TempDir::new().unwrap();
        write_item(temp.path(), "root", "ref dep\n");
        write_item(temp.path(), "dep", "object d mesh\n");

        let mut store = ItemStore::new(1);
        let mut deps = FsDependencyProvider::new(temp.path().to_path_buf());
        let output = run_cluster(&mut store, &mut deps, &empty_oracles(), &["root"]);

        assert_eq!(output.ready.len(), 2);
        let dep = store.get(&ItemId::new("dep")).unwrap();
        assert!(dep.platform(ProfileId::new(0)).reachable);
        assert_eq!(
            dep.instigator,
            Instigator::dependency(ItemId::new("root"))
        );
    }

    #[test]
    fn test_cluster_skips_missing_dependency() {
        let temp = TempDir::new().unwrap();
        write_item(temp.path(), "root", "object r mesh\nref ghost\n");

        let mut store = ItemStore::new(1);
        let mut deps = FsDependencyProvider::new(temp.path().to_path_buf());
        let output = run_cluster(&mut store, &mut deps, &empty_oracles(), &["root"]);

        // the missing dependency is skipped, root still cooks
        assert_eq!(output.ready, vec![ItemId::new("root")]);
        assert!(!store.contains(&ItemId::new("ghost")));
    }

    #[test]
    fn test_cluster_handles_cycles() {
        let temp = TempDir::new().unwrap();
        write_item(temp.path(), "a", "object a mesh\nref b\n");
        write_item(temp.path(), "b", "object b mesh\nref a\n");

        let mut store = ItemStore::new(1);
        let mut deps = FsDependencyProvider::new(temp.path().to_path_buf());
        let output = run_cluster(&mut store, &mut deps, &empty_oracles(), &["a"]);

        assert_eq!(output.ready.len(), 2);
    }

    #[test]
    fn test_cluster_demotes_identical_built() {
        let temp = TempDir::new().unwrap();
        write_item(temp.path(), "done", "object d mesh\n");

        let mut classes = HashMap::new();
        classes.insert(ItemId::new("done"), ChangeClass::IdenticalBuilt);
        let oracles = vec![ProfileOracle { validity: SessionValidity::Valid, classes }];

        let mut store = ItemStore::new(1);
        let mut deps = FsDependencyProvider::new(temp.path().to_path_buf());
        let output = run_cluster(&mut store, &mut deps, &oracles, &["done"]);

        assert!(output.ready.is_empty());
        assert_eq!(output.demote, vec![(ItemId::new("done"), DemoteReason::AlreadyCooked)]);

        let record = store.get(&ItemId::new("done")).unwrap();
        let sub = record.platform(ProfileId::new(0));
        assert!(sub.is_committed());
        assert!(sub.incrementally_unmodified);
        assert_eq!(sub.result, CookResult::Succeeded);
    }

    #[test]
    fn test_cluster_never_cook() {
        let temp = TempDir::new().unwrap();
        write_item(temp.path(), "editor/tool", "object t mesh\n");

        let mut config = default_config();
        config.never_cook.push("editor/".to_string());

        let mut store = ItemStore::new(1);
        let mut deps = FsDependencyProvider::new(temp.path().to_path_buf());
        let mut cluster = RequestCluster::new(1);
        let id = ItemId::new("editor/tool");
        store.ensure(&id, Instigator::command_line());
        store.move_to(&id, ItemState::Request(RequestPhase::InCluster));
        cluster.add_root(id.clone(), &[]);

        let output = loop {
            match cluster.process(&mut store, &mut deps, &empty_oracles(), &config, 8) {
                ClusterStatus::Incomplete => {}
                ClusterStatus::Complete(output) => break output,
            }
        };

        assert_eq!(output.demote, vec![(id.clone(), DemoteReason::NeverCook)]);
        let record = store.get(&id).unwrap();
        assert_eq!(
            record.platform(ProfileId::new(0)).result,
            CookResult::NeverCookPlaceholder
        );
        assert!(record.platform(ProfileId::new(0)).is_committed());
    }

    #[test]
    fn test_cluster_respects_budget() {
        let temp = TempDir::new().unwrap();
        write_item(temp.path(), "a", "ref b\n");
        write_item(temp.path(), "b", "ref c\n");
        write_item(temp.path(), "c", "object c mesh\n");

        let config = default_config();
        let mut store = ItemStore::new(1);
        let mut deps = FsDependencyProvider::new(temp.path().to_path_buf());
        let mut cluster = RequestCluster::new(1);
        let id = ItemId::new("a");
        store.ensure(&id, Instigator::command_line());
        store.move_to(&id, ItemState::Request(RequestPhase::InCluster));
        cluster.add_root(id, &[]);

        // budget of 1 exploration per call takes several calls
        let status = cluster.process(&mut store, &mut deps, &empty_oracles(), &config, 1);
        assert!(matches!(status, ClusterStatus::Incomplete));
    }

    #[test]
    fn test_pipeline_fifo() {
        let temp = TempDir::new().unwrap();
        write_item(temp.path(), "one", "object o mesh\n");
        write_item(temp.path(), "two", "object t mesh\n");

        let config = default_config();
        let oracles = empty_oracles();
        let mut store = ItemStore::new(1);
        let mut deps = FsDependencyProvider::new(temp.path().to_path_buf());
        let mut pipeline = ClusterPipeline::new();

        for name in ["one", "two"] {
            let mut cluster = RequestCluster::new(1);
            let id = ItemId::new(name);
            store.ensure(&id, Instigator::command_line());
            store.move_to(&id, ItemState::Request(RequestPhase::InCluster));
            cluster.add_root(id, &[]);
            pipeline.push(cluster);
        }

        assert_eq!(pipeline.total_items(), 2);
        let first = pipeline
            .process_front(&mut store, &mut deps, &oracles, &config, 16)
            .expect("first cluster completes");
        assert_eq!(first.ready, vec![ItemId::new("one")]);
        assert_eq!(pipeline.len(), 1);
    }
}
