//! The cook session: one build run from startup to report.
//!
//! A session owns the item store, the queue pumps, the collaborator set,
//! the per-profile incremental state, and (optionally) the distribution
//! director. The tick loop is the cooperative driver: drain external
//! requests, pick one action at a time under the tick budget, and run
//! pollable maintenance in the gaps.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::collab::Collaborators;
use crate::config::KilnConfig;
use crate::distrib::{select_retractions, Director, DirectorLink};
use crate::error::{CookError, DemoteReason};
use crate::incremental::{
    classify_items, current_dependency_hash, evaluate_session, InvalidReason, ItemResultRecord,
    ProfileOracle, RecordedResult, RegistryError, ResultRegistry, SessionValidity,
    SettingsSidecar,
};
use crate::item::generation::GenerationPool;
use crate::item::instigator::Instigator;
use crate::item::record::{
    CookResult, ItemId, ItemState, RequestPhase, Urgency, WorkerPin,
};
use crate::item::store::ItemStore;
use crate::load::{pump_loads, LoadOutputs};
use crate::pollable::{PollTaskKind, PollableRegistry};
use crate::profile::{ProfileId, ProfileManager, ProfileState, TargetProfile};
use crate::report::{CookStats, SessionReport};
use crate::request::{
    BuildRequest, ClusterOutput, ClusterPipeline, DiscoveryQueue, RequestCluster, RequestInbox,
    RequestSender,
};
use crate::save::queue::release_family_if_complete;
use crate::save::{pump_saves, AsyncCacheTable, CommittedItem, SaveOutputs};
use crate::scheduler::{choose_action, BusyTracker, QueueStatus, SchedulerAction};

/// How the session is being driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionMode {
    /// One-shot build: run until nothing is outstanding
    Batch,
    /// Long-lived: accept requests at any time, never declare done
    Serve,
    /// Driven by a distribution director; no incremental state of its own
    Worker,
}

/// Result of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// At least one action ran
    Progressed,
    /// Work is outstanding but nothing could run
    Waiting,
    /// Nothing outstanding at all
    Done,
}

/// One cook session.
pub struct CookSession {
    config: KilnConfig,
    mode: SessionMode,
    profiles: ProfileManager,
    targets: Vec<TargetProfile>,
    collab: Collaborators,
    store: ItemStore,
    gen_pool: GenerationPool,
    cache: AsyncCacheTable,
    pipeline: ClusterPipeline,
    inbox: RequestInbox,
    discoveries: DiscoveryQueue,
    pollables: PollableRegistry,
    oracles: Vec<ProfileOracle>,
    staged_profiles: HashMap<ItemId, Vec<ProfileId>>,
    busy_load: BusyTracker,
    busy_save: BusyTracker,
    stats: Vec<CookStats>,
    completions: Vec<(ItemId, bool)>,
    director: Option<Director>,
    started: Instant,
    canceled: bool,
}

impl CookSession {
    /// Open a session over the project at `root`.
    pub fn new(
        config: KilnConfig,
        root: PathBuf,
        collab: Collaborators,
        mode: SessionMode,
    ) -> Result<Self, CookError> {
        Self::with_options(config, root, collab, mode, false)
    }

    /// Open a session, optionally discarding all previous results.
    pub fn with_options(
        config: KilnConfig,
        root: PathBuf,
        mut collab: Collaborators,
        mode: SessionMode,
        force: bool,
    ) -> Result<Self, CookError> {
        let mut profiles = ProfileManager::from_config(&config, &root);
        if profiles.is_empty() {
            return Err(CookError::Session("no enabled profiles".to_string()));
        }
        let mut oracles = Vec::with_capacity(profiles.len());
        if mode == SessionMode::Worker {
            // workers cook exactly what they are told
            for _ in profiles.ids() {
                oracles.push(ProfileOracle::invalidated(InvalidReason::NoPreviousBuild));
            }
        } else {
            for (_, state) in profiles.iter_mut() {
                oracles.push(open_profile(state, &mut collab, force)?);
            }
        }

        let profile_count = profiles.len();
        let targets: Vec<TargetProfile> =
            profiles.iter().map(|(_, state)| state.profile.clone()).collect();

        let now = Instant::now();
        let sched = &config.scheduler;
        let mut pollables = PollableRegistry::new();
        let idle = Some(Duration::from_millis(sched.idle_period_ms.max(1)));
        pollables.register_periodic(
            PollTaskKind::Gc,
            Duration::from_millis(sched.gc_period_ms.max(1)),
            idle,
            now,
        );
        pollables.register_periodic(
            PollTaskKind::Diagnostics,
            Duration::from_millis(sched.diagnostics_period_ms.max(1)),
            None,
            now,
        );
        pollables.register_periodic(
            PollTaskKind::ServiceReadiness,
            Duration::from_millis(sched.busy_retry_ms.max(1)),
            idle,
            now,
        );

        Ok(Self {
            config,
            mode,
            profiles,
            targets,
            collab,
            store: ItemStore::new(profile_count),
            gen_pool: GenerationPool::new(),
            cache: AsyncCacheTable::new(),
            pipeline: ClusterPipeline::new(),
            inbox: RequestInbox::new(),
            discoveries: DiscoveryQueue::new(),
            pollables,
            oracles,
            staged_profiles: HashMap::new(),
            busy_load: BusyTracker::new("load"),
            busy_save: BusyTracker::new("save"),
            stats: vec![CookStats::default(); profile_count],
            completions: Vec::new(),
            director: None,
            started: now,
            canceled: false,
        })
    }

    /// Attach the distribution director. Cluster-resolved batches are
    /// assigned to workers instead of entering the local load queue.
    pub fn attach_director(&mut self, link: Box<dyn DirectorLink>) {
        let now = Instant::now();
        self.pollables.register_periodic(
            PollTaskKind::DirectorPump,
            Duration::from_millis(self.config.scheduler.busy_retry_ms.max(1)),
            Some(Duration::from_millis(self.config.scheduler.idle_period_ms.max(1))),
            now,
        );
        self.director = Some(Director::new(link, self.config.distribution.clone()));
    }

    /// The session configuration.
    pub fn config(&self) -> &KilnConfig {
        &self.config
    }

    /// Read access to the item store, for diagnostics and tests.
    pub fn store(&self) -> &ItemStore {
        &self.store
    }

    /// Find a profile id by name.
    pub fn find_profile(&self, name: &str) -> Option<ProfileId> {
        self.profiles.find(name)
    }

    /// A sender handle for submitting requests from other threads.
    pub fn sender(&self) -> RequestSender {
        self.inbox.sender()
    }

    /// Submit a request from the session's own thread.
    pub fn submit(&mut self, request: BuildRequest) {
        self.inbox.push(request);
    }

    /// Items anywhere other than Idle.
    pub fn outstanding_items(&self) -> usize {
        self.store.len() - self.store.queues().idle.len()
    }

    /// Whether any work remains queued or in flight.
    pub fn has_outstanding(&self) -> bool {
        self.outstanding_items() > 0
            || !self.inbox.is_empty()
            || !self.discoveries.is_empty()
            || !self.pipeline.is_empty()
    }

    /// Items that finished since the last drain, with success flag.
    /// Consumed by the worker runtime; batch mode clears this itself.
    pub fn drain_completions(&mut self) -> Vec<(ItemId, bool)> {
        std::mem::take(&mut self.completions)
    }

    /// Run one scheduler tick.
    pub fn tick(&mut self) -> TickOutcome {
        let tick_start = Instant::now();
        let budget = Duration::from_millis(self.config.scheduler.tick_budget_ms.max(1));
        if self.mode != SessionMode::Worker {
            self.completions.clear();
        }
        self.drain_requests();

        let mut did_anything = false;
        loop {
            let now = Instant::now();
            if now.duration_since(tick_start) >= budget {
                return if did_anything { TickOutcome::Progressed } else { TickOutcome::Waiting };
            }
            let status = self.status(now);
            let action = choose_action(
                &status,
                self.busy_load.available(now),
                self.busy_save.available(now),
                &self.config.scheduler,
            );
            match action {
                SchedulerAction::Done => {
                    return if did_anything { TickOutcome::Progressed } else { TickOutcome::Done };
                }
                SchedulerAction::YieldTick => {
                    return if did_anything {
                        TickOutcome::Progressed
                    } else {
                        TickOutcome::Waiting
                    };
                }
                SchedulerAction::WaitForAsync => {
                    if status.inbox_waiting {
                        // new requests landed mid-tick; fold them in now
                        self.drain_requests();
                        did_anything = true;
                        continue;
                    }
                    self.service_readiness();
                    self.sleep_until_next(Instant::now());
                    return if did_anything {
                        TickOutcome::Progressed
                    } else {
                        TickOutcome::Waiting
                    };
                }
                SchedulerAction::KickBuildDependencies => self.form_cluster(),
                SchedulerAction::Request => self.pump_cluster(),
                SchedulerAction::Save => {
                    let batch = self.config.scheduler.load_batch_size.max(1);
                    self.run_save(batch);
                }
                SchedulerAction::SaveLimited => {
                    let excess = status
                        .save_total()
                        .saturating_sub(self.config.scheduler.desired_save_queue_length)
                        .max(1);
                    self.run_save(excess);
                }
                SchedulerAction::Load => {
                    self.run_load(self.config.scheduler.desired_load_queue_length);
                }
                SchedulerAction::LoadLimited => self.run_load(0),
                SchedulerAction::Poll => self.run_pollables(false),
                SchedulerAction::PollIdle => self.run_pollables(true),
            }
            did_anything = true;
        }
    }

    /// Batch mode: tick until nothing is outstanding or `cancel` fires.
    pub fn run_to_completion(&mut self, cancel: &dyn Fn() -> bool) {
        loop {
            if cancel() {
                self.cancel();
                return;
            }
            if self.tick() == TickOutcome::Done {
                return;
            }
        }
    }

    /// Serve mode: keep the session open until `cancel` fires. New
    /// requests reactivate the loop at any time.
    pub fn run_serve(&mut self, cancel: &dyn Fn() -> bool) {
        loop {
            if cancel() {
                self.cancel();
                return;
            }
            if self.tick() == TickOutcome::Done {
                std::thread::sleep(Duration::from_millis(
                    self.config.scheduler.idle_period_ms.max(1),
                ));
            }
        }
    }

    /// Unwind every queue back to Idle in a single pass.
    pub fn cancel(&mut self) {
        info!("cancel requested; unwinding in-flight work");
        if let Some(director) = self.director.as_mut() {
            director.shutdown();
        }
        self.inbox.drain();
        self.discoveries.drain();
        self.staged_profiles.clear();
        self.pipeline.drain_all();
        for id in self.store.active_items() {
            self.demote_item(&id, DemoteReason::CookCanceled);
        }
        self.cache = AsyncCacheTable::new();
        self.gen_pool.force_uninitialize_all();
        self.canceled = true;
    }

    /// Worker side of the retraction protocol: remove the selected items
    /// from the local queues without recording any result.
    pub fn retract(&mut self, max: usize) -> Vec<ItemId> {
        let picked = select_retractions(&self.store, &self.gen_pool, max);
        for id in &picked {
            self.staged_profiles.remove(id);
            let keys = self
                .store
                .get_mut(id)
                .and_then(|r| r.object_cache.as_mut().map(|c| std::mem::take(&mut c.acquired)))
                .unwrap_or_default();
            self.cache.release(&keys);
            self.store.move_to(id, ItemState::Idle);
            if let Some(record) = self.store.get_mut(id) {
                record.clear_in_flight();
                record.object_cache = None;
            }
        }
        picked
    }

    /// Close the session: settle workers, persist per-profile state, and
    /// produce the report.
    pub fn finish(mut self) -> Result<SessionReport, CookError> {
        if self.director.is_some() && !self.canceled {
            self.settle_workers();
        }
        let duration = self.started.elapsed();
        let dangling = self.gen_pool.force_uninitialize_all();
        if dangling > 0 {
            debug!(dangling, "generation helpers still referenced at teardown");
        }

        let mut report =
            SessionReport { profiles: BTreeMap::new(), duration, canceled: self.canceled };
        for (id, state) in self.profiles.iter_mut() {
            let mut stats = self.stats[id.index()].clone();
            stats.total_duration_ms = duration.as_millis() as u64;
            if self.mode != SessionMode::Worker {
                state.registry.stats = Some(stats.clone());
                state.registry.save_to_dir(&state.profile.out_dir)?;
                state.sidecar.build_in_progress = false;
                state.sidecar.save_to_dir(&state.profile.out_dir)?;
            }
            report.profiles.insert(state.profile.name.clone(), stats);
        }
        Ok(report)
    }

    // ---- tick internals ----

    fn status(&self, now: Instant) -> QueueStatus {
        let queues = self.store.queues();
        let mut save_by_urgency = [0usize; Urgency::COUNT];
        let mut load_ready_by_urgency = [0usize; Urgency::COUNT];
        for urgency in Urgency::descending() {
            save_by_urgency[urgency.index()] = queues.save.len_at(urgency);
            load_ready_by_urgency[urgency.index()] = queues.load_ready.len_at(urgency);
        }
        QueueStatus {
            staged: queues.request_staged.len(),
            cluster_active: !self.pipeline.is_empty(),
            cluster_urgency: queues
                .in_cluster
                .iter()
                .filter_map(|id| self.store.get(id).map(|r| r.urgency))
                .max(),
            request_ready: queues.request_ready.len(),
            load_total: queues.load_total(),
            load_ready_by_urgency,
            save_by_urgency,
            assigned: queues.assigned.len(),
            active_preloads: queues.load_active_preload.len(),
            pending_async: self.cache.pending_count(),
            inbox_waiting: !self.inbox.is_empty() || !self.discoveries.is_empty(),
            pollable_due: self.pollables.any_due(now),
            pollable_idle_due: self.pollables.any_idle_due(now),
        }
    }

    fn drain_requests(&mut self) {
        for request in self.inbox.drain() {
            self.admit(request.id, request.profiles, request.urgency, request.instigator, request.pin);
        }
        for event in self.discoveries.drain() {
            self.admit(event.id, event.profiles, event.urgency, event.instigator, WorkerPin::None);
        }
    }

    fn admit(
        &mut self,
        id: ItemId,
        profiles: Vec<ProfileId>,
        urgency: Urgency,
        instigator: Instigator,
        pin: WorkerPin,
    ) {
        let wanted: Vec<ProfileId> = if profiles.is_empty() {
            (0..self.store.profile_count()).map(ProfileId::new).collect()
        } else {
            profiles
        };
        let record = self.store.ensure(&id, instigator);
        match record.state() {
            ItemState::Idle => {
                if record.committed_for_all(&wanted) {
                    // already done for everything requested; no queue entry
                    record.last_demote = Some(DemoteReason::AlreadyCooked);
                    return;
                }
                if record.pin == WorkerPin::None {
                    record.pin = pin;
                }
                self.store.move_to(&id, ItemState::Request(RequestPhase::Staged));
                self.store.raise_urgency(&id, urgency);
                let entry = self.staged_profiles.entry(id).or_default();
                for profile in wanted {
                    if !entry.contains(&profile) {
                        entry.push(profile);
                    }
                }
            }
            _ => {
                // duplicate request: at most an urgency promotion
                self.store.raise_urgency(&id, urgency);
                if let Some(entry) = self.staged_profiles.get_mut(&id) {
                    for profile in wanted {
                        if !entry.contains(&profile) {
                            entry.push(profile);
                        }
                    }
                }
            }
        }
    }

    fn form_cluster(&mut self) {
        let mut cluster = RequestCluster::new(self.store.profile_count());
        let batch = self.config.scheduler.cluster_batch_size.max(1);
        for _ in 0..batch {
            let id = match self.store.queues().request_staged.front().cloned() {
                Some(id) => id,
                None => break,
            };
            self.store.move_to(&id, ItemState::Request(RequestPhase::InCluster));
            let profiles = self.staged_profiles.remove(&id).unwrap_or_default();
            cluster.add_root(id, &profiles);
        }
        if !cluster.is_empty() {
            debug!(items = cluster.len(), "formed request cluster");
            self.pipeline.push(cluster);
        }
    }

    fn pump_cluster(&mut self) {
        let budget = self.config.scheduler.cluster_batch_size.max(16);
        let output = self.pipeline.process_front(
            &mut self.store,
            self.collab.deps.as_mut(),
            &self.oracles,
            &self.config,
            budget,
        );
        if let Some(output) = output {
            self.apply_cluster_output(output);
        }
    }

    fn apply_cluster_output(&mut self, output: ClusterOutput) {
        for (id, reason) in output.demote {
            self.demote_item(&id, reason);
        }
        match self.director.as_mut() {
            Some(director) => {
                let outcome =
                    director.assign(&mut self.store, &self.gen_pool, &output.ready, &output.graph);
                for id in outcome.local {
                    self.store.move_to(&id, ItemState::Request(RequestPhase::Ready));
                }
                for id in outcome.invalid {
                    self.demote_item(&id, DemoteReason::MultiprocessAssignmentError);
                }
                if outcome.sent > 0 {
                    self.pollables.trigger(PollTaskKind::DirectorPump);
                }
            }
            None => {
                for id in output.ready {
                    self.store.move_to(&id, ItemState::Request(RequestPhase::Ready));
                }
            }
        }
    }

    fn run_load(&mut self, desired: usize) {
        let mut outputs = LoadOutputs::default();
        let outcome = pump_loads(
            &mut self.store,
            self.collab.loader.as_mut(),
            &mut self.gen_pool,
            &self.config.scheduler,
            desired,
            &mut outputs,
        );
        self.busy_load.note(outcome.busy, Instant::now(), &self.config.scheduler);
        for event in outputs.discoveries {
            self.discoveries.push(event);
        }
        for request in outputs.new_requests {
            self.inbox.push(request);
        }
        for (id, reason) in outputs.demoted {
            self.note_demoted(&id, reason);
        }
    }

    fn run_save(&mut self, max_items: usize) {
        let mut outputs = SaveOutputs::default();
        let outcome = pump_saves(
            &mut self.store,
            self.collab.writer.as_mut(),
            &mut self.collab.splitters,
            self.collab.readiness.as_mut(),
            &mut self.cache,
            &mut self.gen_pool,
            &self.targets,
            &self.config,
            max_items,
            &mut outputs,
        );
        self.busy_save.note(outcome.busy, Instant::now(), &self.config.scheduler);
        let SaveOutputs { committed, finished, new_requests, demoted } = outputs;
        for request in new_requests {
            self.inbox.push(request);
        }
        for (id, reason) in demoted {
            self.note_demoted(&id, reason);
        }
        for item in committed {
            self.record_commit(item);
        }
        for id in finished {
            self.completions.push((id, true));
        }
    }

    fn run_pollables(&mut self, is_idle: bool) {
        let due = self.pollables.begin_pass(Instant::now(), is_idle, 4);
        for kind in &due {
            match kind {
                PollTaskKind::Gc => self.soft_gc(),
                PollTaskKind::Diagnostics => self.log_diagnostics(),
                PollTaskKind::ServiceReadiness => {
                    self.service_readiness();
                }
                PollTaskKind::DirectorPump => self.pump_director(),
                PollTaskKind::WorkerHeartbeat => {}
            }
        }
        self.pollables.end_pass(Instant::now());
    }

    /// Reconcile async-readiness completions into the cache table. Runs
    /// on the scheduler thread only.
    fn service_readiness(&mut self) -> usize {
        let completed = self.cache.service(&self.targets, self.collab.readiness.as_mut());
        if completed > 0 {
            self.busy_save.clear();
        }
        completed
    }

    fn pump_director(&mut self) {
        let events = match self.director.as_mut() {
            Some(director) => director.pump(Instant::now()),
            None => return,
        };
        for (id, success) in events.done {
            self.finish_remote(&id, success);
        }
        for id in events.returned {
            self.restage_returned(&id);
        }
        if let Some(director) = self.director.as_mut() {
            director.rebalance();
        }
    }

    fn finish_remote(&mut self, id: &ItemId, success: bool) {
        let needing = match self.store.get_mut(id) {
            Some(record) if record.state() == ItemState::AssignedToWorker => {
                let needing = record.profiles_needing_commit();
                for profile in &needing {
                    let sub = record.platform_mut(*profile);
                    sub.set_result(if success { CookResult::Succeeded } else { CookResult::Failed });
                    sub.mark_committed();
                }
                needing
            }
            _ => return,
        };
        self.store.move_to(id, ItemState::Idle);
        if let Some(record) = self.store.get_mut(id) {
            record.clear_in_flight();
        }
        for profile in needing {
            if success {
                // the worker committed the artifact; record the result so
                // the next session can reuse it
                self.record_commit(CommittedItem {
                    id: id.clone(),
                    profile,
                    artifact: Default::default(),
                    generated: Vec::new(),
                });
            } else {
                let stats = &mut self.stats[profile.index()];
                stats.attempted += 1;
                stats.failed += 1;
            }
        }
        self.completions.push((id.clone(), success));
    }

    fn restage_returned(&mut self, id: &ItemId) {
        let profiles = match self.store.get_mut(id) {
            Some(record) if record.state() == ItemState::AssignedToWorker => {
                record.assigned_worker = None;
                record.profiles_needing_commit()
            }
            _ => return,
        };
        self.store.move_to(id, ItemState::Request(RequestPhase::Staged));
        self.staged_profiles.insert(id.clone(), profiles);
    }

    fn soft_gc(&mut self) {
        let cap = self.config.scheduler.max_resident_object_caches;
        let resident: Vec<ItemId> = self
            .store
            .iter()
            .filter(|record| record.object_cache.is_some())
            .map(|record| record.id.clone())
            .collect();
        if resident.len() <= cap {
            return;
        }
        let mut excess = resident.len() - cap;
        for id in &resident {
            if excess == 0 {
                return;
            }
            if self.store.get(id).map(|r| r.state()) == Some(ItemState::Idle) {
                if let Some(record) = self.store.get_mut(id) {
                    record.object_cache = None;
                }
                excess -= 1;
            }
        }
        // still over the cap: items mid-save drop their async progress
        // and recompute it on the next pass
        for id in &resident {
            if excess == 0 {
                break;
            }
            if self.store.get(id).map(|r| r.state()) != Some(ItemState::Save) {
                continue;
            }
            let keys = self
                .store
                .get_mut(id)
                .and_then(|r| r.object_cache.as_mut().map(|c| std::mem::take(&mut c.acquired)))
                .unwrap_or_default();
            self.cache.release(&keys);
            if let Some(record) = self.store.get_mut(id) {
                if let Some(cache) = record.object_cache.as_mut() {
                    cache.begun_count = 0;
                }
            }
            self.store.reset_save_progress(id);
            excess -= 1;
        }
        debug!("memory pressure: evicted object caches");
    }

    fn log_diagnostics(&self) {
        let queues = self.store.queues();
        debug!(
            staged = queues.request_staged.len(),
            clustered = queues.in_cluster.len(),
            ready = queues.request_ready.len(),
            load = queues.load_total(),
            save = queues.save.len(),
            assigned = queues.assigned.len(),
            pending_async = self.cache.pending_count(),
            "queue status"
        );
    }

    fn sleep_until_next(&self, now: Instant) {
        let sched = &self.config.scheduler;
        let retry = Duration::from_millis(sched.busy_retry_ms.max(1));
        let mut wake = now + Duration::from_millis(sched.max_sleep_ms.max(1));
        if let Some(deadline) = self.pollables.next_deadline() {
            wake = wake.min(deadline);
        }
        if let Some(deadline) = self.busy_load.retry_deadline() {
            wake = wake.min(deadline);
        }
        if let Some(deadline) = self.busy_save.retry_deadline() {
            wake = wake.min(deadline);
        }
        if self.cache.pending_count() > 0
            || !self.store.queues().load_active_preload.is_empty()
        {
            wake = wake.min(now + retry);
        }
        if wake > now {
            std::thread::sleep(wake - now);
        }
    }

    fn settle_workers(&mut self) {
        let retry = Duration::from_millis(self.config.scheduler.busy_retry_ms.max(1));
        if let Some(director) = self.director.as_mut() {
            director.begin_fence(Instant::now());
        }
        loop {
            self.pump_director();
            let complete = match self.director.as_mut() {
                Some(director) => director.fence_complete(Instant::now()),
                None => true,
            };
            if complete {
                break;
            }
            std::thread::sleep(retry);
        }
        if let Some(director) = self.director.as_mut() {
            director.shutdown();
        }
    }

    // ---- bookkeeping ----

    /// Demote an item the session still holds (cluster, cancel, or
    /// assignment failure paths), releasing any prepare-save state.
    fn demote_item(&mut self, id: &ItemId, reason: DemoteReason) {
        let keys = self
            .store
            .get_mut(id)
            .and_then(|r| r.object_cache.as_mut().map(|c| std::mem::take(&mut c.acquired)))
            .unwrap_or_default();
        self.cache.release(&keys);
        let generator = self.store.get_mut(id).and_then(|record| {
            record.object_cache = None;
            record.generation.take().map(|helper| {
                let mut helper = helper.borrow_mut();
                helper.mark_finished(id);
                helper.generator.clone()
            })
        });
        self.store.demote(id, reason.clone());
        release_family_if_complete(&mut self.gen_pool, generator);
        self.note_demoted(id, reason);
    }

    /// Update statistics and registries for an item some pump already
    /// demoted.
    fn note_demoted(&mut self, id: &ItemId, reason: DemoteReason) {
        let reachable: Vec<(usize, bool)> = match self.store.get(id) {
            Some(record) => record
                .platforms
                .iter()
                .enumerate()
                .filter(|(_, sub)| sub.reachable)
                .map(|(index, sub)| (index, sub.incrementally_unmodified))
                .collect(),
            None => return,
        };
        for (index, unmodified) in &reachable {
            let stats = &mut self.stats[*index];
            match &reason {
                DemoteReason::LoadError(_)
                | DemoteReason::ValidationError(_)
                | DemoteReason::SaveError(_)
                | DemoteReason::OrphanedGenerated
                | DemoteReason::MultiprocessAssignmentError => {
                    stats.attempted += 1;
                    stats.failed += 1;
                }
                DemoteReason::AlreadyCooked => {
                    if *unmodified {
                        stats.skipped_identical += 1;
                    }
                }
                DemoteReason::NeverCook | DemoteReason::Redirected(_) => {
                    stats.placeholders += 1;
                }
                DemoteReason::CookCanceled => stats.canceled += 1,
                DemoteReason::NotReachable => {}
            }
        }
        match &reason {
            DemoteReason::NeverCook | DemoteReason::Redirected(_) => {
                self.record_uncooked(id, &reachable, RecordedResult::NeverCook);
            }
            DemoteReason::NotReachable => {
                self.record_uncooked(id, &reachable, RecordedResult::Uncooked);
            }
            _ => {}
        }
        self.completions.push((id.clone(), !reason.is_failure()));
    }

    /// Registry entry for an item that was examined but legitimately not
    /// cooked, so the next session can classify it without re-examining.
    fn record_uncooked(&mut self, id: &ItemId, reachable: &[(usize, bool)], kind: RecordedResult) {
        if self.mode == SessionMode::Worker {
            return;
        }
        let content_hash = self.collab.hasher.content_hash(id).unwrap_or_default();
        let dependency_hash =
            current_dependency_hash(id, self.collab.deps.as_mut(), self.collab.hasher.as_ref());
        for (index, _) in reachable {
            let record = ItemResultRecord {
                content_hash: content_hash.clone(),
                dependency_hash: dependency_hash.clone(),
                result: kind,
                artifacts: Vec::new(),
                artifact_checksums: BTreeMap::new(),
                generated: Vec::new(),
            };
            self.profiles.state_mut(ProfileId::new(*index)).registry.record(id, record);
        }
    }

    fn record_commit(&mut self, item: CommittedItem) {
        let content_hash = self.collab.hasher.content_hash(&item.id).unwrap_or_default();
        let dependency_hash = current_dependency_hash(
            &item.id,
            self.collab.deps.as_mut(),
            self.collab.hasher.as_ref(),
        );
        let record = ItemResultRecord {
            content_hash,
            dependency_hash,
            result: RecordedResult::Built,
            artifacts: item.artifact.artifacts,
            artifact_checksums: item.artifact.checksums,
            generated: item.generated.iter().map(|g| g.as_str().to_string()).collect(),
        };
        self.profiles.state_mut(item.profile).registry.record(&item.id, record);
        let stats = &mut self.stats[item.profile.index()];
        stats.attempted += 1;
        stats.succeeded += 1;
    }
}

impl std::fmt::Debug for CookSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CookSession")
            .field("mode", &self.mode)
            .field("items", &self.store.len())
            .field("outstanding", &self.outstanding_items())
            .finish_non_exhaustive()
    }
}

/// Load a profile's previous state and decide how much of it survives.
fn open_profile(
    state: &mut ProfileState,
    collab: &mut Collaborators,
    force: bool,
) -> Result<ProfileOracle, CookError> {
    let out_dir = state.profile.out_dir.clone();
    let mut version_mismatch = false;
    let registry = if force {
        None
    } else {
        match ResultRegistry::load_from_dir(&out_dir) {
            Ok(found) => found,
            Err(RegistryError::VersionMismatch { .. }) => {
                version_mismatch = true;
                None
            }
            Err(err) => return Err(err.into()),
        }
    };
    let sidecar = if force { None } else { SettingsSidecar::load_from_dir(&out_dir)? };

    let mut validity = evaluate_session(sidecar.as_ref(), &state.fingerprint, registry.is_some());
    if version_mismatch {
        validity = SessionValidity::Invalidated(InvalidReason::RegistryVersionMismatch);
    }

    let oracle = match validity {
        SessionValidity::Valid => {
            let registry = registry.unwrap_or_default();
            let classes =
                classify_items(&registry, &out_dir, collab.hasher.as_ref(), collab.deps.as_mut());
            state.registry = registry;
            let oracle = ProfileOracle { validity: SessionValidity::Valid, classes };
            // sources that vanished take their stale artifacts with them
            for id in oracle.removed_items() {
                debug!(profile = %state.profile.name, item = %id, "source removed, deleting artifacts");
                if let Err(err) = collab.writer.remove_artifacts(&state.profile, &id) {
                    warn!(item = %id, error = %err, "could not remove stale artifact");
                }
                state.registry.remove(&id);
            }
            oracle
        }
        SessionValidity::Invalidated(reason) => {
            warn!(
                profile = %state.profile.name,
                reason = %reason,
                "previous build invalidated, forcing full rebuild"
            );
            if let Some(previous) = registry {
                for (id, record) in &previous.items {
                    if record.result == RecordedResult::Built {
                        if let Err(err) = collab.writer.remove_artifacts(&state.profile, id) {
                            warn!(item = %id, error = %err, "could not remove stale artifact");
                        }
                    }
                }
            }
            state.registry = ResultRegistry::new();
            ProfileOracle::invalidated(reason)
        }
    };

    // raise the in-progress flag; it stays up until a clean finish, so a
    // crash here forces a full rebuild next time
    state.sidecar = sidecar.unwrap_or_default();
    state.sidecar.fingerprint = state.fingerprint.digest();
    state.sidecar.entries = state.fingerprint.entries.clone();
    state.sidecar.build_in_progress = true;
    state.sidecar.save_to_dir(&out_dir)?;

    Ok(oracle)
}
