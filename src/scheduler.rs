//! Scheduler: action selection and busy tracking for the main loop.
//!
//! The loop is a single cooperative thread. Each pass it snapshots queue
//! occupancy, picks one action by the priority rule, executes it under a
//! bounded slice, and re-chooses. Urgent tiers preempt the normal
//! save/load interleave; at the topmost tier the Save/Load order is a
//! policy knob rather than a contract. A queue that reports busy with no
//! progress is left alone until its retry timer elapses, with an
//! escalating diagnostic if the block persists.

use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::SchedulerConfig;
use crate::item::record::Urgency;

/// What the loop decided to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Batch staged requests into a new cluster
    KickBuildDependencies,
    /// Advance the front request cluster
    Request,
    /// Pump the save queue
    Save,
    /// Drain the save queue down to the desired depth only
    SaveLimited,
    /// Top the load pipeline up and pump it
    Load,
    /// Pump the load pipeline without topping it up
    LoadLimited,
    /// Run due pollables
    Poll,
    /// Run idle-due pollables
    PollIdle,
    /// Nothing actionable; wait for async work to land
    WaitForAsync,
    /// Realtime mode: hand the tick back to the caller
    YieldTick,
    /// Nothing outstanding at all
    Done,
}

/// Snapshot of queue occupancy feeding one action decision.
#[derive(Debug, Default, Clone)]
pub struct QueueStatus {
    /// Requests staged but not yet clustered
    pub staged: usize,
    /// A cluster is in flight
    pub cluster_active: bool,
    /// Highest urgency among clustered items
    pub cluster_urgency: Option<Urgency>,
    /// Cluster-complete items waiting for load or assignment
    pub request_ready: usize,
    /// Items anywhere in the load pipeline
    pub load_total: usize,
    /// Load-ready items per urgency tier
    pub load_ready_by_urgency: [usize; Urgency::COUNT],
    /// Save items per urgency tier
    pub save_by_urgency: [usize; Urgency::COUNT],
    /// Items held by remote workers
    pub assigned: usize,
    /// Preloads in flight
    pub active_preloads: usize,
    /// Async-cache entries still waiting on the external system
    pub pending_async: usize,
    /// Requests or discoveries waiting to be drained
    pub inbox_waiting: bool,
    /// A pollable is due
    pub pollable_due: bool,
    /// A pollable is idle-due
    pub pollable_idle_due: bool,
}

impl QueueStatus {
    /// Save items across all tiers.
    pub fn save_total(&self) -> usize {
        self.save_by_urgency.iter().sum()
    }

    fn save_at(&self, urgency: Urgency) -> usize {
        self.save_by_urgency[urgency.index()]
    }

    fn load_ready_at(&self, urgency: Urgency) -> usize {
        self.load_ready_by_urgency[urgency.index()]
    }

    /// Whether anything at all is still pending.
    pub fn outstanding(&self) -> bool {
        self.staged > 0
            || self.cluster_active
            || self.request_ready > 0
            || self.load_total > 0
            || self.save_total() > 0
            || self.assigned > 0
            || self.active_preloads > 0
            || self.pending_async > 0
            || self.inbox_waiting
    }
}

/// Pick the next action. `load_ok`/`save_ok` are false while the
/// corresponding queue sits behind its busy-retry timer.
pub fn choose_action(
    status: &QueueStatus,
    load_ok: bool,
    save_ok: bool,
    config: &SchedulerConfig,
) -> SchedulerAction {
    // New requests become a cluster before anything else so downstream
    // queues see them this tick. Clusters run one at a time.
    if status.staged > 0 && !status.cluster_active {
        return SchedulerAction::KickBuildDependencies;
    }

    // Blocking tier: once urgent work reaches Save/Load it outranks the
    // request pipeline. Which of the two goes first is policy.
    let save_blocking = save_ok && status.save_at(Urgency::Blocking) > 0;
    let load_blocking = load_ok && status.load_ready_at(Urgency::Blocking) > 0;
    if save_blocking || load_blocking {
        return if save_blocking && (config.urgent_save_first || !load_blocking) {
            SchedulerAction::Save
        } else {
            SchedulerAction::Load
        };
    }
    if status.cluster_active && status.cluster_urgency >= Some(Urgency::Blocking) {
        return SchedulerAction::Request;
    }

    // High tier: Request, then Save, then Load.
    if status.cluster_active && status.cluster_urgency >= Some(Urgency::High) {
        return SchedulerAction::Request;
    }
    if save_ok && status.save_at(Urgency::High) > 0 {
        return SchedulerAction::Save;
    }
    if load_ok && status.load_ready_at(Urgency::High) > 0 {
        return SchedulerAction::Load;
    }

    // Normal tier: the cluster gates everything downstream, then save
    // and load interleave around the desired queue depths.
    if status.cluster_active {
        return SchedulerAction::Request;
    }
    if save_ok && status.save_total() > config.desired_save_queue_length {
        return SchedulerAction::SaveLimited;
    }
    if load_ok {
        if status.load_total > config.desired_load_queue_length {
            return SchedulerAction::LoadLimited;
        }
        if status.load_total > 0 || status.request_ready > 0 {
            return SchedulerAction::Load;
        }
    }
    if save_ok && status.save_total() > 0 {
        return SchedulerAction::Save;
    }
    if status.pollable_due {
        return SchedulerAction::Poll;
    }
    if status.outstanding() {
        return if config.realtime {
            SchedulerAction::YieldTick
        } else {
            SchedulerAction::WaitForAsync
        };
    }
    if status.pollable_idle_due {
        return SchedulerAction::PollIdle;
    }
    SchedulerAction::Done
}

/// Sticky busy state for one queue.
#[derive(Debug)]
pub struct BusyTracker {
    queue: &'static str,
    busy_since: Option<Instant>,
    retry_at: Option<Instant>,
    last_warning: Option<Instant>,
}

impl BusyTracker {
    /// Fresh tracker for the named queue.
    pub fn new(queue: &'static str) -> Self {
        Self { queue, busy_since: None, retry_at: None, last_warning: None }
    }

    /// Record a pump outcome. Progress clears the state; busy with no
    /// progress arms the retry timer and escalates a diagnostic once the
    /// block outlives the warning threshold.
    pub fn note(&mut self, busy: bool, now: Instant, config: &SchedulerConfig) {
        if !busy {
            self.clear();
            return;
        }
        let since = *self.busy_since.get_or_insert(now);
        self.retry_at = Some(now + Duration::from_millis(config.busy_retry_ms.max(1)));
        let threshold = Duration::from_secs(config.blocked_warning_secs.max(1));
        let blocked = now.duration_since(since);
        if blocked >= threshold
            && self
                .last_warning
                .map_or(true, |last| now.duration_since(last) >= threshold)
        {
            warn!(
                queue = self.queue,
                blocked_secs = blocked.as_secs(),
                "queue busy without progress"
            );
            self.last_warning = Some(now);
        }
    }

    /// Forget the busy state (e.g. after an async completion landed).
    pub fn clear(&mut self) {
        self.busy_since = None;
        self.retry_at = None;
        self.last_warning = None;
    }

    /// Whether the queue may be scheduled at `now`.
    pub fn available(&self, now: Instant) -> bool {
        self.retry_at.map_or(true, |at| now >= at)
    }

    /// Pending retry deadline, for batch-mode sleeping.
    pub fn retry_deadline(&self) -> Option<Instant> {
        self.retry_at
    }
}
