//! Pollable registry: periodic, idle, and manually triggered
//! background tasks.
//!
//! Time-ordered tasks live in a binary min-heap keyed by next-due time.
//! Idle-due times are kept as a plain per-task field and found by linear
//! scan, because idle passes are rare and the scan is cheap. Manual
//! tasks have no period at all and only run when signaled.
//!
//! A pass has two phases so that task execution never holds a borrow of
//! the registry: `begin_pass` pops what is due, the caller executes,
//! `end_pass` re-arms. A trigger raised while a pass is open is deferred
//! and applied at `end_pass`, which keeps reentrant signaling from
//! mutating the heap mid-pass.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// Identity of a registered background task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PollTaskKind {
    /// Soft garbage collection of resident object caches
    Gc,
    /// Periodic queue-length diagnostics
    Diagnostics,
    /// Reconcile async-readiness completions into item state
    ServiceReadiness,
    /// Drain director/worker transport messages
    DirectorPump,
    /// Worker heartbeat send
    WorkerHeartbeat,
}

impl std::fmt::Display for PollTaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PollTaskKind::Gc => write!(f, "gc"),
            PollTaskKind::Diagnostics => write!(f, "diagnostics"),
            PollTaskKind::ServiceReadiness => write!(f, "service-readiness"),
            PollTaskKind::DirectorPump => write!(f, "director-pump"),
            PollTaskKind::WorkerHeartbeat => write!(f, "worker-heartbeat"),
        }
    }
}

#[derive(Debug)]
struct PollableTask {
    kind: PollTaskKind,
    /// Periodic tasks re-arm at `now + period`; manual tasks have none
    period: Option<Duration>,
    /// Idle-due period; idle passes run tasks overdue by this
    idle_period: Option<Duration>,
    next_idle_due: Instant,
    /// Manual trigger armed
    triggered: bool,
    /// Consumed from the heap by an open pass
    running: bool,
}

/// The registry of background tasks.
#[derive(Debug)]
pub struct PollableRegistry {
    tasks: Vec<PollableTask>,
    heap: BinaryHeap<Reverse<(Instant, usize)>>,
    in_pass: bool,
    deferred_triggers: Vec<PollTaskKind>,
}

impl PollableRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            heap: BinaryHeap::new(),
            in_pass: false,
            deferred_triggers: Vec::new(),
        }
    }

    /// Register a periodic task. It first becomes due one period from
    /// `now`.
    pub fn register_periodic(
        &mut self,
        kind: PollTaskKind,
        period: Duration,
        idle_period: Option<Duration>,
        now: Instant,
    ) {
        let index = self.tasks.len();
        self.tasks.push(PollableTask {
            kind,
            period: Some(period),
            idle_period,
            next_idle_due: now + idle_period.unwrap_or(period),
            triggered: false,
            running: false,
        });
        self.heap.push(Reverse((now + period, index)));
    }

    /// Register a manual-only task: effectively infinite period, runs
    /// only when triggered.
    pub fn register_manual(&mut self, kind: PollTaskKind, now: Instant) {
        self.tasks.push(PollableTask {
            kind,
            period: None,
            idle_period: None,
            next_idle_due: now,
            triggered: false,
            running: false,
        });
    }

    /// Signal a task to run on the next pass. Safe to call while a pass
    /// is open; the trigger is deferred until the pass ends.
    pub fn trigger(&mut self, kind: PollTaskKind) {
        if self.in_pass {
            self.deferred_triggers.push(kind);
            return;
        }
        if let Some(task) = self.tasks.iter_mut().find(|t| t.kind == kind) {
            task.triggered = true;
        }
    }

    /// The nearest periodic deadline, for batch-mode sleeping.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|Reverse((when, _))| *when)
    }

    /// Whether any task is due (or triggered) at `now`.
    pub fn any_due(&self, now: Instant) -> bool {
        if self.tasks.iter().any(|t| t.triggered && !t.running) {
            return true;
        }
        matches!(self.heap.peek(), Some(Reverse((when, _))) if *when <= now)
    }

    /// Whether any task is idle-due at `now`.
    pub fn any_idle_due(&self, now: Instant) -> bool {
        self.tasks
            .iter()
            .any(|t| t.idle_period.is_some() && !t.running && t.next_idle_due <= now)
    }

    /// Open a pass: pop every task due at or before `now` (at most
    /// `max`, bounding pollable storms). An idle pass instead scans for
    /// idle-due tasks. Triggered manual tasks are included either way.
    /// The caller must execute the returned kinds and then call
    /// [`PollableRegistry::end_pass`] with them.
    pub fn begin_pass(&mut self, now: Instant, is_idle: bool, max: usize) -> Vec<PollTaskKind> {
        debug_assert!(!self.in_pass, "begin_pass while a pass is open");
        self.in_pass = true;
        let mut due: Vec<PollTaskKind> = Vec::new();

        if is_idle {
            for task in self.tasks.iter_mut() {
                if due.len() >= max {
                    break;
                }
                if task.running {
                    continue;
                }
                if task.idle_period.is_some() && task.next_idle_due <= now {
                    task.running = true;
                    due.push(task.kind);
                }
            }
        } else {
            while due.len() < max {
                match self.heap.peek() {
                    Some(Reverse((when, _))) if *when <= now => {
                        let Reverse((_, index)) = self.heap.pop().expect("peeked entry");
                        let task = &mut self.tasks[index];
                        task.running = true;
                        due.push(task.kind);
                    }
                    _ => break,
                }
            }
        }

        for task in self.tasks.iter_mut() {
            if due.len() >= max {
                break;
            }
            if task.triggered && !task.running {
                task.running = true;
                task.triggered = false;
                due.push(task.kind);
            }
        }
        due
    }

    /// Close a pass: re-arm the tasks that ran and apply any triggers
    /// deferred while the pass was open.
    pub fn end_pass(&mut self, now: Instant) {
        debug_assert!(self.in_pass, "end_pass without begin_pass");
        for index in 0..self.tasks.len() {
            if !self.tasks[index].running {
                continue;
            }
            let task = &mut self.tasks[index];
            task.running = false;
            task.triggered = false;
            if let Some(period) = task.period {
                self.heap.push(Reverse((now + period, index)));
            }
            if let Some(idle_period) = task.idle_period {
                task.next_idle_due = now + idle_period;
            }
        }
        self.in_pass = false;
        let deferred = std::mem::take(&mut self.deferred_triggers);
        for kind in deferred {
            self.trigger(kind);
        }
    }
}

impl Default for PollableRegistry {
    fn default() -> Self {
        Self::new()
    }
}
