//! Worker runtime: a cook session driven by director messages.
//!
//! A worker is an ordinary session in worker mode (no incremental
//! skipping, no registry writes) fed by `Assign` batches instead of the
//! CLI. Between ticks it reports completions, answers retraction
//! requests with its least-progressed items, acks fences once drained,
//! and heartbeats so the director's diagnostics stay honest.

use std::path::Path;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::collab::Collaborators;
use crate::config::KilnConfig;
use crate::distrib::protocol::{DirectorMsg, WorkerMsg};
use crate::distrib::transport::WorkerLink;
use crate::error::CookError;
use crate::item::instigator::Instigator;
use crate::report::SessionReport;
use crate::request::BuildRequest;
use crate::session::{CookSession, SessionMode, TickOutcome};

/// Drive a worker session until the director says shutdown.
pub fn run_worker(mut session: CookSession, link: WorkerLink) -> Result<SessionReport, CookError> {
    let heartbeat = Duration::from_secs(session.config().distribution.heartbeat_secs.max(1));
    let mut last_heartbeat = Instant::now();
    let mut pending_fence: Option<u64> = None;
    let mut idle = false;

    loop {
        let mut inbox: Vec<DirectorMsg> = Vec::new();
        if idle {
            // nothing queued locally; block until the director speaks or
            // the heartbeat is due
            if let Some(msg) = link.recv_timeout(heartbeat)? {
                inbox.push(msg);
            }
        }
        while let Some(msg) = link.try_recv() {
            inbox.push(msg);
        }

        for msg in inbox {
            match msg {
                DirectorMsg::Assign(batch) => {
                    debug!(worker = link.worker_id(), count = batch.len(), "received batch");
                    for assignment in batch {
                        session.submit(
                            BuildRequest::new(assignment.id, Instigator::director())
                                .with_profiles(assignment.profiles)
                                .with_urgency(assignment.urgency),
                        );
                    }
                }
                DirectorMsg::Retract { max } => {
                    let items = session.retract(max);
                    debug!(worker = link.worker_id(), count = items.len(), "returning items");
                    link.send(WorkerMsg::Returned { items })?;
                }
                DirectorMsg::Fence { fence } => pending_fence = Some(fence),
                DirectorMsg::Shutdown => {
                    let _ = link.send(WorkerMsg::ShuttingDown);
                    return session.finish();
                }
            }
        }

        let outcome = session.tick();
        for (id, success) in session.drain_completions() {
            link.send(WorkerMsg::ItemDone { id, success })?;
        }
        if let Some(fence) = pending_fence {
            if !session.has_outstanding() {
                link.send(WorkerMsg::FenceAck { fence })?;
                pending_fence = None;
            }
        }
        let now = Instant::now();
        if now.duration_since(last_heartbeat) >= heartbeat {
            link.send(WorkerMsg::Heartbeat { queued: session.outstanding_items() })?;
            last_heartbeat = now;
        }
        idle = outcome == TickOutcome::Done;
    }
}

/// Spawn one worker thread per link, each with its own session over the
/// shared project tree.
pub fn spawn_local_workers(
    config: &KilnConfig,
    root: &Path,
    links: Vec<WorkerLink>,
) -> Vec<JoinHandle<()>> {
    links
        .into_iter()
        .map(|link| {
            let config = worker_config(config);
            let root = root.to_path_buf();
            std::thread::spawn(move || {
                let worker_id = link.worker_id();
                let src_root = root.join(&config.project.src);
                let collab = Collaborators::filesystem(&src_root);
                match CookSession::new(config, root, collab, SessionMode::Worker) {
                    Ok(session) => {
                        if let Err(err) = run_worker(session, link) {
                            warn!(worker = worker_id, error = %err, "worker stopped");
                        }
                    }
                    Err(err) => {
                        warn!(worker = worker_id, error = %err, "worker session failed to start");
                    }
                }
            })
        })
        .collect()
}

/// Workers never re-distribute their own work.
fn worker_config(config: &KilnConfig) -> KilnConfig {
    let mut config = config.clone();
    config.distribution.workers = 0;
    config
}
