//! In-process director/worker transport.
//!
//! Each worker gets a channel pair: director-to-worker for commands and
//! a shared worker-to-director lane for replies. The director talks
//! through the [`DirectorLink`] trait so a different link layer can be
//! swapped in without touching the protocol logic.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::distrib::protocol::{DirectorMsg, WorkerId, WorkerMsg};

/// Error on the director/worker link.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum TransportError {
    /// The worker's channel is gone
    #[error("worker {0} is disconnected")]
    Disconnected(WorkerId),
    /// No worker with this id exists on the fabric
    #[error("no such worker {0}")]
    UnknownWorker(WorkerId),
    /// The director's channel is gone
    #[error("director is gone")]
    DirectorGone,
}

/// Director side of the link fabric.
pub trait DirectorLink: Send {
    /// Number of workers on the fabric.
    fn worker_count(&self) -> usize;

    /// Send a command to one worker.
    fn send(&self, worker: WorkerId, msg: DirectorMsg) -> Result<(), TransportError>;

    /// Next queued worker message, if any. Never blocks.
    fn try_recv(&self) -> Option<(WorkerId, WorkerMsg)>;
}

/// Worker side of one link.
#[derive(Debug)]
pub struct WorkerLink {
    worker_id: WorkerId,
    rx: Receiver<DirectorMsg>,
    tx: Sender<(WorkerId, WorkerMsg)>,
}

impl WorkerLink {
    /// This link's worker id.
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Next queued director command, if any. Never blocks.
    pub fn try_recv(&self) -> Option<DirectorMsg> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for a director command.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<DirectorMsg>, TransportError> {
        match self.rx.recv_timeout(timeout) {
            Ok(msg) => Ok(Some(msg)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(TransportError::DirectorGone),
        }
    }

    /// Send a message back to the director.
    pub fn send(&self, msg: WorkerMsg) -> Result<(), TransportError> {
        self.tx
            .send((self.worker_id, msg))
            .map_err(|_| TransportError::DirectorGone)
    }
}

/// Channel fabric connecting one director to its workers.
#[derive(Debug)]
pub struct ChannelFabric {
    to_workers: Vec<Sender<DirectorMsg>>,
    from_workers: Receiver<(WorkerId, WorkerMsg)>,
}

impl DirectorLink for ChannelFabric {
    fn worker_count(&self) -> usize {
        self.to_workers.len()
    }

    fn send(&self, worker: WorkerId, msg: DirectorMsg) -> Result<(), TransportError> {
        let tx = self
            .to_workers
            .get(worker)
            .ok_or(TransportError::UnknownWorker(worker))?;
        tx.send(msg).map_err(|_| TransportError::Disconnected(worker))
    }

    fn try_recv(&self) -> Option<(WorkerId, WorkerMsg)> {
        self.from_workers.try_recv().ok()
    }
}

/// Build the fabric for `workers` links.
pub fn channel_fabric(workers: usize) -> (ChannelFabric, Vec<WorkerLink>) {
    let (reply_tx, reply_rx) = unbounded();
    let mut to_workers = Vec::with_capacity(workers);
    let mut links = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let (command_tx, command_rx) = unbounded();
        to_workers.push(command_tx);
        links.push(WorkerLink { worker_id, rx: command_rx, tx: reply_tx.clone() });
    }
    (ChannelFabric { to_workers, from_workers: reply_rx }, links)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fabric_routes_both_directions() {
        let (fabric, links) = channel_fabric(2);
        assert_eq!(fabric.worker_count(), 2);

        fabric.send(1, DirectorMsg::Retract { max: 3 }).unwrap();
        assert!(links[0].try_recv().is_none());
        assert!(matches!(links[1].try_recv(), Some(DirectorMsg::Retract { max: 3 })));

        links[0].send(WorkerMsg::Heartbeat { queued: 7 }).unwrap();
        let (worker, msg) = fabric.try_recv().unwrap();
        assert_eq!(worker, 0);
        assert!(matches!(msg, WorkerMsg::Heartbeat { queued: 7 }));
    }

    #[test]
    fn test_unknown_worker_is_an_error() {
        let (fabric, _links) = channel_fabric(1);
        assert!(matches!(
            fabric.send(5, DirectorMsg::Shutdown),
            Err(TransportError::UnknownWorker(5))
        ));
    }

    #[test]
    fn test_dropped_worker_reports_disconnected() {
        let (fabric, links) = channel_fabric(1);
        drop(links);
        assert!(matches!(
            fabric.send(0, DirectorMsg::Shutdown),
            Err(TransportError::Disconnected(0))
        ));
    }

    #[test]
    fn test_recv_timeout_times_out_cleanly() {
        let (_fabric, links) = channel_fabric(1);
        let got = links[0].recv_timeout(Duration::from_millis(5)).unwrap();
        assert!(got.is_none());
    }
}
