//! Worker capability boundary.
//!
//! A worker is a sandboxed process that renders and edits exactly one
//! document. The master never depends on how workers are started or what
//! they speak on the wire: it sees a [`WorkerSpawner`] that hands out
//! [`Worker`]s, and each worker exposes a few round trips plus a liveness
//! [`WorkerProbe`].
//!
//! Round trips take `&mut self`. Whoever owns a worker is therefore the only
//! writer on its channel; for a bound worker that is the document broker.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::{
    error::WorkerError,
    ids::{DocumentId, SessionId},
};

/// Liveness of a worker or of the spawner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    /// Process is running and its channel is open
    Alive,
    /// Process exited or its channel closed
    Dead,
}

/// Lifecycle of a worker as tracked by the supervisor.
///
/// Spawns still in flight have no pid yet; the pool counts them instead of
/// recording them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Ready in the warm pool
    Idle,
    /// Handed to a broker for one document
    Bound,
    /// Broker finished with it; being terminated
    Draining,
    /// Exited
    Dead,
}

/// Supervisor's record of one worker process.
#[derive(Debug, Clone)]
pub struct WorkerProcess<I> {
    /// Operating system process id
    pub pid: u32,
    /// Current lifecycle state
    pub state: WorkerState,
    /// Document the worker is bound to, while bound
    pub bound_document: Option<DocumentId>,
    /// Last time the worker answered a heartbeat (or was spawned)
    pub last_heartbeat: I,
}

/// Result of asking a worker to open a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Document loaded; sessions may join
    Loaded,
    /// Worker refused the document
    Refused(String),
}

/// Output of one worker round trip, in the order the worker emitted it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReply {
    /// Opaque payloads (deltas or join state)
    pub deltas: Vec<Bytes>,
}

impl WorkerReply {
    /// Reply carrying the given payloads.
    pub fn new(deltas: Vec<Bytes>) -> Self {
        Self { deltas }
    }
}

/// Creates a linked liveness flag and probe for a new worker.
///
/// The backend keeps the [`WorkerLiveness`] and marks it dead when the
/// process exits; everyone else holds probes.
pub fn liveness() -> (WorkerLiveness, WorkerProbe) {
    let (tx, rx) = watch::channel(Health::Alive);
    (WorkerLiveness { tx }, WorkerProbe { rx })
}

/// Writer side of a worker's liveness.
#[derive(Debug)]
pub struct WorkerLiveness {
    tx: watch::Sender<Health>,
}

impl WorkerLiveness {
    /// Record that the worker died. Idempotent.
    pub fn mark_dead(&self) {
        self.tx.send_replace(Health::Dead);
    }

    /// A new probe observing this worker.
    pub fn probe(&self) -> WorkerProbe {
        WorkerProbe { rx: self.tx.subscribe() }
    }
}

/// Read-only view of a worker's liveness. Cheap to clone.
#[derive(Debug, Clone)]
pub struct WorkerProbe {
    rx: watch::Receiver<Health>,
}

impl WorkerProbe {
    /// Current health. A dropped liveness flag counts as dead.
    pub fn health(&self) -> Health {
        if self.rx.has_changed().is_err() {
            return Health::Dead;
        }
        *self.rx.borrow()
    }

    /// Whether the worker is still alive.
    pub fn is_alive(&self) -> bool {
        self.health() == Health::Alive
    }

    /// Resolves once the worker is dead.
    pub async fn died(&self) {
        let mut rx = self.rx.clone();
        // Err means the liveness flag was dropped, which also means dead.
        let _ = rx.wait_for(|health| *health == Health::Dead).await;
    }
}

/// One worker process, driven by its single owner.
#[async_trait]
pub trait Worker: Send + 'static {
    /// Operating system process id.
    fn pid(&self) -> u32;

    /// Liveness probe for this worker.
    fn probe(&self) -> WorkerProbe;

    /// Current health.
    fn health(&self) -> Health {
        self.probe().health()
    }

    /// Engine version announced by the worker, if any.
    fn engine_version(&self) -> Option<&str> {
        None
    }

    /// Open `document`. Called exactly once, right after binding.
    async fn bind(&mut self, document: &DocumentId) -> Result<LoadOutcome, WorkerError>;

    /// Add a session; the reply carries the state the joiner must receive.
    async fn join(&mut self, session: SessionId) -> Result<WorkerReply, WorkerError>;

    /// Remove a session.
    async fn leave(&mut self, session: SessionId) -> Result<(), WorkerError>;

    /// Apply an edit; the reply carries the resulting deltas in emission order.
    async fn send(&mut self, session: SessionId, payload: Bytes)
    -> Result<WorkerReply, WorkerError>;

    /// Persist pending changes before unload.
    async fn flush(&mut self) -> Result<(), WorkerError>;

    /// Heartbeat round trip.
    async fn ping(&mut self) -> Result<(), WorkerError>;

    /// Stop the process. Never fails; a dead worker is already terminated.
    async fn terminate(&mut self);
}

/// The long-lived helper that creates workers on demand.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
    /// Worker type produced by this spawner.
    type Worker: Worker;

    /// Start the spawner. Called once at startup.
    async fn launch(&self) -> Result<(), WorkerError>;

    /// Whether the spawner is still running.
    fn spawner_health(&self) -> Health;

    /// Produce one freshly initialized worker.
    async fn spawn(&self) -> Result<Self::Worker, WorkerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_follows_liveness() {
        let (liveness, probe) = liveness();
        let second = liveness.probe();
        assert!(probe.is_alive());

        liveness.mark_dead();
        assert_eq!(probe.health(), Health::Dead);
        assert_eq!(second.health(), Health::Dead);
    }

    #[test]
    fn dropped_liveness_reads_as_dead() {
        let (liveness, probe) = liveness();
        drop(liveness);
        assert_eq!(probe.health(), Health::Dead);
    }

    #[tokio::test]
    async fn died_resolves_after_mark_dead() {
        let (liveness, probe) = liveness();
        let waiter = tokio::spawn(async move { probe.died().await });

        liveness.mark_dead();
        waiter.await.unwrap();
    }
}
