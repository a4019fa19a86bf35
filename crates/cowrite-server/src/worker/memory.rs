//! In-process worker backend.
//!
//! `MemorySpawner` hands out `MemoryWorker`s that live inside the master
//! process. They keep a per-document revision count and derive deltas
//! deterministically from each edit payload: the payload is split on `;` and
//! every non-empty part becomes one delta, in order.
//!
//! A shared [`MemoryWorkerControl`] lets tests kill workers, stall or pause
//! their round trips, refuse documents, fail spawns and kill the spawner. It
//! also records every edit forwarded to any worker.

#![allow(clippy::disallowed_types, reason = "Synchronous in-memory bookkeeping only")]

use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use cowrite_core::{
    DocumentId, Health, LoadOutcome, SessionId, Worker, WorkerError, WorkerLiveness, WorkerProbe,
    WorkerReply, WorkerSpawner, liveness,
};
use tokio::sync::watch;

/// Engine version reported by in-memory workers.
pub const MEMORY_ENGINE_VERSION: &str = "memory-1";

/// First pid handed out by a fresh control.
const FIRST_PID: u32 = 1000;

/// One edit as seen by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedEdit {
    /// Worker that received the edit
    pub pid: u32,
    /// Session that sent it
    pub session: SessionId,
    /// Payload as received
    pub payload: Bytes,
}

#[derive(Debug, Default)]
struct ControlState {
    liveness: HashMap<u32, WorkerLiveness>,
    bound: HashMap<u32, DocumentId>,
    stalled: HashSet<u32>,
    stall_all: bool,
    refused: HashSet<DocumentId>,
    edits: Vec<ForwardedEdit>,
    failing_spawns: usize,
    spawn_delay: Duration,
}

/// Shared switchboard for in-memory workers. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryWorkerControl {
    inner: Arc<ControlInner>,
}

#[derive(Debug)]
struct ControlInner {
    state: Mutex<ControlState>,
    next_pid: AtomicU32,
    spawned: AtomicUsize,
    terminated: AtomicUsize,
    launched: AtomicBool,
    spawner_killed: AtomicBool,
    paused: watch::Sender<HashSet<u32>>,
    held: AtomicUsize,
}

impl Default for MemoryWorkerControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorkerControl {
    /// Fresh control: nothing spawned, spawner not yet launched.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ControlInner {
                state: Mutex::new(ControlState::default()),
                next_pid: AtomicU32::new(FIRST_PID),
                spawned: AtomicUsize::new(0),
                terminated: AtomicUsize::new(0),
                launched: AtomicBool::new(false),
                spawner_killed: AtomicBool::new(false),
                paused: watch::channel(HashSet::new()).0,
                held: AtomicUsize::new(0),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ControlState> {
        #[allow(clippy::expect_used)]
        self.inner.state.lock().expect("invariant: control state mutex is never poisoned")
    }

    /// Kill worker `pid`. Returns whether such a worker exists.
    pub fn kill(&self, pid: u32) -> bool {
        match self.state().liveness.get(&pid) {
            Some(liveness) => {
                liveness.mark_dead();
                true
            },
            None => false,
        }
    }

    /// Make every round trip of worker `pid` hang until the worker dies.
    pub fn stall(&self, pid: u32) {
        self.state().stalled.insert(pid);
    }

    /// Hold round trips of worker `pid` until [`resume`](Self::resume).
    pub fn pause(&self, pid: u32) {
        self.inner.paused.send_modify(|paused| {
            paused.insert(pid);
        });
    }

    /// Release round trips held by [`pause`](Self::pause).
    pub fn resume(&self, pid: u32) {
        self.inner.paused.send_modify(|paused| {
            paused.remove(&pid);
        });
    }

    /// Round trips currently held by a pause.
    pub fn held(&self) -> usize {
        self.inner.held.load(Ordering::Acquire)
    }

    /// Make every worker's round trips hang, including future workers.
    pub fn stall_all(&self) {
        self.state().stall_all = true;
    }

    /// Make workers refuse to load `document`.
    pub fn refuse(&self, document: &DocumentId) {
        self.state().refused.insert(document.clone());
    }

    /// Fail the next `count` spawn requests with `SpawnFailed`.
    pub fn fail_spawns(&self, count: usize) {
        self.state().failing_spawns = count;
    }

    /// Delay every subsequent spawn by `delay`.
    pub fn set_spawn_delay(&self, delay: Duration) {
        self.state().spawn_delay = delay;
    }

    /// Kill the spawner. Running workers are unaffected.
    pub fn kill_spawner(&self) {
        self.inner.spawner_killed.store(true, Ordering::Release);
    }

    /// Workers spawned so far.
    pub fn spawned(&self) -> usize {
        self.inner.spawned.load(Ordering::Acquire)
    }

    /// Workers terminated so far.
    pub fn terminated(&self) -> usize {
        self.inner.terminated.load(Ordering::Acquire)
    }

    /// Pid of the most recent worker bound to `document`, if any.
    pub fn pid_for(&self, document: &DocumentId) -> Option<u32> {
        self.state().bound.iter().filter(|(_, doc)| *doc == document).map(|(pid, _)| *pid).max()
    }

    /// Number of workers bound to `document` over the control's lifetime.
    pub fn bindings_for(&self, document: &DocumentId) -> usize {
        self.state().bound.values().filter(|doc| *doc == document).count()
    }

    /// Every edit forwarded to any worker, in arrival order.
    pub fn forwarded_edits(&self) -> Vec<ForwardedEdit> {
        self.state().edits.clone()
    }

    fn is_stalled(&self, pid: u32) -> bool {
        let state = self.state();
        state.stall_all || state.stalled.contains(&pid)
    }

    async fn wait_while_paused(&self, pid: u32, watcher: &WorkerProbe) {
        let mut paused = self.inner.paused.subscribe();
        if !paused.borrow_and_update().contains(&pid) {
            return;
        }

        self.inner.held.fetch_add(1, Ordering::AcqRel);
        loop {
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() || !paused.borrow_and_update().contains(&pid) {
                        break;
                    }
                },
                () = watcher.died() => break,
            }
        }
        self.inner.held.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Spawner for in-memory workers.
#[derive(Debug, Clone)]
pub struct MemorySpawner {
    control: MemoryWorkerControl,
}

impl MemorySpawner {
    /// Spawner driven by `control`.
    pub fn new(control: MemoryWorkerControl) -> Self {
        Self { control }
    }

    /// The control shared with every worker this spawner creates.
    pub fn control(&self) -> &MemoryWorkerControl {
        &self.control
    }
}

#[async_trait]
impl WorkerSpawner for MemorySpawner {
    type Worker = MemoryWorker;

    async fn launch(&self) -> Result<(), WorkerError> {
        if self.control.inner.spawner_killed.load(Ordering::Acquire) {
            return Err(WorkerError::SpawnerDown);
        }
        self.control.inner.launched.store(true, Ordering::Release);
        Ok(())
    }

    fn spawner_health(&self) -> Health {
        let inner = &self.control.inner;
        if inner.launched.load(Ordering::Acquire) && !inner.spawner_killed.load(Ordering::Acquire) {
            Health::Alive
        } else {
            Health::Dead
        }
    }

    async fn spawn(&self) -> Result<MemoryWorker, WorkerError> {
        if self.spawner_health() == Health::Dead {
            return Err(WorkerError::SpawnerDown);
        }

        let delay = {
            let mut state = self.control.state();
            if state.failing_spawns > 0 {
                state.failing_spawns -= 1;
                return Err(WorkerError::SpawnFailed("injected spawn failure".to_string()));
            }
            state.spawn_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let pid = self.control.inner.next_pid.fetch_add(1, Ordering::Relaxed);
        let (live, probe) = liveness();
        self.control.state().liveness.insert(pid, live);
        self.control.inner.spawned.fetch_add(1, Ordering::AcqRel);

        Ok(MemoryWorker {
            pid,
            probe,
            control: self.control.clone(),
            document: None,
            sessions: HashSet::new(),
            revision: 0,
        })
    }
}

/// In-process worker serving one document.
#[derive(Debug)]
pub struct MemoryWorker {
    pid: u32,
    probe: WorkerProbe,
    control: MemoryWorkerControl,
    document: Option<DocumentId>,
    sessions: HashSet<SessionId>,
    revision: u64,
}

impl MemoryWorker {
    /// Fail if dead; hang until death if stalled; wait out a pause.
    async fn round_trip(&self) -> Result<(), WorkerError> {
        if self.control.is_stalled(self.pid) {
            self.probe.died().await;
        }
        self.control.wait_while_paused(self.pid, &self.probe).await;
        if self.probe.is_alive() { Ok(()) } else { Err(WorkerError::Died { pid: self.pid }) }
    }
}

#[async_trait]
impl Worker for MemoryWorker {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn probe(&self) -> WorkerProbe {
        self.probe.clone()
    }

    fn engine_version(&self) -> Option<&str> {
        Some(MEMORY_ENGINE_VERSION)
    }

    async fn bind(&mut self, document: &DocumentId) -> Result<LoadOutcome, WorkerError> {
        self.round_trip().await?;
        if self.document.is_some() {
            return Err(WorkerError::Protocol(format!("worker {} is already bound", self.pid)));
        }

        let refused = {
            let mut state = self.control.state();
            state.bound.insert(self.pid, document.clone());
            state.refused.contains(document)
        };
        if refused {
            return Ok(LoadOutcome::Refused(format!("cannot open {document}")));
        }

        self.document = Some(document.clone());
        Ok(LoadOutcome::Loaded)
    }

    async fn join(&mut self, session: SessionId) -> Result<WorkerReply, WorkerError> {
        self.round_trip().await?;
        let Some(document) = &self.document else {
            return Err(WorkerError::Protocol("join before load".to_string()));
        };

        self.sessions.insert(session);
        let snapshot = format!("{document}@{}", self.revision);
        Ok(WorkerReply::new(vec![Bytes::from(snapshot)]))
    }

    async fn leave(&mut self, session: SessionId) -> Result<(), WorkerError> {
        self.round_trip().await?;
        self.sessions.remove(&session);
        Ok(())
    }

    async fn send(
        &mut self,
        session: SessionId,
        payload: Bytes,
    ) -> Result<WorkerReply, WorkerError> {
        self.round_trip().await?;
        if !self.sessions.contains(&session) {
            return Err(WorkerError::Protocol(format!("edit from unjoined session {session}")));
        }

        self.control.state().edits.push(ForwardedEdit {
            pid: self.pid,
            session,
            payload: payload.clone(),
        });

        let deltas: Vec<Bytes> = payload
            .split(|b| *b == b';')
            .filter(|part| !part.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();
        self.revision += deltas.len() as u64;
        Ok(WorkerReply::new(deltas))
    }

    async fn flush(&mut self) -> Result<(), WorkerError> {
        self.round_trip().await
    }

    async fn ping(&mut self) -> Result<(), WorkerError> {
        self.round_trip().await
    }

    async fn terminate(&mut self) {
        let live = self.control.state().liveness.remove(&self.pid);
        if let Some(live) = live {
            live.mark_dead();
            self.control.inner.terminated.fetch_add(1, Ordering::AcqRel);
        }
    }
}
