//! Worker pool supervisor.
//!
//! Runs the spawner, keeps the warm pool filled and hands workers to brokers.
//! The decisions live in [`PoolState`]; this module executes them: it spawns,
//! pings and terminates workers on background tasks, and tells brokers when
//! their bound worker died.
//!
//! # Spawner death
//!
//! Once the spawner is down it stays down. Pending and future requests fail
//! with `SpawnerDown` and the shutdown signal flips, but workers already bound
//! to brokers keep running and keep being reaped.

#![allow(clippy::disallowed_types, reason = "Short synchronous critical sections only")]

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use cowrite_core::{
    BrokerError, DocumentId, Environment, Health, PoolState, ServiceContext, Worker,
    WorkerError, WorkerSpawner,
};
use tokio::{
    sync::{Notify, oneshot, watch},
    task::JoinHandle,
};

/// Notice that a bound worker died.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerDeath {
    /// Process id of the dead worker
    pub pid: u32,
}

/// A worker handed to a broker, with the channel its death is reported on.
#[derive(Debug)]
pub struct WorkerLease<W> {
    /// Worker bound to the requesting document
    pub worker: W,
    /// Resolves if the supervisor finds the worker dead
    pub death: oneshot::Receiver<WorkerDeath>,
}

/// Pool figures for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Workers ready in the warm pool
    pub idle: usize,
    /// Spawns outstanding
    pub in_flight: usize,
    /// Workers tracked in any state
    pub tracked: usize,
    /// Consecutive spawn failures
    pub failures: u32,
}

/// Counts one caller waiting for a worker while alive.
struct Waiting<'a>(&'a AtomicUsize);

impl<'a> Waiting<'a> {
    fn enter(count: &'a AtomicUsize) -> Self {
        count.fetch_add(1, Ordering::AcqRel);
        Self(count)
    }
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Supervises the spawner and the warm worker pool.
pub struct WorkerSupervisor<S: WorkerSpawner, E: Environment> {
    spawner: Arc<S>,
    env: E,
    ctx: Arc<ServiceContext>,
    pool: Mutex<PoolState<S::Worker, E::Instant>>,
    /// Death channels of bound workers, by pid
    owners: Mutex<HashMap<u32, oneshot::Sender<WorkerDeath>>>,
    /// Callers blocked in `request_worker` with an empty pool
    waiting: AtomicUsize,
    idle_ready: Notify,
    wake: Notify,
    launched: AtomicBool,
    stopping: AtomicBool,
    spawner_down: watch::Sender<bool>,
}

impl<S: WorkerSpawner, E: Environment> WorkerSupervisor<S, E> {
    /// Supervisor for `spawner`. Nothing runs until
    /// [`spawn_spawner`](Self::spawn_spawner) and [`start`](Self::start).
    pub fn new(ctx: Arc<ServiceContext>, spawner: S, env: E) -> Arc<Self> {
        let pool = PoolState::new(ctx.config());
        let (spawner_down, _) = watch::channel(false);
        Arc::new(Self {
            spawner: Arc::new(spawner),
            env,
            ctx,
            pool: Mutex::new(pool),
            owners: Mutex::new(HashMap::new()),
            waiting: AtomicUsize::new(0),
            idle_ready: Notify::new(),
            wake: Notify::new(),
            launched: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            spawner_down,
        })
    }

    /// The spawner backend.
    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Launch the spawner. Only the first call does anything.
    ///
    /// # Errors
    ///
    /// `SpawnerDown` if the spawner could not be launched. This is fatal.
    pub async fn spawn_spawner(&self) -> Result<(), WorkerError> {
        if self.launched.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match self.spawner.launch().await {
            Ok(()) => {
                tracing::info!("spawner running");
                self.wake.notify_one();
                Ok(())
            },
            Err(err) => {
                tracing::error!(error = %err, "failed to launch spawner");
                self.mark_spawner_down();
                Err(WorkerError::SpawnerDown)
            },
        }
    }

    /// Start the maintenance loop.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move { supervisor.run().await })
    }

    /// Ask the maintenance loop to exit.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        self.wake.notify_one();
    }

    async fn run(self: Arc<Self>) {
        let interval = self.ctx.config().maintain_interval;
        tracing::debug!(?interval, "pool maintenance started");

        while !self.stopping.load(Ordering::Acquire) {
            self.maintain();
            tokio::select! {
                () = self.env.sleep(interval) => {},
                () = self.wake.notified() => {},
            }
        }

        tracing::debug!("pool maintenance stopped");
    }

    /// One maintenance pass: reap, heartbeat, replenish.
    fn maintain(self: &Arc<Self>) {
        let config = self.ctx.config();
        let now = self.env.now();

        if self.launched.load(Ordering::Acquire)
            && !self.is_spawner_down()
            && self.spawner.spawner_health() == Health::Dead
        {
            self.mark_spawner_down();
        }
        let can_spawn = self.launched.load(Ordering::Acquire) && !self.is_spawner_down();

        let (reaped, due, planned) = {
            let mut pool = self.pool();
            let reaped = pool.reap(now, config.heartbeat_timeout);
            let due = pool.take_due_heartbeats(now, config.heartbeat_interval);
            let waiting = self.waiting.load(Ordering::Acquire);
            let planned = if can_spawn { pool.plan_spawns(now, waiting) } else { 0 };
            (reaped, due, planned)
        };

        for mut worker in reaped.retired {
            tracing::info!(pid = worker.pid(), "retiring idle worker");
            tokio::spawn(async move { worker.terminate().await });
        }
        for dead in reaped.dead_bindings {
            tracing::warn!(pid = dead.pid, document = %dead.document, "bound worker died");
            self.notify_owner(dead.pid);
        }
        for worker in due {
            tokio::spawn(Arc::clone(self).heartbeat(worker));
        }
        for _ in 0..planned {
            tokio::spawn(Arc::clone(self).run_spawn());
        }
    }

    async fn heartbeat(self: Arc<Self>, mut worker: S::Worker) {
        let pid = worker.pid();
        let deadline = self.ctx.config().round_trip_timeout;

        let answered = tokio::time::timeout(deadline, worker.ping()).await;
        match answered {
            Ok(Ok(())) => {
                let now = self.env.now();
                self.pool().heartbeat_ok(worker, now);
                self.idle_ready.notify_waiters();
            },
            Ok(Err(err)) => {
                tracing::warn!(pid, error = %err, "idle worker failed heartbeat");
                self.pool().heartbeat_failed(pid);
                worker.terminate().await;
                self.wake.notify_one();
            },
            Err(_) => {
                tracing::warn!(pid, ?deadline, "idle worker missed heartbeat");
                self.pool().heartbeat_failed(pid);
                worker.terminate().await;
                self.wake.notify_one();
            },
        }
    }

    async fn run_spawn(self: Arc<Self>) {
        let spawned = self.spawner.spawn().await;
        match spawned {
            Ok(mut worker) => {
                let pid = worker.pid();
                if let Some(version) = worker.engine_version() {
                    if self.ctx.record_engine_version(version) {
                        tracing::info!(engine_version = %version, "engine version reported");
                    }
                }

                if self.stopping.load(Ordering::Acquire) {
                    self.pool().spawn_failed(self.env.now());
                    worker.terminate().await;
                    return;
                }

                let now = self.env.now();
                self.pool().spawn_succeeded(worker, now);
                tracing::debug!(pid, "worker ready");
                self.idle_ready.notify_waiters();
            },
            Err(WorkerError::SpawnerDown) => {
                let now = self.env.now();
                self.pool().spawn_failed(now);
                self.mark_spawner_down();
            },
            Err(err) => {
                let now = self.env.now();
                let delay = self.pool().spawn_failed(now);
                tracing::warn!(error = %err, ?delay, "spawn failed; backing off");

                let supervisor = Arc::clone(&self);
                tokio::spawn(async move {
                    supervisor.env.sleep(delay).await;
                    supervisor.wake.notify_one();
                });
            },
        }
    }

    /// A worker bound to `document`.
    ///
    /// Takes the oldest idle worker if there is one. Otherwise waits for the
    /// next one while the maintenance loop spawns on this caller's behalf.
    ///
    /// # Errors
    ///
    /// - `SpawnerDown` if the spawner is down, even with idle workers left.
    /// - `WorkerUnavailable` if no worker turned up within `spawn_timeout`.
    pub async fn request_worker(
        &self,
        document: &DocumentId,
    ) -> Result<WorkerLease<S::Worker>, BrokerError> {
        let waited = self.ctx.config().spawn_timeout;
        let worker = tokio::time::timeout(waited, self.wait_for_idle(document))
            .await
            .map_err(|_| BrokerError::WorkerUnavailable { waited })??;

        let pid = worker.pid();
        let (tx, death) = oneshot::channel();
        self.owners().insert(pid, tx);
        tracing::debug!(pid, document = %document, "worker bound");

        // The pool just shrank.
        self.wake.notify_one();
        Ok(WorkerLease { worker, death })
    }

    async fn wait_for_idle(&self, document: &DocumentId) -> Result<S::Worker, BrokerError> {
        let mut down = self.spawner_down.subscribe();
        let mut waiting = None;

        loop {
            if *down.borrow_and_update() {
                return Err(BrokerError::SpawnerDown);
            }

            let notified = self.idle_ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let taken = self.pool().take_idle(document);
            if let Some(worker) = taken {
                return Ok(worker);
            }

            if waiting.is_none() {
                waiting = Some(Waiting::enter(&self.waiting));
            }
            self.wake.notify_one();

            tokio::select! {
                () = &mut notified => {},
                _ = down.changed() => {},
            }
        }
    }

    /// Take back a worker whose broker is done and terminate it.
    ///
    /// Workers are single use; a released worker never returns to the pool.
    pub async fn release_worker(&self, mut worker: S::Worker) {
        let pid = worker.pid();
        self.pool().release(pid);
        self.owners().remove(&pid);

        worker.terminate().await;
        self.pool().forget(pid);
        tracing::debug!(pid, "worker released");
        self.wake.notify_one();
    }

    fn notify_owner(&self, pid: u32) {
        let owner = self.owners().remove(&pid);
        if let Some(owner) = owner {
            // The broker may already be gone.
            let _ = owner.send(WorkerDeath { pid });
        }
    }

    fn mark_spawner_down(&self) {
        if !self.spawner_down.send_replace(true) {
            tracing::error!("spawner is down; no further documents can be opened");
        }
    }

    fn is_spawner_down(&self) -> bool {
        *self.spawner_down.borrow()
    }

    /// Whether the spawner was launched and is still running.
    pub fn is_spawner_alive(&self) -> bool {
        self.launched.load(Ordering::Acquire)
            && !self.is_spawner_down()
            && self.spawner.spawner_health() == Health::Alive
    }

    /// Flips to `true` once the spawner is down.
    pub fn spawner_down_signal(&self) -> watch::Receiver<bool> {
        self.spawner_down.subscribe()
    }

    /// Current pool figures.
    pub fn stats(&self) -> PoolStats {
        let pool = self.pool();
        PoolStats {
            idle: pool.idle_count(),
            in_flight: pool.in_flight(),
            tracked: pool.worker_count(),
            failures: pool.consecutive_failures(),
        }
    }

    fn pool(&self) -> MutexGuard<'_, PoolState<S::Worker, E::Instant>> {
        #[allow(clippy::expect_used)]
        self.pool.lock().expect("invariant: pool mutex is never poisoned")
    }

    fn owners(&self) -> MutexGuard<'_, HashMap<u32, oneshot::Sender<WorkerDeath>>> {
        #[allow(clippy::expect_used)]
        self.owners.lock().expect("invariant: owners mutex is never poisoned")
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use cowrite_core::{SandboxRoots, ServiceConfig};

    use super::*;
    use crate::{
        system_env::SystemEnv,
        worker::{MemorySpawner, MemoryWorkerControl},
    };

    fn context(warm: usize) -> Arc<ServiceContext> {
        let mut config = ServiceConfig::new(SandboxRoots::under("/srv/cowrite"));
        config.warm_pool_size = warm;
        config.maintain_interval = Duration::from_millis(10);
        config.spawn_timeout = Duration::from_millis(500);
        ServiceContext::new(config).unwrap()
    }

    fn supervisor(
        warm: usize,
    ) -> (Arc<WorkerSupervisor<MemorySpawner, SystemEnv>>, MemoryWorkerControl) {
        let control = MemoryWorkerControl::new();
        let spawner = MemorySpawner::new(control.clone());
        (WorkerSupervisor::new(context(warm), spawner, SystemEnv::new()), control)
    }

    async fn settle<F: Fn() -> bool>(condition: F) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !condition() {
            assert!(tokio::time::Instant::now() < deadline, "condition not reached");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    fn doc() -> DocumentId {
        DocumentId::new("/report.odt").unwrap()
    }

    #[tokio::test]
    async fn second_launch_is_a_no_op() {
        let (supervisor, _control) = supervisor(1);
        supervisor.spawn_spawner().await.unwrap();
        supervisor.spawn_spawner().await.unwrap();
        assert!(supervisor.is_spawner_alive());
    }

    #[tokio::test]
    async fn failed_launch_is_spawner_down() {
        let (supervisor, control) = supervisor(1);
        control.kill_spawner();

        assert_eq!(supervisor.spawn_spawner().await, Err(WorkerError::SpawnerDown));
        assert!(*supervisor.spawner_down_signal().borrow());
    }

    #[tokio::test]
    async fn fills_warm_pool() {
        let (supervisor, control) = supervisor(3);
        supervisor.spawn_spawner().await.unwrap();
        let _task = supervisor.start();

        settle(|| supervisor.stats().idle == 3).await;
        assert_eq!(control.spawned(), 3);
    }

    #[tokio::test]
    async fn request_waits_for_spawn_with_empty_pool() {
        let (supervisor, control) = supervisor(0);
        supervisor.spawn_spawner().await.unwrap();
        let _task = supervisor.start();

        let lease = supervisor.request_worker(&doc()).await.unwrap();
        assert_eq!(control.spawned(), 1);
        assert_eq!(supervisor.stats().tracked, 1);

        supervisor.release_worker(lease.worker).await;
        assert_eq!(control.terminated(), 1);
        assert_eq!(supervisor.stats().tracked, 0);
    }

    #[tokio::test]
    async fn request_times_out_without_spawner() {
        let (supervisor, _control) = supervisor(1);

        let err = supervisor.request_worker(&doc()).await.unwrap_err();
        assert!(matches!(err, BrokerError::WorkerUnavailable { .. }));
    }

    #[tokio::test]
    async fn dead_bound_worker_is_reported() {
        let (supervisor, control) = supervisor(1);
        supervisor.spawn_spawner().await.unwrap();
        let _task = supervisor.start();

        let lease = supervisor.request_worker(&doc()).await.unwrap();
        let pid = lease.worker.pid();
        control.kill(pid);

        let death = tokio::time::timeout(Duration::from_secs(2), lease.death).await.unwrap();
        assert_eq!(death, Ok(WorkerDeath { pid }));
    }

    #[tokio::test]
    async fn spawner_death_fails_requests_despite_idle_workers() {
        let (supervisor, control) = supervisor(2);
        supervisor.spawn_spawner().await.unwrap();
        let _task = supervisor.start();
        settle(|| supervisor.stats().idle == 2).await;

        control.kill_spawner();
        let mut signal = supervisor.spawner_down_signal();
        tokio::time::timeout(Duration::from_secs(2), signal.wait_for(|down| *down))
            .await
            .unwrap()
            .unwrap();

        let err = supervisor.request_worker(&doc()).await.unwrap_err();
        assert_eq!(err, BrokerError::SpawnerDown);
    }

    #[tokio::test]
    async fn spawn_failures_recover() {
        let (supervisor, control) = supervisor(1);
        control.fail_spawns(2);
        supervisor.spawn_spawner().await.unwrap();
        let _task = supervisor.start();

        settle(|| supervisor.stats().idle == 1).await;
        assert_eq!(supervisor.stats().failures, 0);
    }
}
