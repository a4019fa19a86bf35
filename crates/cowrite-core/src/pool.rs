//! Warm pool bookkeeping.
//!
//! [`PoolState`] decides; the supervisor executes. It tracks every worker the
//! supervisor knows about, the FIFO queue of idle workers, outstanding spawn
//! requests and the spawn backoff. All methods are synchronous and take the
//! current instant as an argument, so the supervisor can hold its lock only
//! for the duration of one call.
//!
//! # Invariants
//!
//! - `in_flight <= max_in_flight_spawns` at all times.
//! - Every idle worker has a record in state `Idle`.
//! - Records never go back to `Idle` once `Bound`: workers are single use.

use std::{
    collections::{HashMap, VecDeque},
    time::Duration,
};

use crate::{
    config::{ServiceConfig, SpawnBackoff},
    ids::DocumentId,
    worker::{Health, Worker, WorkerProbe, WorkerProcess, WorkerState},
};

/// A bound worker found dead while reaping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadBinding {
    /// Process id of the dead worker
    pub pid: u32,
    /// Document it was serving
    pub document: DocumentId,
}

/// Result of one reaping pass.
#[derive(Debug)]
pub struct Reaped<W> {
    /// Idle workers that died or went silent; terminate them
    pub retired: Vec<W>,
    /// Bound workers that died; notify their brokers
    pub dead_bindings: Vec<DeadBinding>,
}

impl<W> Reaped<W> {
    /// Whether the pass found nothing.
    pub fn is_empty(&self) -> bool {
        self.retired.is_empty() && self.dead_bindings.is_empty()
    }
}

/// Pure bookkeeping for the warm worker pool.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
#[derive(Debug)]
pub struct PoolState<W, I> {
    records: HashMap<u32, WorkerProcess<I>>,
    probes: HashMap<u32, WorkerProbe>,
    idle: VecDeque<W>,
    /// Idle workers temporarily out of the queue for a heartbeat
    checking: usize,
    in_flight: usize,
    failures: u32,
    backoff_until: Option<I>,
    target: usize,
    per_tick: usize,
    max_in_flight: usize,
    backoff: SpawnBackoff,
}

impl<W, I> PoolState<W, I>
where
    W: Worker,
    I: Copy + Ord + std::ops::Add<Duration, Output = I> + std::ops::Sub<Output = Duration>,
{
    /// Empty pool sized by `config`.
    pub fn new(config: &ServiceConfig) -> Self {
        Self {
            records: HashMap::new(),
            probes: HashMap::new(),
            idle: VecDeque::new(),
            checking: 0,
            in_flight: 0,
            failures: 0,
            backoff_until: None,
            target: config.warm_pool_size,
            per_tick: config.max_spawns_per_tick,
            max_in_flight: config.max_in_flight_spawns,
            backoff: config.spawn_backoff,
        }
    }

    /// Number of spawns to start now, already counted as in flight.
    ///
    /// Never exceeds the per-tick limit, never pushes the in-flight count
    /// past its limit, and is zero while backing off after failures.
    /// `extra_demand` adds callers waiting with an empty pool on top of the
    /// warm target.
    pub fn plan_spawns(&mut self, now: I, extra_demand: usize) -> usize {
        if self.backoff_until.is_some_and(|until| now < until) {
            return 0;
        }

        let target = self.target + extra_demand;
        let supply = self.idle.len() + self.checking + self.in_flight;
        let planned = target
            .saturating_sub(supply)
            .min(self.per_tick)
            .min(self.max_in_flight.saturating_sub(self.in_flight));

        self.in_flight += planned;
        planned
    }

    /// A planned spawn produced a worker. Resets the backoff.
    pub fn spawn_succeeded(&mut self, worker: W, now: I) {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.failures = 0;
        self.backoff_until = None;

        let pid = worker.pid();
        self.records.insert(pid, WorkerProcess {
            pid,
            state: WorkerState::Idle,
            bound_document: None,
            last_heartbeat: now,
        });
        self.probes.insert(pid, worker.probe());
        self.idle.push_back(worker);
    }

    /// A planned spawn failed. Returns the delay before the next attempt.
    pub fn spawn_failed(&mut self, now: I) -> Duration {
        self.in_flight = self.in_flight.saturating_sub(1);
        self.failures = self.failures.saturating_add(1);

        let delay = self.backoff.delay(self.failures);
        self.backoff_until = Some(now + delay);
        delay
    }

    /// Hand out the oldest live idle worker, bound to `document`.
    ///
    /// Dead workers found on the way are dropped along with their records.
    pub fn take_idle(&mut self, document: &DocumentId) -> Option<W> {
        while let Some(worker) = self.idle.pop_front() {
            let pid = worker.pid();
            if worker.health() == Health::Dead {
                self.forget(pid);
                continue;
            }

            if let Some(record) = self.records.get_mut(&pid) {
                record.state = WorkerState::Bound;
                record.bound_document = Some(document.clone());
            }
            return Some(worker);
        }
        None
    }

    /// A broker is done with worker `pid`; it is being terminated.
    pub fn release(&mut self, pid: u32) {
        if let Some(record) = self.records.get_mut(&pid) {
            record.state = WorkerState::Draining;
            record.bound_document = None;
        }
    }

    /// Drop every trace of worker `pid`.
    pub fn forget(&mut self, pid: u32) {
        self.records.remove(&pid);
        self.probes.remove(&pid);
    }

    /// Find workers that died or whose heartbeats went stale.
    ///
    /// Dead and stale idle workers are removed from the queue and returned
    /// for termination. Dead bound workers are returned so their brokers can
    /// be told. Records of everything found are dropped.
    pub fn reap(&mut self, now: I, heartbeat_timeout: Duration) -> Reaped<W> {
        let mut retired = Vec::new();
        let mut keep = VecDeque::with_capacity(self.idle.len());

        for worker in self.idle.drain(..) {
            let stale = self
                .records
                .get(&worker.pid())
                .is_some_and(|record| now - record.last_heartbeat > heartbeat_timeout);

            if stale || worker.health() == Health::Dead {
                retired.push(worker);
            } else {
                keep.push_back(worker);
            }
        }
        self.idle = keep;

        for worker in &retired {
            self.forget(worker.pid());
        }

        let mut dead_bindings = Vec::new();
        let mut dead_pids = Vec::new();
        for (pid, probe) in &self.probes {
            if probe.is_alive() {
                continue;
            }
            let Some(record) = self.records.get(pid) else { continue };
            match record.state {
                WorkerState::Bound => {
                    if let Some(document) = &record.bound_document {
                        dead_bindings.push(DeadBinding { pid: *pid, document: document.clone() });
                    }
                    dead_pids.push(*pid);
                },
                WorkerState::Draining | WorkerState::Dead => dead_pids.push(*pid),
                // Idle workers out for a heartbeat are settled by the ping.
                WorkerState::Idle => {},
            }
        }
        for pid in dead_pids {
            self.forget(pid);
        }

        Reaped { retired, dead_bindings }
    }

    /// Take idle workers whose last heartbeat is at least `interval` old.
    ///
    /// Each one must come back through [`Self::heartbeat_ok`] or
    /// [`Self::heartbeat_failed`].
    pub fn take_due_heartbeats(&mut self, now: I, interval: Duration) -> Vec<W> {
        let mut due = Vec::new();
        let mut keep = VecDeque::with_capacity(self.idle.len());

        for worker in self.idle.drain(..) {
            let is_due = self
                .records
                .get(&worker.pid())
                .is_some_and(|record| now - record.last_heartbeat >= interval);
            if is_due {
                due.push(worker);
            } else {
                keep.push_back(worker);
            }
        }

        self.idle = keep;
        self.checking += due.len();
        due
    }

    /// Heartbeat answered; the worker rejoins the back of the idle queue.
    pub fn heartbeat_ok(&mut self, worker: W, now: I) {
        self.checking = self.checking.saturating_sub(1);
        if let Some(record) = self.records.get_mut(&worker.pid()) {
            record.last_heartbeat = now;
        }
        self.idle.push_back(worker);
    }

    /// Heartbeat failed; the worker is dead to the pool.
    pub fn heartbeat_failed(&mut self, pid: u32) {
        self.checking = self.checking.saturating_sub(1);
        self.forget(pid);
    }

    /// Workers ready in the queue.
    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    /// Spawns outstanding.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    /// Workers with a record in any state.
    pub fn worker_count(&self) -> usize {
        self.records.len()
    }

    /// Consecutive spawn failures since the last success.
    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// Record for worker `pid`.
    pub fn record(&self, pid: u32) -> Option<&WorkerProcess<I>> {
        self.records.get(&pid)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use bytes::Bytes;

    use super::*;
    use crate::{
        config::SandboxRoots,
        error::WorkerError,
        ids::SessionId,
        worker::{LoadOutcome, WorkerLiveness, WorkerReply, liveness},
    };

    #[derive(Debug)]
    struct StubWorker {
        pid: u32,
        probe: WorkerProbe,
    }

    #[async_trait]
    impl Worker for StubWorker {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn probe(&self) -> WorkerProbe {
            self.probe.clone()
        }

        async fn bind(&mut self, _: &DocumentId) -> Result<LoadOutcome, WorkerError> {
            Ok(LoadOutcome::Loaded)
        }

        async fn join(&mut self, _: SessionId) -> Result<WorkerReply, WorkerError> {
            Ok(WorkerReply::default())
        }

        async fn leave(&mut self, _: SessionId) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn send(&mut self, _: SessionId, _: Bytes) -> Result<WorkerReply, WorkerError> {
            Ok(WorkerReply::default())
        }

        async fn flush(&mut self) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn ping(&mut self) -> Result<(), WorkerError> {
            Ok(())
        }

        async fn terminate(&mut self) {}
    }

    fn stub(pid: u32) -> (StubWorker, WorkerLiveness) {
        let (liveness, probe) = liveness();
        (StubWorker { pid, probe }, liveness)
    }

    fn pool(target: usize) -> PoolState<StubWorker, Duration> {
        let mut config = ServiceConfig::new(SandboxRoots::under("/srv/cowrite"));
        config.warm_pool_size = target;
        PoolState::new(&config)
    }

    fn at(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    fn doc() -> DocumentId {
        DocumentId::new("/report.odt").unwrap()
    }

    #[test]
    fn plan_respects_per_tick_and_in_flight_limits() {
        let mut pool = pool(10);

        assert_eq!(pool.plan_spawns(at(0), 0), 2);
        assert_eq!(pool.plan_spawns(at(1), 0), 2);
        assert_eq!(pool.in_flight(), 4);
        assert_eq!(pool.plan_spawns(at(2), 0), 0);

        let (worker, _live) = stub(1);
        pool.spawn_succeeded(worker, at(3));
        assert_eq!(pool.plan_spawns(at(4), 0), 1);
    }

    #[test]
    fn plan_counts_waiting_callers() {
        let mut pool = pool(0);
        assert_eq!(pool.plan_spawns(at(0), 0), 0);
        assert_eq!(pool.plan_spawns(at(0), 1), 1);
    }

    #[test]
    fn failures_back_off_until_success() {
        let mut pool = pool(1);

        assert_eq!(pool.plan_spawns(at(0), 0), 1);
        assert_eq!(pool.spawn_failed(at(0)), at(100));
        assert_eq!(pool.plan_spawns(at(50), 0), 0);

        assert_eq!(pool.plan_spawns(at(100), 0), 1);
        assert_eq!(pool.spawn_failed(at(100)), at(200));
        assert_eq!(pool.consecutive_failures(), 2);
        assert_eq!(pool.plan_spawns(at(299), 0), 0);

        assert_eq!(pool.plan_spawns(at(300), 0), 1);
        let (worker, _live) = stub(7);
        pool.spawn_succeeded(worker, at(310));
        assert_eq!(pool.consecutive_failures(), 0);
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn take_idle_is_fifo_and_binds() {
        let mut pool = pool(2);
        let (a, _la) = stub(1);
        let (b, _lb) = stub(2);
        pool.spawn_succeeded(a, at(0));
        pool.spawn_succeeded(b, at(0));

        let worker = pool.take_idle(&doc()).unwrap();
        assert_eq!(worker.pid(), 1);

        let record = pool.record(1).unwrap();
        assert_eq!(record.state, WorkerState::Bound);
        assert_eq!(record.bound_document, Some(doc()));
        assert_eq!(pool.idle_count(), 1);
    }

    #[test]
    fn take_idle_skips_dead_workers() {
        let mut pool = pool(2);
        let (a, la) = stub(1);
        let (b, _lb) = stub(2);
        pool.spawn_succeeded(a, at(0));
        pool.spawn_succeeded(b, at(0));

        la.mark_dead();
        assert_eq!(pool.take_idle(&doc()).unwrap().pid(), 2);
        assert!(pool.record(1).is_none());
        assert!(pool.take_idle(&doc()).is_none());
    }

    #[test]
    fn reap_reports_dead_bindings_once() {
        let mut pool = pool(1);
        let (a, la) = stub(1);
        pool.spawn_succeeded(a, at(0));
        let _bound = pool.take_idle(&doc()).unwrap();

        la.mark_dead();
        let reaped = pool.reap(at(10), Duration::from_secs(30));
        assert_eq!(reaped.dead_bindings, vec![DeadBinding { pid: 1, document: doc() }]);
        assert_eq!(pool.worker_count(), 0);

        assert!(pool.reap(at(20), Duration::from_secs(30)).is_empty());
    }

    #[test]
    fn reap_retires_stale_idle_workers() {
        let mut pool = pool(1);
        let (a, _la) = stub(1);
        pool.spawn_succeeded(a, at(0));

        assert!(pool.reap(at(30_000), Duration::from_secs(30)).is_empty());

        let reaped = pool.reap(at(30_001), Duration::from_secs(30));
        assert_eq!(reaped.retired.len(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.worker_count(), 0);
    }

    #[test]
    fn heartbeats_cycle_through_checking() {
        let mut pool = pool(2);
        let (a, _la) = stub(1);
        let (b, _lb) = stub(2);
        pool.spawn_succeeded(a, at(0));
        pool.spawn_succeeded(b, at(5_000));

        let due = pool.take_due_heartbeats(at(10_000), Duration::from_secs(10));
        assert_eq!(due.iter().map(Worker::pid).collect::<Vec<_>>(), vec![1]);
        assert_eq!(pool.idle_count(), 1);

        // A worker out for a heartbeat still counts toward the warm target.
        assert_eq!(pool.plan_spawns(at(10_000), 0), 0);

        for worker in due {
            pool.heartbeat_ok(worker, at(10_010));
        }
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.record(1).unwrap().last_heartbeat, at(10_010));

        let due = pool.take_due_heartbeats(at(15_000), Duration::from_secs(10));
        assert_eq!(due.len(), 1);
        pool.heartbeat_failed(due[0].pid());
        assert_eq!(pool.worker_count(), 1);
        assert_eq!(pool.plan_spawns(at(15_000), 0), 1);
    }

    #[test]
    fn release_moves_record_to_draining() {
        let mut pool = pool(1);
        let (a, _la) = stub(3);
        pool.spawn_succeeded(a, at(0));
        let _worker = pool.take_idle(&doc()).unwrap();

        pool.release(3);
        let record = pool.record(3).unwrap();
        assert_eq!(record.state, WorkerState::Draining);
        assert_eq!(record.bound_document, None);

        pool.forget(3);
        assert_eq!(pool.worker_count(), 0);
    }
}
