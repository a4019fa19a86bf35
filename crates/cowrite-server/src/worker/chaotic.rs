//! Fault-injecting spawner.
//!
//! Wraps another spawner and fails a seeded, reproducible share of spawn
//! requests with `SpawnFailed`. The spawner itself stays healthy, so this
//! exercises the supervisor's backoff and replenishment without ever taking
//! the service down.

#![allow(clippy::disallowed_types, reason = "Locking simple RNG state")]

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use cowrite_core::{Health, WorkerError, WorkerSpawner};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Seed used by [`ChaoticSpawner::new`].
const DEFAULT_SEED: u64 = 0x00c0_ffee;

/// Spawner that randomly fails spawn requests.
///
/// Clones share the wrapped spawner, the RNG and the counters.
pub struct ChaoticSpawner<S> {
    inner: Arc<S>,
    failure_rate: f64,
    rng: Arc<Mutex<ChaCha8Rng>>,
    attempts: Arc<AtomicUsize>,
    injected: Arc<AtomicUsize>,
}

impl<S> Clone for ChaoticSpawner<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            failure_rate: self.failure_rate,
            rng: Arc::clone(&self.rng),
            attempts: Arc::clone(&self.attempts),
            injected: Arc::clone(&self.injected),
        }
    }
}

impl<S: WorkerSpawner> ChaoticSpawner<S> {
    /// Wrap `inner`, failing spawns with probability `failure_rate`.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn new(inner: S, failure_rate: f64) -> Self {
        Self::with_seed(inner, failure_rate, DEFAULT_SEED)
    }

    /// Same as [`Self::new`] with an explicit seed.
    ///
    /// # Panics
    ///
    /// Panics if `failure_rate` is not in [0.0, 1.0]
    pub fn with_seed(inner: S, failure_rate: f64, seed: u64) -> Self {
        assert!(
            (0.0..=1.0).contains(&failure_rate),
            "failure_rate must be between 0.0 and 1.0, got {failure_rate}"
        );

        Self {
            inner: Arc::new(inner),
            failure_rate,
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            attempts: Arc::new(AtomicUsize::new(0)),
            injected: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Underlying spawner.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Spawn requests seen so far.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::Acquire)
    }

    /// Spawn requests failed by injection so far.
    pub fn injected_failures(&self) -> usize {
        self.injected.load(Ordering::Acquire)
    }

    fn should_fail(&self) -> bool {
        #[allow(clippy::expect_used)]
        let mut rng = self.rng.lock().expect("invariant: chaos rng mutex is never poisoned");
        rng.gen_bool(self.failure_rate)
    }
}

#[async_trait]
impl<S: WorkerSpawner> WorkerSpawner for ChaoticSpawner<S> {
    type Worker = S::Worker;

    async fn launch(&self) -> Result<(), WorkerError> {
        self.inner.launch().await
    }

    fn spawner_health(&self) -> Health {
        self.inner.spawner_health()
    }

    async fn spawn(&self) -> Result<S::Worker, WorkerError> {
        self.attempts.fetch_add(1, Ordering::AcqRel);
        if self.should_fail() {
            self.injected.fetch_add(1, Ordering::AcqRel);
            return Err(WorkerError::SpawnFailed("chaotic failure injection".to_string()));
        }
        self.inner.spawn().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::memory::{MemorySpawner, MemoryWorkerControl};

    async fn outcomes(seed: u64, rate: f64, n: usize) -> Vec<bool> {
        let spawner = ChaoticSpawner::with_seed(
            MemorySpawner::new(MemoryWorkerControl::new()),
            rate,
            seed,
        );
        spawner.launch().await.unwrap();

        let mut results = Vec::with_capacity(n);
        for _ in 0..n {
            results.push(spawner.spawn().await.is_ok());
        }
        results
    }

    #[tokio::test]
    async fn same_seed_same_failures() {
        assert_eq!(outcomes(7, 0.5, 32).await, outcomes(7, 0.5, 32).await);
    }

    #[tokio::test]
    async fn rate_bounds_are_exact() {
        assert!(outcomes(1, 0.0, 16).await.into_iter().all(|ok| ok));
        assert!(outcomes(1, 1.0, 16).await.into_iter().all(|ok| !ok));
    }

    #[tokio::test]
    async fn counts_attempts_and_injections() {
        let spawner = ChaoticSpawner::with_seed(
            MemorySpawner::new(MemoryWorkerControl::new()),
            0.5,
            99,
        );
        spawner.launch().await.unwrap();

        let mut failures = 0;
        for _ in 0..20 {
            if spawner.spawn().await.is_err() {
                failures += 1;
            }
        }

        assert_eq!(spawner.attempts(), 20);
        assert_eq!(spawner.injected_failures(), failures);
        assert_eq!(spawner.inner().control().spawned(), 20 - failures);
    }

    #[test]
    #[should_panic(expected = "failure_rate must be between")]
    fn rejects_out_of_range_rate() {
        let _ = ChaoticSpawner::new(MemorySpawner::new(MemoryWorkerControl::new()), 1.5);
    }
}
