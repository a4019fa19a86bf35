//! Shared fixtures for master tests.

#![allow(dead_code)]

use std::time::Duration;

use cowrite_core::{SandboxRoots, ServiceConfig, ServiceContext, SessionEvent};
use cowrite_server::{
    Master, SessionHandle,
    worker::{MemorySpawner, MemoryWorkerControl},
};

/// How long any single wait in a test may take.
pub const PATIENCE: Duration = Duration::from_secs(3);

/// Configuration with timings short enough for tests.
pub fn fast_config(warm_pool_size: usize) -> ServiceConfig {
    let mut config = ServiceConfig::new(SandboxRoots::under("/srv/cowrite"));
    config.warm_pool_size = warm_pool_size;
    config.maintain_interval = Duration::from_millis(10);
    config.spawn_timeout = Duration::from_secs(1);
    config.round_trip_timeout = Duration::from_millis(200);
    config.load_timeout = Duration::from_millis(500);
    config.flush_timeout = Duration::from_millis(200);
    config.heartbeat_interval = Duration::from_millis(50);
    config.heartbeat_timeout = Duration::from_millis(500);
    config
}

/// Started master on in-memory workers.
pub async fn start_master(config: ServiceConfig) -> (Master<MemorySpawner>, MemoryWorkerControl) {
    let control = MemoryWorkerControl::new();
    let ctx = ServiceContext::new(config).unwrap();
    let master = Master::new(ctx, MemorySpawner::new(control.clone()));
    master.start().await.unwrap();
    (master, control)
}

/// Poll `condition` until it holds.
pub async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = tokio::time::Instant::now() + PATIENCE;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Next event on a session, failing the test if none arrives.
pub async fn next_event(session: &mut SessionHandle) -> SessionEvent {
    tokio::time::timeout(PATIENCE, session.events.recv())
        .await
        .expect("no session event in time")
        .expect("session channel closed")
}
