//! Process-scoped service context.
//!
//! Built once at startup and shared by `Arc`: the resolved configuration,
//! the live counters, the session id allocator and a few values that are
//! fixed the first time they are observed. Components receive it explicitly
//! instead of reaching for globals.

use std::{
    fmt,
    sync::{
        Arc, OnceLock,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::{
    accounting::Accounting,
    config::ServiceConfig,
    error::ConfigError,
    ids::{BrokerId, ConnectionId, SessionId, SessionIdAllocator},
};

/// State shared by every component of one master process.
#[derive(Debug)]
pub struct ServiceContext {
    config: ServiceConfig,
    accounting: Arc<Accounting>,
    session_ids: SessionIdAllocator,
    next_broker: AtomicU64,
    next_connection: AtomicU64,
    engine_version: OnceLock<String>,
}

impl ServiceContext {
    /// Validate `config` and build the context.
    pub fn new(config: ServiceConfig) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        Ok(Arc::new(Self {
            config,
            accounting: Accounting::new(),
            session_ids: SessionIdAllocator::new(),
            next_broker: AtomicU64::new(0),
            next_connection: AtomicU64::new(0),
            engine_version: OnceLock::new(),
        }))
    }

    /// Resolved configuration.
    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Live counters.
    pub fn accounting(&self) -> &Arc<Accounting> {
        &self.accounting
    }

    /// Issue a fresh session id.
    pub fn next_session_id(&self) -> SessionId {
        self.session_ids.next_session_id()
    }

    /// Issue a fresh broker generation id.
    pub fn next_broker_id(&self) -> BrokerId {
        BrokerId::from_raw(self.next_broker.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Issue a fresh connection id.
    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId::from_raw(self.next_connection.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Whether client transport is encrypted. Fixed for the process lifetime.
    pub fn is_ssl_enabled(&self) -> bool {
        self.config.ssl_enabled
    }

    /// Record the rendering engine version. Only the first report sticks;
    /// returns whether this call set it.
    pub fn record_engine_version(&self, version: &str) -> bool {
        self.engine_version.set(version.to_string()).is_ok()
    }

    /// Engine version reported by the first worker, if any worker reported one.
    pub fn engine_version(&self) -> Option<&str> {
        self.engine_version.get().map(String::as_str)
    }
}

/// Read-only snapshot of the master's vital signs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostics {
    /// Live document brokers
    pub num_doc_brokers: usize,
    /// Live client connections
    pub num_connections: usize,
    /// Workers waiting in the warm pool
    pub idle_workers: usize,
    /// Spawn requests outstanding
    pub spawns_in_flight: usize,
    /// Workers the supervisor is tracking in any state
    pub tracked_workers: usize,
    /// Whether the spawner is running
    pub spawner_alive: bool,
    /// Engine version reported by workers
    pub engine_version: Option<String>,
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "brokers={} connections={} idle={} spawning={} tracked={} spawner={} engine={}",
            self.num_doc_brokers,
            self.num_connections,
            self.idle_workers,
            self.spawns_in_flight,
            self.tracked_workers,
            if self.spawner_alive { "up" } else { "down" },
            self.engine_version.as_deref().unwrap_or("unknown"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxRoots;

    fn context() -> Arc<ServiceContext> {
        ServiceContext::new(ServiceConfig::new(SandboxRoots::under("/srv/cowrite"))).unwrap()
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = ServiceConfig::new(SandboxRoots::under("/srv/cowrite"));
        config.broker_queue_depth = 0;
        assert!(ServiceContext::new(config).is_err());
    }

    #[test]
    fn engine_version_is_set_once() {
        let ctx = context();
        assert_eq!(ctx.engine_version(), None);

        assert!(ctx.record_engine_version("24.2.1"));
        assert!(!ctx.record_engine_version("25.0.0"));
        assert_eq!(ctx.engine_version(), Some("24.2.1"));
    }

    #[test]
    fn broker_and_connection_ids_are_distinct() {
        let ctx = context();
        assert_ne!(ctx.next_broker_id(), ctx.next_broker_id());
        assert_ne!(ctx.next_connection_id(), ctx.next_connection_id());
    }

    #[test]
    fn diagnostics_render_on_one_line() {
        let diagnostics = Diagnostics {
            num_doc_brokers: 2,
            num_connections: 5,
            idle_workers: 1,
            spawns_in_flight: 0,
            tracked_workers: 3,
            spawner_alive: true,
            engine_version: None,
        };

        insta::assert_snapshot!(
            diagnostics,
            @"brokers=2 connections=5 idle=1 spawning=0 tracked=3 spawner=up engine=unknown"
        );
    }
}
