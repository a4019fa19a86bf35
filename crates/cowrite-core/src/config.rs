//! Resolved service configuration.
//!
//! Everything here arrives already parsed and resolved: paths are absolute,
//! durations are typed. Reading config files, applying command-line overrides
//! and turning relative paths into absolute ones happen outside the core.
//! The only lookup rule the core knows is [`resolve_value`].

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::ConfigError;

/// Default number of idle workers kept warm.
pub const DEFAULT_WARM_POOL_SIZE: usize = 1;

/// Default time to wait for a worker to become available.
pub const DEFAULT_SPAWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default deadline for one worker round trip (join, edit, leave, ping).
pub const DEFAULT_ROUND_TRIP_TIMEOUT: Duration = Duration::from_secs(5);

/// Default deadline for the worker to load a document.
pub const DEFAULT_LOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for flushing a document before unload.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Default period of the pool maintenance loop.
pub const DEFAULT_MAINTAIN_INTERVAL: Duration = Duration::from_millis(250);

/// Default interval between heartbeats to idle workers.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Default silence after which an idle worker is considered dead.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);

/// Pick `primary` when present, otherwise `default`.
///
/// The single fallback rule used when layering command-line overrides on top
/// of built-in defaults.
pub fn resolve_value<T>(primary: Option<T>, default: T) -> T {
    primary.unwrap_or(default)
}

/// Whether the sender of an edit also receives the resulting deltas as
/// broadcasts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EchoPolicy {
    /// Sender gets deltas only through its edit acknowledgment
    #[default]
    ExcludeSender,
    /// Sender also receives every delta as a broadcast
    IncludeSender,
}

/// Exponential backoff between failed spawn attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpawnBackoff {
    /// Delay after the first failure
    pub first: Duration,
    /// Upper bound on any delay
    pub max: Duration,
    /// Growth factor per consecutive failure
    pub factor: f64,
}

impl Default for SpawnBackoff {
    fn default() -> Self {
        Self { first: Duration::from_millis(100), max: Duration::from_secs(10), factor: 2.0 }
    }
}

impl SpawnBackoff {
    /// Delay after `failures` consecutive failures (1-based).
    ///
    /// `first * factor^(failures - 1)`, clamped to `max`. Zero failures means
    /// no delay.
    pub fn delay(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }

        let exponent = (failures - 1).min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

/// Sandbox directories handed to the spawner and its workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxRoots {
    /// Root under which each worker gets its own jail
    pub child_root: PathBuf,
    /// System template copied or linked into each jail
    pub sys_template: PathBuf,
    /// Rendering engine installation template
    pub engine_template: PathBuf,
    /// Shared tile/render cache
    pub cache: PathBuf,
}

impl SandboxRoots {
    /// Conventional layout below one base directory.
    pub fn under(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self {
            child_root: base.join("jails"),
            sys_template: base.join("systemplate"),
            engine_template: base.join("enginetemplate"),
            cache: base.join("cache"),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (field, path) in [
            ("sandbox.child_root", &self.child_root),
            ("sandbox.sys_template", &self.sys_template),
            ("sandbox.engine_template", &self.engine_template),
            ("sandbox.cache", &self.cache),
        ] {
            if !path.is_absolute() {
                return Err(ConfigError::RelativePath {
                    field,
                    path: path.display().to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Fully resolved configuration consumed by the master.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceConfig {
    /// Idle workers the supervisor keeps ready
    pub warm_pool_size: usize,
    /// How long an open waits for a worker
    pub spawn_timeout: Duration,
    /// Deadline for join, edit, leave and ping round trips
    pub round_trip_timeout: Duration,
    /// Deadline for loading a document into a fresh worker
    pub load_timeout: Duration,
    /// Deadline for the flush issued before unload
    pub flush_timeout: Duration,
    /// Period of the pool maintenance loop
    pub maintain_interval: Duration,
    /// Interval between heartbeats to idle workers
    pub heartbeat_interval: Duration,
    /// Silence after which an idle worker is reaped
    pub heartbeat_timeout: Duration,
    /// Spawns started per maintenance tick
    pub max_spawns_per_tick: usize,
    /// Spawns outstanding at once
    pub max_in_flight_spawns: usize,
    /// Backoff between failed spawns
    pub spawn_backoff: SpawnBackoff,
    /// Commands queued per broker before senders wait
    pub broker_queue_depth: usize,
    /// Echo contract for edit deltas
    pub echo_policy: EchoPolicy,
    /// Sandbox directories
    pub sandbox: SandboxRoots,
    /// Public server name, if configured
    pub server_name: Option<String>,
    /// Root of the static file server, if configured
    pub file_server_root: Option<PathBuf>,
    /// Whether client transport is encrypted
    pub ssl_enabled: bool,
}

impl ServiceConfig {
    /// Configuration with defaults for everything but the sandbox.
    pub fn new(sandbox: SandboxRoots) -> Self {
        Self {
            warm_pool_size: DEFAULT_WARM_POOL_SIZE,
            spawn_timeout: DEFAULT_SPAWN_TIMEOUT,
            round_trip_timeout: DEFAULT_ROUND_TRIP_TIMEOUT,
            load_timeout: DEFAULT_LOAD_TIMEOUT,
            flush_timeout: DEFAULT_FLUSH_TIMEOUT,
            maintain_interval: DEFAULT_MAINTAIN_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
            max_spawns_per_tick: 2,
            max_in_flight_spawns: 4,
            spawn_backoff: SpawnBackoff::default(),
            broker_queue_depth: 256,
            echo_policy: EchoPolicy::default(),
            sandbox,
            server_name: None,
            file_server_root: None,
            ssl_enabled: false,
        }
    }

    /// Reject values the supervisor or brokers cannot work with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("spawn_timeout", self.spawn_timeout),
            ("round_trip_timeout", self.round_trip_timeout),
            ("load_timeout", self.load_timeout),
            ("flush_timeout", self.flush_timeout),
            ("maintain_interval", self.maintain_interval),
            ("heartbeat_interval", self.heartbeat_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field });
            }
        }

        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(ConfigError::HeartbeatWindow {
                interval: self.heartbeat_interval,
                timeout: self.heartbeat_timeout,
            });
        }

        for (field, value) in [
            ("max_spawns_per_tick", self.max_spawns_per_tick),
            ("max_in_flight_spawns", self.max_in_flight_spawns),
            ("broker_queue_depth", self.broker_queue_depth),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroLimit { field });
            }
        }

        if self.spawn_backoff.factor.is_nan() || self.spawn_backoff.factor < 1.0 {
            return Err(ConfigError::BackoffFactor(self.spawn_backoff.factor));
        }

        self.sandbox.validate()
    }
}
