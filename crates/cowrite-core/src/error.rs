//! Error types for the cowrite core.
//!
//! Errors are split by layer: identifier parsing ([`IdError`]), the worker
//! capability boundary ([`WorkerError`]), configuration validation
//! ([`ConfigError`]) and everything a document broker or its registry can
//! report to a session ([`BrokerError`]).
//!
//! All of them are `Clone` because a single broker failure is fanned out to
//! every waiting session.

use std::time::Duration;

use thiserror::Error;

use crate::{
    broker::BrokerState,
    ids::{DocumentId, SessionId},
};

/// Errors from parsing or normalizing identifiers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    /// Document identity is empty once normalized
    #[error("document id {raw:?} is empty after normalization")]
    EmptyDocumentId {
        /// Identity as supplied by the caller
        raw: String,
    },

    /// Text is not a session id produced by this process
    #[error("malformed session id {0:?}")]
    MalformedSessionId(String),
}

/// Errors raised at the worker capability boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// The spawner process is gone; no further workers can be created
    #[error("spawner is down")]
    SpawnerDown,

    /// A single spawn request failed; the spawner itself is still alive
    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    /// The worker process exited or its channel closed
    #[error("worker {pid} died")]
    Died {
        /// Process id of the dead worker
        pid: u32,
    },

    /// The worker sent something that does not fit the IPC contract
    #[error("worker protocol violation: {0}")]
    Protocol(String),

    /// I/O failure on the worker channel
    #[error("worker i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for WorkerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Configuration rejected by [`crate::config::ServiceConfig::validate`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A timeout or interval was zero
    #[error("{field} must be non-zero")]
    ZeroDuration {
        /// Name of the offending field
        field: &'static str,
    },

    /// A count that bounds concurrency was zero
    #[error("{field} must be at least 1")]
    ZeroLimit {
        /// Name of the offending field
        field: &'static str,
    },

    /// Sandbox paths must arrive already resolved
    #[error("{field} must be an absolute path, got {path}")]
    RelativePath {
        /// Name of the offending field
        field: &'static str,
        /// The relative path that was supplied
        path: String,
    },

    /// Heartbeat timeout would expire before the next heartbeat is sent
    #[error("heartbeat timeout {timeout:?} must exceed heartbeat interval {interval:?}")]
    HeartbeatWindow {
        /// Configured interval
        interval: Duration,
        /// Configured timeout
        timeout: Duration,
    },

    /// Backoff factor below 1.0 would shrink delays after failures
    #[error("spawn backoff factor must be >= 1.0, got {0}")]
    BackoffFactor(f64),
}

/// Errors a document broker, the registry or the supervisor report to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Pool exhausted or spawner busy; retry after backoff
    #[error("no worker became available within {waited:?}")]
    WorkerUnavailable {
        /// How long the caller waited
        waited: Duration,
    },

    /// A worker round trip exceeded its deadline
    #[error("worker {pid} did not answer {operation} within {deadline:?}")]
    WorkerTimeout {
        /// Worker that stalled
        pid: u32,
        /// Round trip that timed out
        operation: &'static str,
        /// Deadline that was exceeded
        deadline: Duration,
    },

    /// The worker refused to open the document
    #[error("worker refused to load {document}: {reason}")]
    DocumentLoadFailed {
        /// Document that failed to load
        document: DocumentId,
        /// Reason given by the worker
        reason: String,
    },

    /// Two live brokers for one document. Prevented by the registry's slot
    /// map; only reported by debug assertions.
    #[error("duplicate broker for {0}")]
    DuplicateBrokerRace(DocumentId),

    /// The spawner died; the service cannot open documents anymore
    #[error("spawner is down")]
    SpawnerDown,

    /// The bound worker exited
    #[error("worker {pid} died")]
    WorkerDied {
        /// Process id of the dead worker
        pid: u32,
    },

    /// Operation is not valid in the broker's current state
    #[error("cannot {operation} while broker is {state:?}")]
    InvalidState {
        /// Current broker state
        state: BrokerState,
        /// Operation that was attempted
        operation: &'static str,
    },

    /// Session is not known to the broker or the master
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    /// Broker is unloading; open the document again for a fresh broker
    #[error("broker for {0} is closing")]
    BrokerClosing(DocumentId),

    /// Document identity could not be normalized
    #[error("invalid document id: {0}")]
    InvalidDocumentId(#[from] IdError),

    /// Other failure on the worker channel
    #[error("worker transport error: {0}")]
    Transport(WorkerError),
}

impl BrokerError {
    /// Whether the caller may retry the same request after backing off.
    ///
    /// Timeouts and worker deaths are not retryable: edits are not safely
    /// replayable, so the broker has already failed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::WorkerUnavailable { .. } | Self::BrokerClosing(_))
    }

    /// Whether this error means the whole service can no longer open documents.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SpawnerDown)
    }
}

impl From<WorkerError> for BrokerError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::SpawnerDown => Self::SpawnerDown,
            WorkerError::Died { pid } => Self::WorkerDied { pid },
            other => Self::Transport(other),
        }
    }
}
