//! Server error types.

use std::fmt;

use cowrite_core::{BrokerError, ConfigError, WorkerError};

/// Errors that end the server process.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration rejected at startup.
    ///
    /// Fatal. Fix the configuration and restart.
    Config(ConfigError),

    /// The spawner could not be launched or died.
    ///
    /// Fatal: no further workers can be created, so no document can be
    /// opened.
    SpawnerDown,

    /// Worker backend failure outside any single document.
    Worker(WorkerError),

    /// Document-level failure surfaced at the top level.
    Broker(BrokerError),

    /// I/O error (socket directory, current directory, signals).
    Io(std::io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "configuration error: {err}"),
            Self::SpawnerDown => write!(f, "spawner is down; no documents can be opened"),
            Self::Worker(err) => write!(f, "worker backend error: {err}"),
            Self::Broker(err) => write!(f, "broker error: {err}"),
            Self::Io(err) => write!(f, "i/o error: {err}"),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Worker(err) => Some(err),
            Self::Broker(err) => Some(err),
            Self::Io(err) => Some(err),
            Self::SpawnerDown => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<WorkerError> for ServerError {
    fn from(err: WorkerError) -> Self {
        match err {
            WorkerError::SpawnerDown => Self::SpawnerDown,
            other => Self::Worker(other),
        }
    }
}

impl From<BrokerError> for ServerError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::SpawnerDown => Self::SpawnerDown,
            other => Self::Broker(other),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}
