//! Cowrite core.
//!
//! Sans-IO logic for a collaborative document master: one long-lived master
//! process multiplexes many client sessions onto sandboxed, single-use worker
//! processes, one worker per open document.
//!
//! # Architecture
//!
//! Nothing in this crate performs I/O or reads the clock. The state machines
//! take inputs (commands, worker outcomes, instants) and return actions for a
//! runtime to execute. The `cowrite-server` crate is that runtime.
//!
//! # Components
//!
//! - [`DocumentBroker`]: per-document state machine; sequences edits and fans
//!   out deltas
//! - [`PoolState`]: warm pool bookkeeping and spawn planning
//! - [`Worker`] / [`WorkerSpawner`]: capability boundary toward worker
//!   processes
//! - [`ServiceContext`]: process-scoped configuration, counters and id
//!   allocation
//! - [`Accounting`]: live broker and connection counters with RAII guards

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod accounting;
pub mod broker;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod ids;
pub mod pool;
pub mod worker;

pub use accounting::{Accounting, Counter, CounterGuard};
pub use broker::{
    BrokerAction, BrokerState, DocumentBroker, EditAck, LogLevel, Session, SessionEvent,
};
pub use config::{EchoPolicy, SandboxRoots, ServiceConfig, SpawnBackoff, resolve_value};
pub use context::{Diagnostics, ServiceContext};
pub use env::Environment;
pub use error::{BrokerError, ConfigError, IdError, WorkerError};
pub use ids::{BrokerId, ConnectionId, DocumentId, SessionId, SessionIdAllocator};
pub use pool::{DeadBinding, PoolState, Reaped};
pub use worker::{
    Health, LoadOutcome, Worker, WorkerLiveness, WorkerProbe, WorkerProcess, WorkerReply,
    WorkerSpawner, WorkerState, liveness,
};
