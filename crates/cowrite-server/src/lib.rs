//! Cowrite document master.
//!
//! Tokio runtime for the [`cowrite_core`] state machines. One master process
//! multiplexes client sessions onto single-use worker processes, one worker
//! per open document.
//!
//! # Architecture
//!
//! The core decides, this crate executes. [`WorkerSupervisor`] runs the
//! [`PoolState`](cowrite_core::PoolState) decisions against a
//! [`WorkerSpawner`](cowrite_core::WorkerSpawner); each open document gets a
//! broker task driving a [`DocumentBroker`](cowrite_core::DocumentBroker)
//! against its worker. [`Master`] ties them together for the transport layer.
//!
//! # Components
//!
//! - [`Master`]: transport-facing facade (open, message, close)
//! - [`WorkerSupervisor`]: spawner launch, warm pool, heartbeats, reaping
//! - [`BrokerRegistry`]: at most one live broker per document
//! - [`BrokerHandle`]: command channel into one broker task
//! - [`ConnectionRegistry`]: session id to document and broker
//! - [`worker`]: in-memory, fault-injecting and child-process backends
//! - [`SystemEnv`]: production environment (system clock, Tokio timers)

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod broker;
mod brokers;
mod error;
mod master;
mod registry;
mod supervisor;
mod system_env;
pub mod worker;

pub use broker::{BrokerHandle, CloseFn, ReleaseFn, Teardown, spawn_broker};
pub use brokers::BrokerRegistry;
pub use error::ServerError;
pub use master::{Master, SessionHandle};
pub use registry::{ConnectionRegistry, SessionEntry};
pub use supervisor::{PoolStats, WorkerDeath, WorkerLease, WorkerSupervisor};
pub use system_env::SystemEnv;
