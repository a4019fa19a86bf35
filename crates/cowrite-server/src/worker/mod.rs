//! Worker backends.
//!
//! Implementations of the [`cowrite_core::WorkerSpawner`] capability. The
//! supervisor and brokers are generic over it, so tests run the whole master
//! against in-process workers while production uses child processes.

mod chaotic;
mod frame;
mod memory;
mod process;

pub use chaotic::ChaoticSpawner;
pub use frame::{FrameError, FrameKind, LENGTH_SIZE, MAX_BODY_SIZE, WorkerFrame};
pub use memory::{
    ForwardedEdit, MEMORY_ENGINE_VERSION, MemorySpawner, MemoryWorker, MemoryWorkerControl,
};
pub use process::{
    ProcessConfig, ProcessSpawner, ProcessWorker, SOCKET_ENV, SOCKET_FILE,
};
