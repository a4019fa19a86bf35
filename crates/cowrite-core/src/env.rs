//! Environment abstraction for time.
//!
//! The pool bookkeeping and the broker state machine never read the clock
//! themselves. The runtime passes instants in, which keeps the core
//! deterministic under test and lets simulations substitute virtual time.

use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

/// Abstract environment providing monotonic time and sleeping.
///
/// # Invariants
///
/// - `now()` never goes backwards within one process.
/// - `sleep()` is only awaited by runtime code (supervisor loops), never by
///   the pure state machines in this crate.
pub trait Environment: Clone + Send + Sync + 'static {
    /// Instant type used by this environment.
    ///
    /// Production uses `std::time::Instant`. Tests may use any monotonic
    /// type that supports adding and subtracting durations.
    type Instant: Copy
        + Ord
        + Debug
        + Send
        + Sync
        + Sub<Output = Duration>
        + Add<Duration, Output = Self::Instant>;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;
}
