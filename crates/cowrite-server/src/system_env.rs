//! Clock for the running master.
//!
//! `SystemEnv` reads the monotonic clock and sleeps on the Tokio timer.
//! Behavior is therefore tied to wall-clock progress; tests that need
//! determinism drive the core state machines with their own instants.

use std::time::Duration;

use cowrite_core::Environment;

/// Monotonic clock plus the Tokio timer.
#[derive(Debug, Clone, Default)]
pub struct SystemEnv;

impl SystemEnv {
    /// The system clock.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Environment for SystemEnv {
    type Instant = std::time::Instant;

    #[allow(clippy::disallowed_methods)]
    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleep_advances_the_clock() {
        let env = SystemEnv::new();

        let start = env.now();
        env.sleep(Duration::from_millis(20)).await;

        assert!(env.now() - start >= Duration::from_millis(20));
    }

    #[test]
    fn instants_support_deadline_arithmetic() {
        let env = SystemEnv::new();
        let now = env.now();
        let deadline = now + Duration::from_secs(5);

        assert!(deadline > now);
        assert_eq!(deadline - now, Duration::from_secs(5));
    }
}
