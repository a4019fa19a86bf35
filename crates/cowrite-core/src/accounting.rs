//! Process-wide live counters.
//!
//! `NumDocBrokers` and `NumConnections` must always equal the number of live
//! brokers and connections. Instead of pairing every increment with a manual
//! decrement, an increment hands back a [`CounterGuard`] that performs the
//! single matching decrement when dropped. Whoever owns the entity owns the
//! guard, so double decrements and leaks are ruled out structurally.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

/// Which counter a guard belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Live document brokers
    DocBrokers,
    /// Live client connections
    Connections,
}

/// Live entity counters shared across the process.
#[derive(Debug, Default)]
pub struct Accounting {
    doc_brokers: AtomicUsize,
    connections: AtomicUsize,
}

impl Accounting {
    /// Create counters at zero.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Count a new broker. Drop the guard when the broker is destroyed.
    pub fn broker_opened(self: &Arc<Self>) -> CounterGuard {
        self.increment(Counter::DocBrokers)
    }

    /// Count a new connection. Drop the guard when the connection closes.
    pub fn connection_opened(self: &Arc<Self>) -> CounterGuard {
        self.increment(Counter::Connections)
    }

    /// Current number of live brokers.
    pub fn num_doc_brokers(&self) -> usize {
        self.doc_brokers.load(Ordering::Acquire)
    }

    /// Current number of live connections.
    pub fn num_connections(&self) -> usize {
        self.connections.load(Ordering::Acquire)
    }

    fn cell(&self, counter: Counter) -> &AtomicUsize {
        match counter {
            Counter::DocBrokers => &self.doc_brokers,
            Counter::Connections => &self.connections,
        }
    }

    fn increment(self: &Arc<Self>, counter: Counter) -> CounterGuard {
        self.cell(counter).fetch_add(1, Ordering::AcqRel);
        CounterGuard { accounting: Arc::clone(self), counter }
    }

    fn decrement(&self, counter: Counter) {
        let result = self.cell(counter).fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            n.checked_sub(1)
        });
        debug_assert!(result.is_ok(), "{counter:?} counter would go negative");
    }
}

/// Holds one unit of a counter; releases it on drop.
#[derive(Debug)]
#[must_use = "dropping the guard immediately undoes the increment"]
pub struct CounterGuard {
    accounting: Arc<Accounting>,
    counter: Counter,
}

impl CounterGuard {
    /// Counter this guard holds.
    pub fn counter(&self) -> Counter {
        self.counter
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.accounting.decrement(self.counter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guards_track_live_entities() {
        let accounting = Accounting::new();

        let broker = accounting.broker_opened();
        let a = accounting.connection_opened();
        let b = accounting.connection_opened();
        assert_eq!(accounting.num_doc_brokers(), 1);
        assert_eq!(accounting.num_connections(), 2);

        drop(a);
        assert_eq!(accounting.num_connections(), 1);

        drop(broker);
        drop(b);
        assert_eq!(accounting.num_doc_brokers(), 0);
        assert_eq!(accounting.num_connections(), 0);
    }

    #[test]
    fn concurrent_guards_settle_at_zero() {
        let accounting = Accounting::new();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let accounting = Arc::clone(&accounting);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        let guard = accounting.connection_opened();
                        assert!(accounting.num_connections() >= 1);
                        drop(guard);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(accounting.num_connections(), 0);
    }
}
