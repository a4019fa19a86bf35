//! Document broker registry.
//!
//! Maps each document to at most one live broker. The map holds one slot per
//! document; the first opener of a document fills the slot while every
//! concurrent opener of the same document awaits that same slot. The map
//! lock only covers slot lookup and removal, never broker creation.
//!
//! # Invariants
//!
//! - At most one slot per document, and a slot is filled at most once.
//! - A slot is removed only once its broker no longer accepts sessions, or
//!   when creating its broker failed.

#![allow(clippy::disallowed_types, reason = "Short synchronous critical sections only")]

use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicUsize, Ordering},
    },
};

use cowrite_core::{BrokerError, BrokerId, DocumentId};
use tokio::sync::OnceCell;

use crate::broker::BrokerHandle;

#[derive(Debug, Default)]
struct Slot {
    cell: OnceCell<Result<BrokerHandle, BrokerError>>,
}

/// Live brokers by document.
#[derive(Debug, Default)]
pub struct BrokerRegistry {
    slots: Mutex<HashMap<DocumentId, Arc<Slot>>>,
    closed: AtomicUsize,
}

impl BrokerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The live broker for `document`, created with `create` if there is
    /// none.
    ///
    /// Concurrent calls for the same document run `create` once and share
    /// its result. A broker that is already unloading is never returned.
    ///
    /// # Errors
    ///
    /// - `BrokerClosing` if the slot held an unloading broker. The slot is
    ///   dropped so the caller's next attempt creates a fresh broker.
    /// - Whatever `create` failed with, for every waiter. The slot is removed
    ///   so the next open tries again.
    pub async fn open_or_join<F, Fut>(
        &self,
        document: &DocumentId,
        create: F,
    ) -> Result<BrokerHandle, BrokerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BrokerHandle, BrokerError>>,
    {
        let slot = self.slot(document);
        let created = slot.cell.get_or_init(create).await.clone();

        match created {
            Ok(handle) if handle.is_open() => Ok(handle),
            Ok(handle) => {
                tracing::debug!(
                    document = %document,
                    broker = %handle.id(),
                    state = ?handle.state(),
                    "broker closing; evicting"
                );
                self.remove_slot(document, &slot);
                Err(BrokerError::BrokerClosing(document.clone()))
            },
            Err(err) => {
                self.remove_slot(document, &slot);
                Err(err)
            },
        }
    }

    /// Drop the slot of broker `broker` for `document` once it is done.
    ///
    /// A late close from an older broker leaves a newer broker's slot alone.
    /// Returns whether a slot was removed.
    pub fn close_if_empty(&self, document: &DocumentId, broker: BrokerId) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.get(document) else {
            return false;
        };
        let matches = matches!(slot.cell.get(), Some(Ok(handle)) if handle.id() == broker);
        if !matches {
            return false;
        }

        slots.remove(document);
        drop(slots);

        self.closed.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(document = %document, %broker, "broker closed");
        true
    }

    /// Whether a slot exists for `document`.
    pub fn contains(&self, document: &DocumentId) -> bool {
        self.slots().contains_key(document)
    }

    /// Number of documents with a slot.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    /// Whether no document has a slot.
    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Brokers removed through [`Self::close_if_empty`] so far.
    pub fn closed_count(&self) -> usize {
        self.closed.load(Ordering::Acquire)
    }

    fn slot(&self, document: &DocumentId) -> Arc<Slot> {
        Arc::clone(self.slots().entry(document.clone()).or_default())
    }

    /// Remove `slot` if it is still the one registered for `document`.
    fn remove_slot(&self, document: &DocumentId, slot: &Arc<Slot>) {
        let mut slots = self.slots();
        if slots.get(document).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            if let Some(Ok(handle)) = slot.cell.get() {
                debug_assert!(
                    !handle.is_open(),
                    "evicting a live broker would allow {}",
                    BrokerError::DuplicateBrokerRace(document.clone())
                );
            }
            slots.remove(document);
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<DocumentId, Arc<Slot>>> {
        #[allow(clippy::expect_used)]
        self.slots.lock().expect("invariant: broker slots mutex is never poisoned")
    }
}
