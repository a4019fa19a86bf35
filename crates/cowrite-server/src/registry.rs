//! Session table.
//!
//! Transport callbacks only carry a session id. The registry maps that id to
//! the document and broker serving it, and keeps the reverse mapping
//! document → sessions for diagnostics and cleanup. Both directions are O(1).
//!
//! Each entry owns the connection's [`CounterGuard`], so unregistering a
//! session is what decrements `NumConnections`.

use std::collections::{HashMap, HashSet};

use cowrite_core::{ConnectionId, CounterGuard, DocumentId, SessionId};

/// A registered session.
#[derive(Debug)]
pub struct SessionEntry<B> {
    /// Document the session is attached to
    pub document: DocumentId,
    /// Broker serving the document
    pub broker: B,
    /// Connection that opened the session
    pub connection: ConnectionId,
    /// Counts the connection while the entry lives
    _connection: CounterGuard,
}

impl<B> SessionEntry<B> {
    /// Entry for a session opened on `connection`.
    pub fn new(
        document: DocumentId,
        broker: B,
        connection: ConnectionId,
        counted: CounterGuard,
    ) -> Self {
        Self { document, broker, connection, _connection: counted }
    }
}

/// Registry of open sessions.
#[derive(Debug)]
pub struct ConnectionRegistry<B> {
    /// Session ID → entry
    sessions: HashMap<SessionId, SessionEntry<B>>,
    /// Document → sessions attached to it
    documents: HashMap<DocumentId, HashSet<SessionId>>,
}

impl<B> Default for ConnectionRegistry<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B> ConnectionRegistry<B> {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self { sessions: HashMap::new(), documents: HashMap::new() }
    }

    /// Register `session`.
    ///
    /// Returns `false` if the session id is already registered; the entry is
    /// dropped in that case.
    pub fn register(&mut self, session: SessionId, entry: SessionEntry<B>) -> bool {
        if self.sessions.contains_key(&session) {
            return false;
        }

        self.documents.entry(entry.document.clone()).or_default().insert(session);
        self.sessions.insert(session, entry);
        true
    }

    /// Remove `session`, returning its entry if it was registered.
    pub fn unregister(&mut self, session: SessionId) -> Option<SessionEntry<B>> {
        let entry = self.sessions.remove(&session)?;

        if let Some(sessions) = self.documents.get_mut(&entry.document) {
            sessions.remove(&session);
            if sessions.is_empty() {
                self.documents.remove(&entry.document);
            }
        }

        Some(entry)
    }

    /// Entry of `session`. `None` if it doesn't exist.
    pub fn get(&self, session: SessionId) -> Option<&SessionEntry<B>> {
        self.sessions.get(&session)
    }

    /// Check if a session is registered.
    pub fn has_session(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    /// All sessions attached to `document`.
    pub fn sessions_for_document(
        &self,
        document: &DocumentId,
    ) -> impl Iterator<Item = SessionId> + '_ {
        self.documents.get(document).into_iter().flat_map(|s| s.iter().copied())
    }

    /// Total number of registered sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of documents with at least one session.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cowrite_core::Accounting;

    use super::*;

    fn doc(path: &str) -> DocumentId {
        DocumentId::new(path).unwrap()
    }

    fn entry(accounting: &Arc<Accounting>, path: &str) -> SessionEntry<u32> {
        SessionEntry::new(doc(path), 7, ConnectionId::from_raw(1), accounting.connection_opened())
    }

    #[test]
    fn register_and_lookup_session() {
        let accounting = Accounting::new();
        let mut registry = ConnectionRegistry::new();

        assert!(registry.register(SessionId::from_raw(1), entry(&accounting, "/a.odt")));
        assert!(registry.has_session(SessionId::from_raw(1)));
        assert!(!registry.has_session(SessionId::from_raw(2)));

        let found = registry.get(SessionId::from_raw(1)).unwrap();
        assert_eq!(found.document, doc("/a.odt"));
        assert_eq!(found.broker, 7);
    }

    #[test]
    fn register_duplicate_session_fails() {
        let accounting = Accounting::new();
        let mut registry = ConnectionRegistry::new();

        assert!(registry.register(SessionId::from_raw(1), entry(&accounting, "/a.odt")));
        assert!(!registry.register(SessionId::from_raw(1), entry(&accounting, "/b.odt")));

        // The rejected entry released its connection count
        assert_eq!(accounting.num_connections(), 1);
        assert_eq!(registry.document_count(), 1);
    }

    #[test]
    fn unregister_releases_connection_count() {
        let accounting = Accounting::new();
        let mut registry = ConnectionRegistry::new();

        registry.register(SessionId::from_raw(1), entry(&accounting, "/a.odt"));
        assert_eq!(accounting.num_connections(), 1);

        let removed = registry.unregister(SessionId::from_raw(1)).unwrap();
        assert_eq!(accounting.num_connections(), 1);
        drop(removed);
        assert_eq!(accounting.num_connections(), 0);

        assert!(registry.unregister(SessionId::from_raw(1)).is_none());
    }

    #[test]
    fn sessions_grouped_by_document() {
        let accounting = Accounting::new();
        let mut registry = ConnectionRegistry::new();

        registry.register(SessionId::from_raw(1), entry(&accounting, "/a.odt"));
        registry.register(SessionId::from_raw(2), entry(&accounting, "/a.odt"));
        registry.register(SessionId::from_raw(3), entry(&accounting, "/b.odt"));

        let mut on_a: Vec<_> = registry.sessions_for_document(&doc("/a.odt")).collect();
        on_a.sort_by_key(|s| s.as_u64());
        assert_eq!(on_a, vec![SessionId::from_raw(1), SessionId::from_raw(2)]);
        assert_eq!(registry.document_count(), 2);

        registry.unregister(SessionId::from_raw(3));
        assert_eq!(registry.sessions_for_document(&doc("/b.odt")).count(), 0);
        assert_eq!(registry.document_count(), 1);
        assert_eq!(registry.session_count(), 2);
    }
}
