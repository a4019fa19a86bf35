//! Identifiers: documents, sessions, brokers and client connections.
//!
//! Session ids come from a process-wide atomic counter and are rendered as
//! zero-padded lowercase hex. They are unique for the lifetime of the process
//! and are never persisted, so a restart may reuse them.

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use crate::error::IdError;

/// Minimum number of hex digits in the external form of a session id.
pub const SESSION_ID_WIDTH: usize = 4;

/// Normalized key identifying an open document.
///
/// Two spellings that normalize to the same text share one broker. Cloning is
/// cheap (shared string).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentId(Arc<str>);

impl DocumentId {
    /// Normalize `raw` into a document identity.
    ///
    /// Trims whitespace, drops any `?query` or `#fragment`, turns `\` into
    /// `/`, collapses repeated separators, removes `.` segments and any
    /// trailing separator. A leading `/` is kept.
    pub fn new(raw: &str) -> Result<Self, IdError> {
        let normalized = normalize(raw);
        if normalized.is_empty() || normalized == "/" {
            return Err(IdError::EmptyDocumentId { raw: raw.to_string() });
        }
        Ok(Self(Arc::from(normalized)))
    }

    /// Normalized text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn normalize(raw: &str) -> String {
    let trimmed = raw.trim();
    let end = trimmed.find(['?', '#']).unwrap_or(trimmed.len());
    let path = trimmed[..end].replace('\\', "/");

    let segments: Vec<&str> =
        path.split('/').filter(|segment| !segment.is_empty() && *segment != ".").collect();

    let mut out = String::with_capacity(path.len());
    if path.starts_with('/') {
        out.push('/');
    }
    out.push_str(&segments.join("/"));
    out
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of one client's participation in one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    /// Wrap a raw counter value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw counter value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:0width$x}", self.0, width = SESSION_ID_WIDTH)
    }
}

impl FromStr for SessionId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let well_formed = s.len() >= SESSION_ID_WIDTH
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !well_formed {
            return Err(IdError::MalformedSessionId(s.to_string()));
        }

        u64::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| IdError::MalformedSessionId(s.to_string()))
    }
}

/// Process-wide session id source.
///
/// Lock-free and safe under any number of concurrent callers. The first id
/// issued is `0001`.
#[derive(Debug, Default)]
pub struct SessionIdAllocator {
    last: AtomicU64,
}

impl SessionIdAllocator {
    /// Create an allocator that has issued nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next session id.
    pub fn next_session_id(&self) -> SessionId {
        let previous = self.last.fetch_add(1, Ordering::Relaxed);
        debug_assert!(previous != u64::MAX, "session id counter wrapped");
        SessionId(previous.wrapping_add(1))
    }

    /// Number of ids issued so far.
    pub fn issued(&self) -> u64 {
        self.last.load(Ordering::Relaxed)
    }
}

/// Generation id distinguishing successive brokers of the same document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BrokerId(u64);

impl BrokerId {
    /// Wrap a raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for BrokerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "broker-{}", self.0)
    }
}

/// Transport connection that owns a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Wrap a raw value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}
