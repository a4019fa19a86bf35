//! Document broker state machine.
//!
//! One broker per open document. It is the single serialization point for
//! its worker: the runtime feeds it one command or worker outcome at a time
//! and executes the returned [`BrokerAction`]s in order. The broker itself
//! never touches the worker, the clock or a channel.
//!
//! # States
//!
//! ```text
//! Loading -> Active -> Unloading -> Destroyed
//!    \          \           \
//!     +----------+-----------+--> Failed
//! ```
//!
//! # Invariants
//!
//! - Edits receive strictly increasing `edit_seq` values starting at 0, in
//!   the order `dispatch_edit` was called.
//! - Deltas from one edit are delivered in the order the worker emitted them.
//! - Every session that is admitted when the broker fails gets exactly one
//!   `SessionEvent::Failed`, and it is the last event it receives.
//! - `ReleaseWorker` and `CloseRegistry` are emitted exactly once, together,
//!   on the transition into `Destroyed` or `Failed`.

use std::collections::BTreeMap;

use bytes::Bytes;

use crate::{
    config::EchoPolicy,
    error::BrokerError,
    ids::{BrokerId, DocumentId, SessionId},
    worker::{LoadOutcome, WorkerReply},
};

/// Lifecycle of a document broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Worker bound, document load in progress
    Loading,
    /// Document loaded; edits flow
    Active,
    /// Last session left; flushing before teardown
    Unloading,
    /// Worker failed; sessions notified
    Failed,
    /// Torn down; worker released
    Destroyed,
}

impl BrokerState {
    /// Whether new sessions may still be admitted.
    pub fn accepts_sessions(self) -> bool {
        matches!(self, Self::Loading | Self::Active)
    }

    /// Whether the broker has reached a state it never leaves.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Destroyed)
    }
}

/// Log levels for broker actions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug information
    Debug,
    /// Informational message
    Info,
    /// Warning
    Warn,
    /// Error
    Error,
}

/// Event delivered to one session's outbound channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Join state from the worker
    Snapshot(Bytes),
    /// Delta produced by an edit
    Broadcast {
        /// Session whose edit produced the delta
        from: SessionId,
        /// Sequence number of that edit
        edit_seq: u64,
        /// Delta as emitted by the worker
        payload: Bytes,
    },
    /// The broker failed; no further events follow
    Failed {
        /// Why the broker failed
        error: BrokerError,
    },
}

/// Acknowledgment returned to the sender of an edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditAck {
    /// Position of the edit in the document's total order
    pub edit_seq: u64,
    /// Deltas the worker produced, in emission order
    pub deltas: Vec<Bytes>,
}

/// Actions returned by [`DocumentBroker`] for the runtime to execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerAction {
    /// Join round trip for a session; feed the reply to
    /// [`DocumentBroker::on_joined`]
    JoinWorker {
        /// Session to join
        session: SessionId,
    },

    /// Leave round trip for a session
    LeaveWorker {
        /// Session that left
        session: SessionId,
    },

    /// Edit round trip; feed the reply to [`DocumentBroker::on_edit_applied`]
    ForwardEdit {
        /// Sender of the edit
        session: SessionId,
        /// Sequence number assigned to the edit
        edit_seq: u64,
        /// Opaque edit payload
        payload: Bytes,
    },

    /// Push an event to a session's outbound channel
    Deliver {
        /// Recipient
        session: SessionId,
        /// Event to deliver
        event: SessionEvent,
    },

    /// Admission finished; resolve the waiting opener with success
    Admitted {
        /// Session that joined
        session: SessionId,
    },

    /// Admission failed; resolve the waiting opener with `error`
    Rejected {
        /// Session that did not join
        session: SessionId,
        /// Failure to report
        error: BrokerError,
    },

    /// Flush round trip before unload; feed success to
    /// [`DocumentBroker::on_flushed`]
    FlushWorker,

    /// Hand the worker back to the supervisor for termination
    ReleaseWorker,

    /// Remove this broker from the registry
    CloseRegistry,

    /// Log a message
    Log {
        /// Log level
        level: LogLevel,
        /// Message to log
        message: String,
    },
}

/// A session admitted to a broker.
#[derive(Debug, Clone)]
pub struct Session<I> {
    /// Session identifier
    pub id: SessionId,
    /// When the session was admitted
    pub admitted_at: I,
    /// Whether the worker has confirmed the join
    pub joined: bool,
}

/// Pure state machine for one open document.
///
/// Generic over `I` (Instant type) to support virtual time in tests.
#[derive(Debug)]
pub struct DocumentBroker<I> {
    id: BrokerId,
    document: DocumentId,
    state: BrokerState,
    echo: EchoPolicy,
    sessions: BTreeMap<SessionId, Session<I>>,
    next_edit_seq: u64,
    failure: Option<BrokerError>,
}

impl<I: Copy> DocumentBroker<I> {
    /// A broker whose worker has just been bound and asked to load.
    pub fn new(id: BrokerId, document: DocumentId, echo: EchoPolicy) -> Self {
        Self {
            id,
            document,
            state: BrokerState::Loading,
            echo,
            sessions: BTreeMap::new(),
            next_edit_seq: 0,
            failure: None,
        }
    }

    /// Broker generation id.
    pub fn id(&self) -> BrokerId {
        self.id
    }

    /// Document served by this broker.
    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    /// Current state.
    pub fn state(&self) -> BrokerState {
        self.state
    }

    /// Number of admitted sessions, joined or not.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether `session` is admitted.
    pub fn has_session(&self, session: SessionId) -> bool {
        self.sessions.contains_key(&session)
    }

    /// Sequence number the next edit will receive.
    pub fn next_edit_seq(&self) -> u64 {
        self.next_edit_seq
    }

    /// Error that failed the broker, once failed.
    pub fn failure(&self) -> Option<&BrokerError> {
        self.failure.as_ref()
    }

    /// Admit a session.
    ///
    /// While loading, the session waits for the load to finish. While active,
    /// the join is forwarded right away.
    ///
    /// # Errors
    ///
    /// `BrokerClosing` once the broker is unloading or gone; the caller opens
    /// the document again to get a fresh broker.
    pub fn admit_session(
        &mut self,
        session: SessionId,
        now: I,
    ) -> Result<Vec<BrokerAction>, BrokerError> {
        if !self.state.accepts_sessions() {
            return Err(BrokerError::BrokerClosing(self.document.clone()));
        }

        self.sessions.insert(session, Session { id: session, admitted_at: now, joined: false });

        if self.state == BrokerState::Loading {
            return Ok(vec![BrokerAction::Log {
                level: LogLevel::Debug,
                message: format!("session {session} waiting for {} to load", self.document),
            }]);
        }

        Ok(vec![BrokerAction::JoinWorker { session }])
    }

    /// Feed the result of the load round trip.
    pub fn on_loaded(&mut self, outcome: LoadOutcome) -> Vec<BrokerAction> {
        if self.state != BrokerState::Loading {
            return vec![BrokerAction::Log {
                level: LogLevel::Debug,
                message: format!("ignoring load result for {} in {:?}", self.document, self.state),
            }];
        }

        match outcome {
            LoadOutcome::Loaded => {
                self.state = BrokerState::Active;

                let mut actions = vec![BrokerAction::Log {
                    level: LogLevel::Info,
                    message: format!("{} loaded by {}", self.document, self.id),
                }];

                if self.sessions.is_empty() {
                    actions.extend(self.begin_unload());
                } else {
                    actions.extend(
                        self.sessions.keys().map(|&session| BrokerAction::JoinWorker { session }),
                    );
                }
                actions
            },
            LoadOutcome::Refused(reason) => self.on_worker_failure(BrokerError::DocumentLoadFailed {
                document: self.document.clone(),
                reason,
            }),
        }
    }

    /// Feed the result of a join round trip.
    pub fn on_joined(&mut self, session: SessionId, reply: WorkerReply) -> Vec<BrokerAction> {
        let Some(entry) = self.sessions.get_mut(&session) else {
            return vec![BrokerAction::Log {
                level: LogLevel::Warn,
                message: format!("join reply for unknown session {session}"),
            }];
        };
        entry.joined = true;

        let mut actions: Vec<BrokerAction> = reply
            .deltas
            .into_iter()
            .map(|state| BrokerAction::Deliver { session, event: SessionEvent::Snapshot(state) })
            .collect();
        actions.push(BrokerAction::Admitted { session });
        actions
    }

    /// Sequence an edit from `session`.
    ///
    /// # Errors
    ///
    /// - `InvalidState` unless the broker is active.
    /// - `SessionNotFound` if `session` is not admitted here.
    pub fn dispatch_edit(
        &mut self,
        session: SessionId,
        payload: Bytes,
    ) -> Result<Vec<BrokerAction>, BrokerError> {
        if self.state != BrokerState::Active {
            return Err(BrokerError::InvalidState { state: self.state, operation: "edit" });
        }
        if !self.sessions.contains_key(&session) {
            return Err(BrokerError::SessionNotFound(session));
        }

        let edit_seq = self.next_edit_seq;
        self.next_edit_seq += 1;

        Ok(vec![BrokerAction::ForwardEdit { session, edit_seq, payload }])
    }

    /// Feed the worker's reply to an edit.
    ///
    /// Returns the sender's acknowledgment and the broadcasts for everyone
    /// else (or everyone, under [`EchoPolicy::IncludeSender`]).
    pub fn on_edit_applied(
        &mut self,
        from: SessionId,
        edit_seq: u64,
        reply: WorkerReply,
    ) -> (EditAck, Vec<BrokerAction>) {
        let recipients: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.joined)
            .map(|s| s.id)
            .filter(|&id| id != from || self.echo == EchoPolicy::IncludeSender)
            .collect();

        let mut actions = Vec::with_capacity(reply.deltas.len() * recipients.len());
        for payload in &reply.deltas {
            for &session in &recipients {
                actions.push(BrokerAction::Deliver {
                    session,
                    event: SessionEvent::Broadcast { from, edit_seq, payload: payload.clone() },
                });
            }
        }

        (EditAck { edit_seq, deltas: reply.deltas }, actions)
    }

    /// Remove a session. Removing the last one starts the unload.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` if `session` is not admitted here.
    pub fn remove_session(&mut self, session: SessionId) -> Result<Vec<BrokerAction>, BrokerError> {
        let removed =
            self.sessions.remove(&session).ok_or(BrokerError::SessionNotFound(session))?;

        let mut actions = Vec::new();
        if removed.joined {
            actions.push(BrokerAction::LeaveWorker { session });
        }

        // An empty loading broker unloads as soon as the load resolves.
        if self.sessions.is_empty() && self.state == BrokerState::Active {
            actions.extend(self.begin_unload());
        }
        Ok(actions)
    }

    /// Feed a successful flush. Completes the unload.
    pub fn on_flushed(&mut self) -> Vec<BrokerAction> {
        if self.state != BrokerState::Unloading {
            return vec![BrokerAction::Log {
                level: LogLevel::Debug,
                message: format!("ignoring flush for {} in {:?}", self.document, self.state),
            }];
        }

        self.state = BrokerState::Destroyed;
        vec![
            BrokerAction::Log {
                level: LogLevel::Info,
                message: format!("{} unloaded by {}", self.document, self.id),
            },
            BrokerAction::ReleaseWorker,
            BrokerAction::CloseRegistry,
        ]
    }

    /// The worker died, stalled past a deadline or refused the document.
    ///
    /// Every admitted session is told, sessions still waiting to join are
    /// rejected, and the worker is released. Ignored once terminal.
    pub fn on_worker_failure(&mut self, error: BrokerError) -> Vec<BrokerAction> {
        if self.state.is_terminal() {
            return vec![BrokerAction::Log {
                level: LogLevel::Debug,
                message: format!("{} already {:?}; ignoring {error}", self.document, self.state),
            }];
        }

        let previous = self.state;
        self.state = BrokerState::Failed;
        self.failure = Some(error.clone());

        let mut actions = vec![BrokerAction::Log {
            level: LogLevel::Warn,
            message: format!("{} failed while {previous:?}: {error}", self.document),
        }];

        for session in std::mem::take(&mut self.sessions).into_values() {
            actions.push(BrokerAction::Deliver {
                session: session.id,
                event: SessionEvent::Failed { error: error.clone() },
            });
            if !session.joined {
                actions.push(BrokerAction::Rejected { session: session.id, error: error.clone() });
            }
        }

        actions.push(BrokerAction::ReleaseWorker);
        actions.push(BrokerAction::CloseRegistry);
        actions
    }

    fn begin_unload(&mut self) -> Vec<BrokerAction> {
        self.state = BrokerState::Unloading;
        vec![
            BrokerAction::Log {
                level: LogLevel::Debug,
                message: format!("last session left {}; flushing", self.document),
            },
            BrokerAction::FlushWorker,
        ]
    }
}
