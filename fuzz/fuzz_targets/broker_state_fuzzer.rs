//! Fuzz target for the DocumentBroker state machine
//!
//! Drives the broker the way the broker task does, with an always-answering
//! worker, and checks the invariants on every action it emits.
//!
//! # Invariants
//!
//! - Terminal states are never left
//! - `CloseRegistry` and `ReleaseWorker` are emitted at most once
//! - `Failed` is the last event a session ever receives
//! - Edit sequence numbers are strictly increasing from 0

#![no_main]

use std::collections::{HashSet, VecDeque};

use arbitrary::Arbitrary;
use bytes::Bytes;
use cowrite_core::{
    BrokerAction, BrokerError, BrokerId, DocumentBroker, DocumentId, EchoPolicy, LoadOutcome,
    SessionEvent, SessionId, WorkerReply,
};
use libfuzzer_sys::fuzz_target;

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Admit { session: u8 },
    Load { refuse: bool },
    Edit { session: u8, payload: Vec<u8> },
    Remove { session: u8 },
    WorkerDied,
}

#[derive(Default)]
struct Observed {
    closes: usize,
    releases: usize,
    failed: HashSet<SessionId>,
    next_seq: u64,
}

fn run(broker: &mut DocumentBroker<u64>, observed: &mut Observed, actions: Vec<BrokerAction>) {
    let mut queue = VecDeque::from(actions);
    while let Some(action) = queue.pop_front() {
        let follow_up = match action {
            BrokerAction::JoinWorker { session } => {
                broker.on_joined(session, WorkerReply::new(vec![Bytes::from_static(b"state")]))
            },
            BrokerAction::ForwardEdit { session, edit_seq, payload } => {
                assert_eq!(edit_seq, observed.next_seq, "edit sequence gap");
                observed.next_seq += 1;
                let (ack, broadcasts) =
                    broker.on_edit_applied(session, edit_seq, WorkerReply::new(vec![payload]));
                assert_eq!(ack.edit_seq, edit_seq);
                broadcasts
            },
            BrokerAction::FlushWorker => broker.on_flushed(),
            BrokerAction::Deliver { session, event } => {
                assert!(!observed.failed.contains(&session), "event after Failed: {event:?}");
                if matches!(event, SessionEvent::Failed { .. }) {
                    observed.failed.insert(session);
                }
                Vec::new()
            },
            BrokerAction::CloseRegistry => {
                observed.closes += 1;
                Vec::new()
            },
            BrokerAction::ReleaseWorker => {
                observed.releases += 1;
                Vec::new()
            },
            BrokerAction::LeaveWorker { .. }
            | BrokerAction::Admitted { .. }
            | BrokerAction::Rejected { .. }
            | BrokerAction::Log { .. } => Vec::new(),
        };
        for action in follow_up.into_iter().rev() {
            queue.push_front(action);
        }
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let document = DocumentId::new("/fuzz.odt").expect("valid id");
    let mut broker = DocumentBroker::new(BrokerId::from_raw(1), document, EchoPolicy::ExcludeSender);
    let mut observed = Observed::default();
    let mut now = 0u64;

    for op in ops {
        let was_terminal = broker.state().is_terminal();
        now += 1;

        let actions = match op {
            Op::Admit { session } => {
                broker.admit_session(SessionId::from_raw(u64::from(session) + 1), now).unwrap_or_default()
            },
            Op::Load { refuse } => {
                let outcome = if refuse {
                    LoadOutcome::Refused("refused".to_string())
                } else {
                    LoadOutcome::Loaded
                };
                broker.on_loaded(outcome)
            },
            Op::Edit { session, payload } => broker
                .dispatch_edit(SessionId::from_raw(u64::from(session) + 1), Bytes::from(payload))
                .unwrap_or_default(),
            Op::Remove { session } => {
                broker.remove_session(SessionId::from_raw(u64::from(session) + 1)).unwrap_or_default()
            },
            Op::WorkerDied => broker.on_worker_failure(BrokerError::WorkerDied { pid: 7 }),
        };
        run(&mut broker, &mut observed, actions);

        if was_terminal {
            assert!(broker.state().is_terminal(), "left terminal state");
        }
        assert!(observed.closes <= 1, "registry closed twice");
        assert!(observed.releases <= 1, "worker released twice");
    }
});
