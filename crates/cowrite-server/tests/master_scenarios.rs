//! End-to-end master scenarios on in-memory workers.
//!
//! Each test drives the master the way a transport would: open sessions,
//! send edits, close sessions, and watches what clients and workers see.

mod common;

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use common::{fast_config, next_event, start_master, wait_until};
use cowrite_core::{BrokerError, DocumentId, EchoPolicy, ServiceConfig, SessionEvent, SessionId};

fn doc(path: &str) -> DocumentId {
    DocumentId::new(path).unwrap()
}

/// Timings that let a paused worker hold a round trip without timing out.
fn patient_config() -> ServiceConfig {
    let mut config = fast_config(1);
    config.round_trip_timeout = Duration::from_secs(2);
    config
}

#[tokio::test]
async fn second_client_joins_the_same_worker() {
    let (master, control) = start_master(fast_config(1)).await;
    let report = doc("/docs/report.odt");

    let mut alice = master.on_session_open("/docs/report.odt").await.unwrap();
    let mut bob = master.on_session_open(" /docs/./report.odt ").await.unwrap();

    assert_eq!(alice.document, report);
    assert_eq!(bob.document, report);
    assert_ne!(alice.id, bob.id);
    assert_eq!(control.bindings_for(&report), 1);
    assert_eq!(master.brokers().len(), 1);

    assert_eq!(next_event(&mut alice).await, SessionEvent::Snapshot(Bytes::from("/docs/report.odt@0")));
    assert_eq!(next_event(&mut bob).await, SessionEvent::Snapshot(Bytes::from("/docs/report.odt@0")));

    let ack = master.on_session_message(alice.id, Bytes::from_static(b"a;b")).await.unwrap();
    assert_eq!(ack.edit_seq, 0);
    assert_eq!(ack.deltas, vec![Bytes::from_static(b"a"), Bytes::from_static(b"b")]);

    for expected in [&b"a"[..], &b"b"[..]] {
        assert_eq!(next_event(&mut bob).await, SessionEvent::Broadcast {
            from: alice.id,
            edit_seq: 0,
            payload: Bytes::copy_from_slice(expected),
        });
    }

    // The sender only sees its deltas in the acknowledgment
    assert!(alice.events.try_recv().is_err());

    let forwarded = control.forwarded_edits();
    assert_eq!(forwarded.len(), 1);
    assert_eq!(forwarded[0].session, alice.id);

    let diagnostics = master.diagnostics();
    assert_eq!(diagnostics.num_doc_brokers, 1);
    assert_eq!(diagnostics.num_connections, 2);
}

#[tokio::test]
async fn edits_are_sequenced_per_document() {
    let (master, _control) = start_master(fast_config(1)).await;

    let mut alice = master.on_session_open("/notes.txt").await.unwrap();
    let mut bob = master.on_session_open("/notes.txt").await.unwrap();
    next_event(&mut alice).await;
    next_event(&mut bob).await;

    let first = master.on_session_message(alice.id, Bytes::from_static(b"x")).await.unwrap();
    let second = master.on_session_message(bob.id, Bytes::from_static(b"y")).await.unwrap();
    let third = master.on_session_message(alice.id, Bytes::from_static(b"z")).await.unwrap();
    assert_eq!([first.edit_seq, second.edit_seq, third.edit_seq], [0, 1, 2]);

    let SessionEvent::Broadcast { edit_seq, .. } = next_event(&mut alice).await else {
        panic!("alice should see bob's edit");
    };
    assert_eq!(edit_seq, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_edits_keep_one_order_everywhere() {
    const EDITS_PER_SESSION: usize = 5;

    let (master, control) = start_master(fast_config(1)).await;
    let master = Arc::new(master);

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let mut session = master.on_session_open("/shared.odt").await.unwrap();
        next_event(&mut session).await;
        sessions.push(session);
    }

    let mut writers = Vec::new();
    for (n, id) in sessions.iter().map(|session| session.id).enumerate() {
        let master = Arc::clone(&master);
        writers.push(tokio::spawn(async move {
            let mut acked = Vec::new();
            for i in 0..EDITS_PER_SESSION {
                let payload = Bytes::from(format!("s{n}e{i}"));
                let ack = master.on_session_message(id, payload.clone()).await.unwrap();
                assert_eq!(ack.deltas, vec![payload.clone()]);
                acked.push((ack.edit_seq, id, payload));
            }
            acked
        }));
    }

    let mut acked = Vec::new();
    for writer in writers {
        acked.extend(writer.await.unwrap());
    }
    acked.sort_by_key(|(edit_seq, ..)| *edit_seq);

    let total = (sessions.len() * EDITS_PER_SESSION) as u64;
    let seqs: Vec<u64> = acked.iter().map(|(edit_seq, ..)| *edit_seq).collect();
    assert_eq!(seqs, (0..total).collect::<Vec<_>>());

    // The worker saw the edits in sequence order
    let forwarded: Vec<(SessionId, Bytes)> =
        control.forwarded_edits().into_iter().map(|edit| (edit.session, edit.payload)).collect();
    let sequenced: Vec<(SessionId, Bytes)> =
        acked.iter().map(|(_, from, payload)| (*from, payload.clone())).collect();
    assert_eq!(forwarded, sequenced);

    // Every session sees everyone else's edits in sequence order
    for session in &mut sessions {
        let expected: Vec<(u64, SessionId, Bytes)> =
            acked.iter().filter(|(_, from, _)| *from != session.id).cloned().collect();
        let mut seen = Vec::new();
        for _ in 0..expected.len() {
            let SessionEvent::Broadcast { from, edit_seq, payload } = next_event(session).await
            else {
                panic!("only broadcasts follow the snapshot");
            };
            seen.push((edit_seq, from, payload));
        }
        assert_eq!(seen, expected);
        assert!(session.events.try_recv().is_err());
    }
}

#[tokio::test]
async fn abandoned_edit_does_not_disturb_other_sessions() {
    let (master, control) = start_master(patient_config()).await;
    let master = Arc::new(master);

    let mut alice = master.on_session_open("/letter.odt").await.unwrap();
    let mut bob = master.on_session_open("/letter.odt").await.unwrap();
    let mut carol = master.on_session_open("/letter.odt").await.unwrap();
    for session in [&mut alice, &mut bob, &mut carol] {
        next_event(session).await;
    }
    let pid = control.pid_for(&doc("/letter.odt")).unwrap();
    control.pause(pid);

    let bob_edit = tokio::spawn({
        let master = Arc::clone(&master);
        let id = bob.id;
        async move { master.on_session_message(id, Bytes::from_static(b"from-bob")).await }
    });
    wait_until("bob's edit at the worker", || control.held() == 1).await;

    // Alice's edit queues behind bob's, then her caller goes away
    let alice_edit = tokio::spawn({
        let master = Arc::clone(&master);
        let id = alice.id;
        async move { master.on_session_message(id, Bytes::from_static(b"from-alice")).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    alice_edit.abort();
    assert!(alice_edit.await.unwrap_err().is_cancelled());

    control.resume(pid);
    let ack = bob_edit.await.unwrap().unwrap();
    assert_eq!(ack.edit_seq, 0);
    assert_eq!(ack.deltas, vec![Bytes::from_static(b"from-bob")]);

    // The abandoned edit was already sequenced and still goes out
    assert_eq!(next_event(&mut carol).await, SessionEvent::Broadcast {
        from: bob.id,
        edit_seq: 0,
        payload: Bytes::from_static(b"from-bob"),
    });
    let from_alice = SessionEvent::Broadcast {
        from: alice.id,
        edit_seq: 1,
        payload: Bytes::from_static(b"from-alice"),
    };
    assert_eq!(next_event(&mut carol).await, from_alice);
    assert_eq!(next_event(&mut bob).await, from_alice);

    let order: Vec<SessionId> = control.forwarded_edits().iter().map(|edit| edit.session).collect();
    assert_eq!(order, vec![bob.id, alice.id]);

    // Alice's session is unharmed
    let again = master.on_session_message(alice.id, Bytes::from_static(b"again")).await.unwrap();
    assert_eq!(again.edit_seq, 2);
    assert_eq!(master.session_count(), 3);

    master.on_session_close(alice.id).await.unwrap();
    assert_eq!(master.session_count(), 2);
    assert_eq!(master.diagnostics().num_connections, 2);
    assert_eq!(master.diagnostics().num_doc_brokers, 1);
}

#[tokio::test]
async fn abandoned_open_leaves_no_session_behind() {
    let (master, control) = start_master(patient_config()).await;
    let master = Arc::new(master);

    let mut alice = master.on_session_open("/minutes.odt").await.unwrap();
    next_event(&mut alice).await;
    let pid = control.pid_for(&doc("/minutes.odt")).unwrap();
    control.pause(pid);

    let bob_open = tokio::spawn({
        let master = Arc::clone(&master);
        async move { master.on_session_open("/minutes.odt").await.map(|session| session.id) }
    });
    wait_until("bob's join at the worker", || control.held() == 1).await;
    assert_eq!(master.diagnostics().num_connections, 2);

    bob_open.abort();
    assert!(bob_open.await.unwrap_err().is_cancelled());
    control.resume(pid);

    wait_until("connection released", || master.diagnostics().num_connections == 1).await;
    assert_eq!(master.session_count(), 1);

    // The broker forgot bob too: alice leaving unloads the document
    master.on_session_close(alice.id).await.unwrap();
    wait_until("broker unload", || master.diagnostics().num_doc_brokers == 0).await;
    assert!(master.brokers().is_empty());
}

#[tokio::test]
async fn include_sender_echoes_edits() {
    let mut config = fast_config(1);
    config.echo_policy = EchoPolicy::IncludeSender;
    let (master, _control) = start_master(config).await;

    let mut alice = master.on_session_open("/solo.odt").await.unwrap();
    next_event(&mut alice).await;

    master.on_session_message(alice.id, Bytes::from_static(b"hello")).await.unwrap();
    assert_eq!(next_event(&mut alice).await, SessionEvent::Broadcast {
        from: alice.id,
        edit_seq: 0,
        payload: Bytes::from_static(b"hello"),
    });
}

#[tokio::test]
async fn worker_crash_fails_every_session_and_pool_recovers() {
    let (master, control) = start_master(fast_config(1)).await;
    let sheet = doc("/budget.ods");

    let mut sessions = Vec::new();
    for _ in 0..3 {
        let mut session = master.on_session_open("/budget.ods").await.unwrap();
        next_event(&mut session).await;
        sessions.push(session);
    }

    let pid = control.pid_for(&sheet).unwrap();
    assert!(control.kill(pid));

    for session in &mut sessions {
        assert_eq!(next_event(session).await, SessionEvent::Failed {
            error: BrokerError::WorkerDied { pid },
        });
    }

    wait_until("broker teardown", || master.diagnostics().num_doc_brokers == 0).await;
    wait_until("warm pool refill", || master.diagnostics().idle_workers == 1).await;
    assert!(master.brokers().is_empty());

    // Sessions of the failed broker still close cleanly
    for session in &sessions {
        master.on_session_close(session.id).await.unwrap();
    }
    assert_eq!(master.diagnostics().num_connections, 0);

    // The document opens again on a fresh worker
    let mut again = master.on_session_open("/budget.ods").await.unwrap();
    assert_eq!(next_event(&mut again).await, SessionEvent::Snapshot(Bytes::from("/budget.ods@0")));
    assert_ne!(control.pid_for(&sheet), Some(pid));
}

#[tokio::test]
async fn last_session_out_unloads_the_document() {
    let (master, control) = start_master(fast_config(1)).await;

    let alice = master.on_session_open("/letter.odt").await.unwrap();
    let bob = master.on_session_open("/letter.odt").await.unwrap();

    master.on_session_close(alice.id).await.unwrap();
    assert_eq!(master.brokers().len(), 1);
    assert_eq!(master.session_count(), 1);

    master.on_session_close(bob.id).await.unwrap();
    wait_until("broker teardown", || master.diagnostics().num_doc_brokers == 0).await;
    wait_until("registry close", || master.brokers().closed_count() == 1).await;
    wait_until("worker release", || control.terminated() >= 1).await;

    assert!(master.brokers().is_empty());
    assert_eq!(master.diagnostics().num_connections, 0);
}

#[tokio::test]
async fn spawner_death_refuses_new_documents_only() {
    let (master, control) = start_master(fast_config(1)).await;

    let mut alice = master.on_session_open("/kept.odt").await.unwrap();
    next_event(&mut alice).await;
    wait_until("warm pool refill", || master.diagnostics().idle_workers == 1).await;

    control.kill_spawner();
    let mut down = master.shutdown_signal();
    tokio::time::timeout(common::PATIENCE, down.wait_for(|down| *down)).await.unwrap().unwrap();

    let err = master.on_session_open("/new.odt").await.unwrap_err();
    assert_eq!(err, BrokerError::SpawnerDown);
    assert!(!master.diagnostics().spawner_alive);

    // The open document keeps working on its worker
    let ack = master.on_session_message(alice.id, Bytes::from_static(b"still;here")).await.unwrap();
    assert_eq!(ack.deltas.len(), 2);

    // New sessions on a live document do not need a worker
    let mut bob = master.on_session_open("/kept.odt").await.unwrap();
    assert_eq!(next_event(&mut bob).await, SessionEvent::Snapshot(Bytes::from("/kept.odt@2")));
}

#[tokio::test]
async fn stalled_worker_times_out_the_edit() {
    let (master, control) = start_master(fast_config(1)).await;

    let mut alice = master.on_session_open("/slow.odt").await.unwrap();
    next_event(&mut alice).await;
    control.stall(control.pid_for(&doc("/slow.odt")).unwrap());

    let err = master.on_session_message(alice.id, Bytes::from_static(b"x")).await.unwrap_err();
    assert!(matches!(err, BrokerError::WorkerTimeout { operation: "edit", .. }), "{err:?}");

    let SessionEvent::Failed { error } = next_event(&mut alice).await else {
        panic!("session should be told the broker failed");
    };
    assert_eq!(error, err);
}

#[tokio::test]
async fn refused_document_fails_the_open() {
    let (master, control) = start_master(fast_config(1)).await;
    control.refuse(&doc("/locked.odt"));

    let err = master.on_session_open("/locked.odt").await.unwrap_err();
    assert!(matches!(err, BrokerError::DocumentLoadFailed { .. }), "{err:?}");

    wait_until("broker teardown", || master.diagnostics().num_doc_brokers == 0).await;
    assert!(master.brokers().is_empty());
    assert_eq!(master.diagnostics().num_connections, 0);
    assert_eq!(master.session_count(), 0);
}

#[tokio::test]
async fn invalid_document_is_rejected_before_any_worker() {
    let (master, control) = start_master(fast_config(0)).await;

    let err = master.on_session_open(" /./ ").await.unwrap_err();
    assert!(matches!(err, BrokerError::InvalidDocumentId(_)), "{err:?}");
    assert_eq!(control.spawned(), 0);
    assert_eq!(master.diagnostics().num_connections, 0);
}

#[tokio::test]
async fn unknown_sessions_are_reported() {
    let (master, _control) = start_master(fast_config(0)).await;
    let ghost = SessionId::from_raw(0xdead);

    let err = master.on_session_message(ghost, Bytes::from_static(b"x")).await.unwrap_err();
    assert_eq!(err, BrokerError::SessionNotFound(ghost));
    assert_eq!(master.on_session_close(ghost).await, Err(BrokerError::SessionNotFound(ghost)));
}

#[tokio::test]
async fn diagnostics_report_engine_version() {
    let (master, _control) = start_master(fast_config(1)).await;

    wait_until("warm pool fill", || master.diagnostics().idle_workers == 1).await;
    let diagnostics = master.diagnostics();
    assert!(diagnostics.spawner_alive);
    assert_eq!(diagnostics.engine_version.as_deref(), Some(cowrite_server::worker::MEMORY_ENGINE_VERSION));

    master.shutdown().await;
}
