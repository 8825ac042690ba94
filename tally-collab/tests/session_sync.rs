//! Document convergence between sessions sharing a room.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use tally_collab::channel::ChannelFrame;
use tally_collab::codec::{self, MessageKind};
use tally_collab::{
    CloseReason, ConnectionState, DocumentReplica, Origin, ParticipantInfo, Session,
    SessionConfig, SyncMessage, YrsReplica,
};
use yrs::updates::decoder::Decode;
use yrs::{GetString, StateVector, Transact};

fn step2s(messages: Vec<SyncMessage>) -> Vec<Vec<u8>> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SyncMessage::Step2 { update, .. } => Some(update),
            _ => None,
        })
        .collect()
}

fn state_vector(session: &Session) -> StateVector {
    StateVector::decode_v1(&session.document().state_vector()).unwrap()
}

/// Text of the `body` root after applying one update to an empty document.
fn body_of(update: &[u8]) -> String {
    let scratch = YrsReplica::new();
    scratch.apply_update(update, Origin::Remote).unwrap();
    let body = scratch.doc().get_or_insert_text("body");
    let txn = scratch.doc().transact();
    body.get_string(&txn)
}

fn log_session(relay: &MemoryRelay, client: u64, name: &str) -> Session<LogReplica> {
    Session::open_with(
        relay.clone(),
        Arc::new(LogReplica::new(client)),
        "doc-log",
        ParticipantInfo::new(name),
        SessionConfig::default(),
    )
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_catches_up_through_handshake() {
    let relay = MemoryRelay::new();
    let p1 = open_synced(&relay, "doc-42", "P1").await;
    type_text(&p1, 0, "0123456789");

    tokio::time::sleep(Duration::from_secs(2)).await;
    let p2 = open_synced(&relay, "doc-42", "P2").await;
    wait_until(|| text(&p2) == "0123456789").await;

    let from_p2 = step2s(relay.sync_sent_by(p2.participant().participant_id));
    assert_eq!(from_p2.len(), 1);
    assert_eq!(body_of(&from_p2[0]), "");

    let from_p1 = step2s(relay.sync_sent_by(p1.participant().participant_id));
    assert_eq!(from_p1.len(), 1);
    assert_eq!(body_of(&from_p1[0]), "0123456789");

    assert_eq!(state_vector(&p1), state_vector(&p2));
    assert_eq!(p1.participant_count(), 2);
    assert_eq!(p2.participant_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_live_edits_are_relayed_without_echo() {
    let relay = MemoryRelay::new();
    let p1 = open_synced(&relay, "doc-1", "P1").await;
    let p2 = open_synced(&relay, "doc-1", "P2").await;

    type_text(&p1, 0, "abc");
    type_text(&p1, 3, "def");
    type_text(&p1, 6, "ghi");
    wait_until(|| text(&p2) == "abcdefghi").await;

    assert_eq!(p1.stats().updates_sent, 3);
    assert_eq!(p2.stats().updates_sent, 0);
    assert!(p2.stats().echoes_suppressed >= 3);

    let echoed = relay
        .sync_sent_by(p2.participant().participant_id)
        .into_iter()
        .filter(|m| matches!(m, SyncMessage::Update(_)))
        .count();
    assert_eq!(echoed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_offline_edits_are_flushed_after_join() {
    let relay = MemoryRelay::new();
    let p1 = open_synced(&relay, "doc-1", "P1").await;

    let p2 = Session::open(relay.clone(), "doc-1", ParticipantInfo::new("P2"));
    type_text(&p2, 0, "draft");
    assert_eq!(p2.connection_state(), ConnectionState::Disconnected);

    p2.connect();
    wait_until(|| text(&p1) == "draft").await;
    assert!(p2.connection_state().is_synced());
    assert_eq!(state_vector(&p1), state_vector(&p2));
}

#[tokio::test(start_paused = true)]
async fn test_offline_backlog_larger_than_link_keeps_channel() {
    let relay = MemoryRelay::new();
    let p1 = open_synced(&relay, "doc-1", "P1").await;

    let p2 = Session::open(relay.clone(), "doc-1", ParticipantInfo::new("P2"));
    for i in 0..300 {
        type_text(&p2, i, "x");
    }
    p2.connect();
    wait_until(|| p2.connection_state().is_synced() && text(&p1) == "x".repeat(300)).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(p2.stats().reconnects, 0);
    assert_eq!(relay.connects(), 2);
    assert!(p2.connection_state().is_synced());
    let updates = relay
        .sync_sent_by(p2.participant().participant_id)
        .into_iter()
        .filter(|m| matches!(m, SyncMessage::Update(_)))
        .count();
    assert_eq!(updates, 1);
    assert_eq!(p2.stats().updates_sent, 1);
    assert_eq!(state_vector(&p1), state_vector(&p2));
}

#[tokio::test(start_paused = true)]
async fn test_update_counted_only_once_on_channel() {
    // Join takes one slot and the first update the other.
    let room = StalledRoom::with_capacity(2);
    let session = Session::open(room.clone(), "doc-1", ParticipantInfo::new("P1"));
    session.connect();
    wait_until(|| session.connection_state().is_synced()).await;

    type_text(&session, 0, "a");
    type_text(&session, 1, "b");
    wait_until(|| session.connection_state() == ConnectionState::Disconnected).await;

    let stats = session.stats();
    assert_eq!(stats.updates_sent, 1);
    assert_eq!(stats.messages_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_not_synced_by_answer_to_another() {
    let relay = MemoryRelay::new();
    let a = open_synced(&relay, "doc-3", "A").await;
    type_text(&a, 0, "hello");
    let b = open_synced(&relay, "doc-3", "B").await;
    wait_until(|| text(&b) == "hello").await;

    let c = Session::open(relay.clone(), "doc-3", ParticipantInfo::new("C"));
    type_text(&c, 0, "c:");
    c.connect();
    wait_until(|| c.connection_state().is_synced()).await;
    wait_until(|| [&a, &b].iter().all(|s| text(s) == text(&c))).await;
    assert!(text(&c).contains("hello") && text(&c).contains("c:"));

    // A and B each answered C's Step1, and every Step2 C received was for C.
    let c_sv = {
        let from_c = relay.sync_sent_by(c.participant().participant_id);
        match &from_c[0] {
            SyncMessage::Step1(sv) => sv.clone(),
            other => panic!("expected step1, got {other:?}"),
        }
    };
    let answers_to_c = [&a, &b]
        .iter()
        .flat_map(|s| relay.sync_sent_by(s.participant().participant_id))
        .filter(|m| matches!(m, SyncMessage::Step2 { answers, .. } if *answers == c_sv))
        .count();
    assert_eq!(answers_to_c, 2);
    assert_eq!(state_vector(&a), state_vector(&c));
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_edits_converge() {
    let relay = MemoryRelay::new();
    let p1 = Session::open(relay.clone(), "doc-1", ParticipantInfo::new("P1"));
    let p2 = Session::open(relay.clone(), "doc-1", ParticipantInfo::new("P2"));
    type_text(&p1, 0, "left");
    type_text(&p2, 0, "right");

    p1.connect();
    p2.connect();
    wait_until(|| p1.connection_state().is_synced() && p2.connection_state().is_synced()).await;
    wait_until(|| text(&p1) == text(&p2)).await;

    let merged = text(&p1);
    assert_eq!(merged.len(), "left".len() + "right".len());
    assert!(merged.contains("left") && merged.contains("right"));
    assert_eq!(state_vector(&p1), state_vector(&p2));

    type_text(&p2, 0, ">");
    wait_until(|| text(&p1).starts_with('>')).await;
}

#[tokio::test(start_paused = true)]
async fn test_three_participants_converge() {
    let relay = MemoryRelay::new();
    let sessions = [
        open_synced(&relay, "doc-3", "A").await,
        open_synced(&relay, "doc-3", "B").await,
        open_synced(&relay, "doc-3", "C").await,
    ];
    for (i, s) in sessions.iter().enumerate() {
        type_text(s, 0, &i.to_string());
    }
    wait_until(|| sessions.iter().all(|s| text(s).len() == 3)).await;
    wait_until(|| sessions.iter().all(|s| text(s) == text(&sessions[0]))).await;
    assert!(sessions.iter().all(|s| s.participant_count() == 3));
}

#[tokio::test(start_paused = true)]
async fn test_any_replica_converges() {
    let relay = MemoryRelay::new();
    let a = log_session(&relay, 1, "A");
    a.document().append(b"a0");
    a.connect();
    wait_until(|| a.connection_state().is_synced()).await;

    let b = log_session(&relay, 2, "B");
    b.document().append(b"b0");
    b.connect();
    wait_until(|| b.connection_state().is_synced()).await;
    wait_until(|| a.document().keys() == b.document().keys()).await;
    assert_eq!(a.document().keys().len(), 2);

    a.document().append(b"a1");
    b.document().append(b"b1");
    wait_until(|| a.document().keys().len() == 4 && b.document().keys().len() == 4).await;
    assert_eq!(a.document().keys(), b.document().keys());
    // One queued update flushed on sync plus one live update each.
    assert_eq!(a.stats().updates_sent, 2);
    assert_eq!(b.stats().updates_sent, 2);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_messages_are_dropped() {
    let relay = MemoryRelay::new();
    let p1 = open_synced(&relay, "doc-1", "P1").await;
    let rogue = raw_member(&relay, "doc-1", ParticipantInfo::new("rogue")).await;

    let unknown_step = {
        let mut bytes = codec::encode(MessageKind::Sync, &[]);
        bytes.push(9);
        bytes
    };
    for bytes in [vec![0xff], vec![7, 0], unknown_step] {
        rogue.outbound.send(ChannelFrame::Message(bytes)).await.unwrap();
    }
    wait_until(|| p1.stats().malformed_dropped == 3).await;
    assert!(p1.connection_state().is_synced());

    let p2 = open_synced(&relay, "doc-1", "P2").await;
    type_text(&p1, 0, "still fine");
    wait_until(|| text(&p2) == "still fine").await;
}

#[tokio::test(start_paused = true)]
async fn test_replica_fault_closes_session() {
    let relay = MemoryRelay::new();
    let a = log_session(&relay, 1, "A");
    a.connect();
    wait_until(|| a.connection_state().is_synced()).await;
    let b = log_session(&relay, 2, "B");
    b.connect();
    wait_until(|| b.connection_state().is_synced()).await;

    b.document().fail_applies();
    a.document().append(b"boom");
    wait_until(|| b.connection_state() == ConnectionState::Closed(CloseReason::ReplicaFault))
        .await;

    wait_until(|| relay.member_count("doc-log") == 1).await;
    wait_until(|| a.participant_count() == 1).await;
    assert!(a.connection_state().is_synced());
}
