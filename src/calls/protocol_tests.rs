//! End-to-end call flows over mock collaborators: manager, session actor,
//! peer links and registry wired together exactly as in production, with the
//! outbox, media engine and REST API replaced by scripted doubles.

use super::api::mock::{MockCallApi, RecordingHistory};
use super::error::CallError;
use super::manager::CallManager;
use super::media::mock::MockMediaEngine;
use super::session::{SessionDeps, SignalOutbox};
use super::state::CallState;
use super::{CallId, EndReason};
use crate::bus::MessageHandler;
use crate::calls::registry::CallRegistry;
use crate::events::Notifier;
use crate::wire::{CallKind, WireMessage};
use async_trait::async_trait;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Default)]
struct RecordingOutbox {
    sent: StdMutex<Vec<WireMessage>>,
}

#[async_trait]
impl SignalOutbox for RecordingOutbox {
    async fn send_signal(&self, message: &WireMessage) -> bool {
        self.sent.lock().unwrap().push(message.clone());
        true
    }
}

impl RecordingOutbox {
    fn sent(&self) -> Vec<WireMessage> {
        self.sent.lock().unwrap().clone()
    }

    fn count_tag(&self, tag: &str) -> usize {
        self.sent().iter().filter(|m| m.tag() == tag).count()
    }

    fn offer_targets(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| match m {
                WireMessage::Offer {
                    target: Some(target),
                    ..
                } => Some(target.clone()),
                _ => None,
            })
            .collect()
    }
}

struct Harness {
    manager: Arc<CallManager>,
    outbox: Arc<RecordingOutbox>,
    media: Arc<MockMediaEngine>,
    api: Arc<MockCallApi>,
    history: Arc<RecordingHistory>,
    registry: Arc<CallRegistry>,
    notifier: Arc<Notifier>,
}

fn harness() -> Harness {
    harness_with(Default::default())
}

fn harness_with(config: crate::config::CallConfig) -> Harness {
    let outbox = Arc::new(RecordingOutbox::default());
    let media = MockMediaEngine::new();
    let api = Arc::new(MockCallApi::default());
    let history = Arc::new(RecordingHistory::default());
    let registry = Arc::new(CallRegistry::new());
    let notifier = Arc::new(Notifier::new());
    let deps = Arc::new(SessionDeps {
        outbox: outbox.clone(),
        media: media.clone(),
        api: api.clone(),
        history: Some(history.clone()),
        registry: registry.clone(),
        notifier: notifier.clone(),
        config,
    });
    Harness {
        manager: CallManager::new(deps, "me"),
        outbox,
        media,
        api,
        history,
        registry,
        notifier,
    }
}

async fn wait_until(description: &str, condition: impl Fn() -> bool) {
    let poll = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {description}"));
}

async fn wait_for_state(
    handle: &super::session::CallSessionHandle,
    description: &str,
    condition: impl FnMut(&CallState) -> bool,
) -> CallState {
    let mut states = handle.state_stream();
    let state = tokio::time::timeout(Duration::from_secs(5), states.wait_for(condition))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {description}"))
        .expect("session dropped its state channel");
    state.clone()
}

async fn route(h: &Harness, message: WireMessage) {
    h.manager.handle(&message).await.unwrap();
}

fn answer_from(user_id: &str) -> WireMessage {
    WireMessage::Answer {
        sdp: format!("answer-by-{user_id}"),
        user_id: user_id.to_string(),
        target: Some("me".to_string()),
    }
}

fn candidate_from(user_id: &str) -> WireMessage {
    WireMessage::IceCandidate {
        candidate: format!("candidate-from-{user_id}"),
        user_id: user_id.to_string(),
        target: Some("me".to_string()),
    }
}

#[tokio::test]
async fn outgoing_group_call_reaches_active_and_hangs_up_cleanly() {
    let h = harness();
    let handle = h
        .manager
        .start_call(vec!["bob".into(), "carol".into()], CallKind::Video)
        .unwrap();

    wait_for_state(&handle, "ringing", |s| s.is_ringing()).await;
    assert_eq!(h.api.initiations.load(std::sync::atomic::Ordering::SeqCst), 1);
    // The server-assigned id replaced the provisional one.
    assert_eq!(h.registry.active_call_id(), Some(handle.call_id()));

    route(&h, WireMessage::Join { user_id: "bob".into() }).await;
    wait_until("offer to bob", || h.outbox.offer_targets().contains(&"bob".to_string())).await;

    route(&h, answer_from("bob")).await;
    route(&h, candidate_from("bob")).await;
    wait_for_state(&handle, "active", |s| s.is_active()).await;

    // A late joiner gets an offer while the call is already active.
    route(&h, WireMessage::Join { user_id: "carol".into() }).await;
    wait_until("offer to carol", || {
        h.outbox.offer_targets().contains(&"carol".to_string())
    })
    .await;
    route(&h, answer_from("carol")).await;
    route(&h, candidate_from("carol")).await;
    wait_until("carol's candidate applied", || {
        h.media
            .peer_for("carol")
            .is_some_and(|p| !p.applied().is_empty())
    })
    .await;
    assert!(handle.state().is_active());

    h.manager.hangup().await.unwrap();
    let ended = wait_for_state(&handle, "ended", |s| s.is_ended()).await;
    assert!(matches!(
        ended,
        CallState::Ended { reason: EndReason::Hangup, .. }
    ));
    assert_eq!(h.outbox.count_tag("leave"), 1);

    wait_until("end request", || !h.api.ends.lock().unwrap().is_empty()).await;
    assert_eq!(h.api.ends.lock().unwrap()[0], handle.call_id());
    assert_eq!(h.registry.active_call_id(), None);

    let records = h.history.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].end_reason, EndReason::Hangup);
    assert!(records[0].duration_secs.is_some());
}

#[tokio::test]
async fn hangup_invalidates_in_flight_answer() {
    let h = harness();
    let gate = Arc::new(Notify::new());
    *h.media.answer_gate.lock().unwrap() = Some(gate.clone());

    route(
        &h,
        WireMessage::IncomingCall {
            call_id: "C1".into(),
            caller_id: "alice".into(),
            caller_name: None,
            call_type: CallKind::Audio,
            signaling_url: None,
        },
    )
    .await;
    let handle = h.manager.active_call().expect("incoming call ringing");

    h.manager.accept().await.unwrap();
    wait_for_state(&handle, "connecting", |s| s.is_connecting()).await;
    wait_until("join announcement", || h.outbox.count_tag("join") == 1).await;
    assert_eq!(h.api.joins.lock().unwrap()[0], CallId::new("C1"));

    // The answer for alice's offer is now stuck behind the gate.
    route(
        &h,
        WireMessage::Offer {
            sdp: "offer-by-alice".into(),
            user_id: "alice".into(),
            target: Some("me".into()),
        },
    )
    .await;

    h.manager.hangup().await.unwrap();
    wait_for_state(&handle, "ended", |s| s.is_ended()).await;

    // Releasing the gate must not resurrect the answer.
    gate.notify_waiters();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.outbox.count_tag("answer"), 0);

    let records = h.history.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].end_reason, EndReason::Hangup);
}

#[tokio::test]
async fn second_call_is_rejected_while_one_is_live() {
    let h = harness();
    let handle = h.manager.start_call(vec!["bob".into()], CallKind::Audio).unwrap();
    wait_for_state(&handle, "ringing", |s| s.is_ringing()).await;
    let first_id = handle.call_id();

    let mut incoming_rx = h.notifier.incoming_call.subscribe();
    route(
        &h,
        WireMessage::IncomingCall {
            call_id: "X9".into(),
            caller_id: "mallory".into(),
            caller_name: None,
            call_type: CallKind::Audio,
            signaling_url: None,
        },
    )
    .await;

    // The busy incoming call never rings and never disturbs the live one.
    assert!(incoming_rx.try_recv().is_err());
    assert_eq!(h.registry.active_call_id(), Some(first_id.clone()));
    assert_eq!(h.manager.active_call().unwrap().call_id(), first_id);

    assert!(matches!(
        h.manager.start_call(vec!["carol".into()], CallKind::Audio),
        Err(CallError::Busy(_))
    ));
}

#[tokio::test]
async fn repeated_mute_sends_exactly_one_broadcast_per_change() {
    let h = harness();
    let handle = h.manager.start_call(vec!["bob".into()], CallKind::Audio).unwrap();
    wait_for_state(&handle, "ringing", |s| s.is_ringing()).await;

    h.manager.set_muted(true).await.unwrap();
    h.manager.set_muted(true).await.unwrap();
    h.manager.set_muted(false).await.unwrap();
    // The video toggle is a fence: once it shows up, the mutes before it
    // have all been processed.
    h.manager.set_video_enabled(true).await.unwrap();
    wait_until("video toggle", || h.outbox.count_tag("video_toggle") == 1).await;

    let mutes: Vec<bool> = h
        .outbox
        .sent()
        .iter()
        .filter_map(|m| match m {
            WireMessage::Mute { muted, .. } => Some(*muted),
            _ => None,
        })
        .collect();
    assert_eq!(mutes, vec![true, false]);

    let media = h.media.current_media.lock().unwrap().clone().unwrap();
    assert!(media.audio_enabled.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn hangup_ends_the_call_while_media_acquisition_is_stalled() {
    let h = harness();
    let gate = Arc::new(Notify::new());
    *h.media.acquire_gate.lock().unwrap() = Some(gate.clone());

    let handle = h.manager.start_call(vec!["bob".into()], CallKind::Audio).unwrap();
    h.manager.hangup().await.unwrap();

    // The permission prompt is still open, yet the call must die now.
    let ended = wait_for_state(&handle, "ended", |s| s.is_ended()).await;
    assert!(matches!(
        ended,
        CallState::Ended { reason: EndReason::Hangup, .. }
    ));
    assert_eq!(h.registry.active_call_id(), None);

    // A grant arriving after the fact is handed straight back and the
    // initiate request never goes out.
    gate.notify_one();
    wait_until("late grant released", || {
        h.media
            .current_media
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|m| m.released.load(std::sync::atomic::Ordering::SeqCst))
    })
    .await;
    assert_eq!(h.api.initiations.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test]
async fn toggling_mute_twice_returns_to_audible() {
    let h = harness();
    let handle = h.manager.start_call(vec!["bob".into()], CallKind::Audio).unwrap();
    wait_for_state(&handle, "ringing", |s| s.is_ringing()).await;

    h.manager.toggle_mute().await.unwrap();
    h.manager.toggle_mute().await.unwrap();
    // On an audio call the video flag starts off, so this lands as the
    // ordering fence for the two mutes.
    h.manager.toggle_video().await.unwrap();
    wait_until("video toggle", || h.outbox.count_tag("video_toggle") == 1).await;

    let mutes: Vec<bool> = h
        .outbox
        .sent()
        .iter()
        .filter_map(|m| match m {
            WireMessage::Mute { muted, .. } => Some(*muted),
            _ => None,
        })
        .collect();
    assert_eq!(mutes, vec![true, false]);

    let media = h.media.current_media.lock().unwrap().clone().unwrap();
    assert!(media.audio_enabled.load(std::sync::atomic::Ordering::SeqCst));
}

#[tokio::test]
async fn failed_negotiation_drops_the_participant_not_the_call() {
    let h = harness();
    h.media.fail_offers.lock().unwrap().push("carol".to_string());
    let mut updates = h.notifier.participant_update.subscribe();

    let handle = h
        .manager
        .start_call(vec!["bob".into(), "carol".into()], CallKind::Audio)
        .unwrap();
    wait_for_state(&handle, "ringing", |s| s.is_ringing()).await;

    route(&h, WireMessage::Join { user_id: "carol".into() }).await;
    route(&h, WireMessage::Join { user_id: "bob".into() }).await;
    wait_until("offer to bob", || h.outbox.offer_targets().contains(&"bob".to_string())).await;

    route(&h, answer_from("bob")).await;
    route(&h, candidate_from("bob")).await;
    wait_for_state(&handle, "active", |s| s.is_active()).await;

    // Carol joined and then dropped out of the mesh.
    let mut saw_carol_leave = false;
    while let Ok(update) = updates.try_recv() {
        if update.user_id == "carol" && update.left {
            saw_carol_leave = true;
        }
    }
    assert!(saw_carol_leave);
    assert!(h.outbox.offer_targets().iter().all(|t| t != "carol"));
}

#[tokio::test]
async fn remote_leave_of_last_participant_ends_the_call() {
    let h = harness();
    let handle = h.manager.start_call(vec!["bob".into()], CallKind::Audio).unwrap();
    wait_for_state(&handle, "ringing", |s| s.is_ringing()).await;

    route(&h, WireMessage::Join { user_id: "bob".into() }).await;
    wait_for_state(&handle, "connecting", |s| s.is_connecting()).await;

    route(&h, WireMessage::Leave { user_id: "bob".into() }).await;
    let ended = wait_for_state(&handle, "ended", |s| s.is_ended()).await;
    assert!(matches!(
        ended,
        CallState::Ended { reason: EndReason::RemoteHangup, .. }
    ));
}

#[tokio::test]
async fn declined_call_tells_the_server_and_frees_the_slot() {
    let h = harness();
    route(
        &h,
        WireMessage::IncomingCall {
            call_id: "C2".into(),
            caller_id: "alice".into(),
            caller_name: Some("Alice".into()),
            call_type: CallKind::Video,
            signaling_url: None,
        },
    )
    .await;
    let handle = h.manager.active_call().expect("incoming call ringing");

    h.manager.decline().await.unwrap();
    let ended = wait_for_state(&handle, "ended", |s| s.is_ended()).await;
    assert!(matches!(
        ended,
        CallState::Ended { reason: EndReason::Declined, .. }
    ));
    wait_until("end request", || !h.api.ends.lock().unwrap().is_empty()).await;
    assert_eq!(h.registry.active_call_id(), None);
    // No media was ever acquired for a declined call.
    assert_eq!(h.media.acquisitions.load(std::sync::atomic::Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn unanswered_call_times_out() {
    let h = harness_with(crate::config::CallConfig {
        ring_timeout: Duration::from_secs(1),
        ..Default::default()
    });
    route(
        &h,
        WireMessage::IncomingCall {
            call_id: "C3".into(),
            caller_id: "alice".into(),
            caller_name: None,
            call_type: CallKind::Audio,
            signaling_url: None,
        },
    )
    .await;
    let handle = h.manager.active_call().expect("incoming call ringing");

    let ended = wait_for_state(&handle, "timeout", |s| s.is_ended()).await;
    assert!(matches!(
        ended,
        CallState::Ended { reason: EndReason::Timeout, .. }
    ));
    assert_eq!(h.registry.active_call_id(), None);
}

#[tokio::test]
async fn rejected_initiation_ends_the_call_before_it_rings() {
    let h = harness();
    h.api.reject_initiate.store(true, std::sync::atomic::Ordering::SeqCst);

    let handle = h.manager.start_call(vec!["bob".into()], CallKind::Audio).unwrap();
    let ended = wait_for_state(&handle, "ended", |s| s.is_ended()).await;
    assert!(matches!(
        ended,
        CallState::Ended { reason: EndReason::ServerRejected, .. }
    ));
    // The acquired media was handed back.
    let media = h.media.current_media.lock().unwrap().clone().unwrap();
    assert!(media.released.load(std::sync::atomic::Ordering::SeqCst));
    assert_eq!(h.registry.active_call_id(), None);
}

#[tokio::test]
async fn early_candidates_wait_for_the_offer_and_apply_first() {
    let h = harness();
    route(
        &h,
        WireMessage::IncomingCall {
            call_id: "C4".into(),
            caller_id: "alice".into(),
            caller_name: None,
            call_type: CallKind::Audio,
            signaling_url: None,
        },
    )
    .await;
    let handle = h.manager.active_call().expect("incoming call ringing");
    h.manager.accept().await.unwrap();
    wait_for_state(&handle, "connecting", |s| s.is_connecting()).await;

    // Alice's candidates race ahead of her offer.
    for candidate in ["early-1", "early-2"] {
        route(
            &h,
            WireMessage::IceCandidate {
                candidate: candidate.into(),
                user_id: "alice".into(),
                target: Some("me".into()),
            },
        )
        .await;
    }
    route(
        &h,
        WireMessage::Offer {
            sdp: "offer-by-alice".into(),
            user_id: "alice".into(),
            target: Some("me".into()),
        },
    )
    .await;
    wait_until("answer to alice", || h.outbox.count_tag("answer") == 1).await;

    route(
        &h,
        WireMessage::IceCandidate {
            candidate: "late".into(),
            user_id: "alice".into(),
            target: Some("me".into()),
        },
    )
    .await;
    wait_until("all candidates applied", || {
        h.media.peer_for("alice").is_some_and(|p| p.applied().len() == 3)
    })
    .await;
    // The buffered candidates landed before the post-offer one, in order.
    assert_eq!(
        h.media.peer_for("alice").unwrap().applied(),
        vec!["early-1", "early-2", "late"]
    );
}

#[tokio::test]
async fn mid_call_invite_goes_through_the_server() {
    let h = harness();
    let handle = h.manager.start_call(vec!["bob".into()], CallKind::Audio).unwrap();
    wait_for_state(&handle, "ringing", |s| s.is_ringing()).await;

    route(&h, WireMessage::Join { user_id: "bob".into() }).await;
    wait_until("offer to bob", || h.outbox.offer_targets().contains(&"bob".to_string())).await;
    route(&h, answer_from("bob")).await;
    route(&h, candidate_from("bob")).await;
    wait_for_state(&handle, "active", |s| s.is_active()).await;

    h.manager.add_participant("dave").await.unwrap();
    // Repeat invites for someone already on the roster are swallowed.
    h.manager.add_participant("bob").await.unwrap();
    wait_until("invite request", || !h.api.invites.lock().unwrap().is_empty()).await;
    assert_eq!(
        *h.api.invites.lock().unwrap(),
        vec![(handle.call_id(), "dave".to_string())]
    );

    // The invitee arrives like any other joiner and gets an offer.
    route(&h, WireMessage::Join { user_id: "dave".into() }).await;
    wait_until("offer to dave", || {
        h.outbox.offer_targets().contains(&"dave".to_string())
    })
    .await;
    assert!(handle.state().is_active());
}

#[tokio::test]
async fn participant_media_updates_are_surfaced() {
    let h = harness();
    let mut updates = h.notifier.participant_update.subscribe();
    let handle = h.manager.start_call(vec!["bob".into()], CallKind::Audio).unwrap();
    wait_for_state(&handle, "ringing", |s| s.is_ringing()).await;

    route(&h, WireMessage::ParticipantMuted { user_id: "bob".into(), muted: true }).await;
    route(
        &h,
        WireMessage::ParticipantVideo { user_id: "bob".into(), video_enabled: false },
    )
    .await;

    let first = updates.recv().await.unwrap();
    assert_eq!(first.user_id, "bob");
    assert_eq!(first.muted, Some(true));
    let second = updates.recv().await.unwrap();
    assert_eq!(second.video_enabled, Some(false));
}
