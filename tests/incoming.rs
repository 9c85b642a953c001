//
// Copyright 2026 Peerline Authors
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Tests of the callee side of a call session.

extern crate peerline;

#[macro_use]
extern crate log;

mod common;

use std::time::Duration;

use peerline::{
    common::{ApplicationEvent, CallMediaType, CallState, SessionId},
    core::{
        signaling::{Message, MessageType, Offer, OutboundSignal},
        store::SignalStore,
    },
    sim::PushMode,
    webrtc::MediaStream,
};

use common::{test_init, TestContext};

#[tokio::test(start_paused = true)]
async fn offer_rings_the_callee() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.caller.start_voice_call().unwrap();
    ctx.deliver().await;

    assert_eq!(ctx.callee_state(), CallState::Ringing);
    assert_eq!(ctx.callee.session_id().unwrap(), ctx.caller.session_id().unwrap());
    assert_eq!(ctx.callee_events.count(ApplicationEvent::IncomingRinging), 1);

    // Ringing opens no devices; media waits for the answer.
    assert_eq!(ctx.callee_platform.engine().streams_opened(), 0);
    assert!(!ctx.callee.has_local_stream().unwrap());
    assert!(ctx
        .callee_platform
        .analytics_events()
        .contains(&"call_received".to_string()));
}

// With the push channel down from the start, the poll path alone must
// deliver the offer, within roughly one poll interval.
#[tokio::test(start_paused = true)]
async fn poll_delivers_the_offer_when_subscribe_fails() {
    test_init();

    let ctx = TestContext::new(PushMode::SubscribeFails);
    ctx.caller.start_voice_call().unwrap();
    ctx.advance(Duration::from_millis(1300)).await;

    assert_eq!(ctx.callee_state(), CallState::Ringing);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::IncomingRinging), 1);
}

// The subscription looks healthy but silently drops everything; the
// poll path still carries the call end to end.
#[tokio::test(start_paused = true)]
async fn call_connects_over_a_lossy_push_channel() {
    test_init();

    let ctx = TestContext::new(PushMode::Lossy);
    ctx.connect_voice_call().await;

    assert_eq!(ctx.caller_state(), CallState::Connected);
    assert_eq!(ctx.callee_state(), CallState::Connected);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::IncomingRinging), 1);
}

#[tokio::test(start_paused = true)]
async fn video_call_answer_and_media_controls() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.caller.start_video_call().unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.callee_state(), CallState::Ringing);

    ctx.callee.answer_call(true).unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.caller_state(), CallState::Connected);
    assert_eq!(ctx.callee_state(), CallState::Connected);

    let stream = ctx.callee_platform.engine().local_stream(0).unwrap();
    assert!(stream.audio_enabled());
    assert!(stream.video_enabled());
    assert!(stream.front_camera());

    ctx.callee.toggle_video().unwrap();
    ctx.callee.switch_camera().unwrap();
    ctx.callee.synchronize().await.unwrap();
    assert!(!stream.video_enabled());
    assert!(!stream.front_camera());

    ctx.callee.toggle_audio().unwrap();
    ctx.callee.synchronize().await.unwrap();
    assert!(!stream.audio_enabled());
}

// Answering a video call with video declined downgrades the local
// stream to audio only.
#[tokio::test(start_paused = true)]
async fn video_call_can_be_answered_audio_only() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.caller.start_video_call().unwrap();
    ctx.deliver().await;

    ctx.callee.answer_call(false).unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.callee_state(), CallState::Connected);

    let stream = ctx.callee_platform.engine().local_stream(0).unwrap();
    assert!(stream.audio_enabled());
    assert!(!stream.video_enabled());
}

#[tokio::test(start_paused = true)]
async fn decline_ends_both_sides() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.caller.start_voice_call().unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.callee_state(), CallState::Ringing);

    ctx.callee.decline_call().unwrap();
    ctx.deliver().await;

    assert_eq!(ctx.callee_state(), CallState::Idle);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::EndedDeclined), 1);
    assert_eq!(ctx.callee_platform.engine().streams_opened(), 0);

    // The caller cannot tell a decline from no answer.
    assert_eq!(ctx.caller_state(), CallState::Idle);
    assert_eq!(ctx.caller_events.count(ApplicationEvent::EndedNoAnswer), 1);
    assert_eq!(ctx.caller_platform.notification_count_titled("No answer"), 1);
}

#[tokio::test(start_paused = true)]
async fn unanswered_incoming_call_auto_declines() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.caller.start_voice_call().unwrap();
    ctx.advance(Duration::from_millis(1200)).await;
    assert_eq!(ctx.callee_state(), CallState::Ringing);

    ctx.advance(Duration::from_secs(41)).await;

    assert_eq!(ctx.callee_state(), CallState::Idle);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::EndedMissed), 1);
    assert_eq!(ctx.callee_platform.notification_count_titled("Missed call"), 1);
    assert!(ctx
        .callee_platform
        .analytics_events()
        .contains(&"call_missed".to_string()));

    // The auto-decline was signaled back as a call-end.
    assert!(ctx
        .store
        .rows()
        .iter()
        .any(|r| r.sender_id == "ben" && r.typ == MessageType::CallEnd));

    // No stray timers left behind.
    ctx.advance(Duration::from_secs(60)).await;
    assert_eq!(ctx.callee_events.count(ApplicationEvent::EndedMissed), 1);
}

// The caller trickles its candidates right behind the offer, so they
// reach the callee while it is still ringing, before any peer
// connection exists to apply them to. They must all land once the call
// is answered.
#[tokio::test(start_paused = true)]
async fn candidates_arriving_before_answer_are_buffered() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.caller.start_voice_call().unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.callee_state(), CallState::Ringing);
    assert!(ctx
        .store
        .rows()
        .iter()
        .filter(|r| r.typ == MessageType::Ice && r.sender_id == "amy")
        .count() >= 2);

    ctx.callee.answer_call(false).unwrap();
    ctx.deliver().await;

    assert_eq!(ctx.callee_state(), CallState::Connected);
    let connection = ctx.callee_platform.engine().connection(0).unwrap();
    assert_eq!(connection.remote_candidates(), 2);
}

#[tokio::test(start_paused = true)]
async fn permission_denied_on_answer_declines_the_call() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.callee_platform.deny_microphone();

    ctx.caller.start_voice_call().unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.callee_state(), CallState::Ringing);

    ctx.callee.answer_call(false).unwrap();
    ctx.deliver().await;

    assert_eq!(ctx.callee_state(), CallState::Idle);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::EndedDeclined), 1);
    assert_eq!(
        ctx.callee_platform.notification_count_titled("Permission needed"),
        1
    );
    assert_eq!(ctx.callee_platform.engine().streams_opened(), 0);
    assert!(!ctx.callee_events.contains(ApplicationEvent::Connecting));

    assert_eq!(ctx.caller_state(), CallState::Idle);
    assert_eq!(ctx.caller_events.count(ApplicationEvent::EndedNoAnswer), 1);
}

// A second offer arriving during an active call is declined without
// touching the call in progress.
#[tokio::test(start_paused = true)]
async fn busy_callee_declines_a_second_offer() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.connect_voice_call().await;

    info!("test: injecting an offer from a third user");
    let intruder_session = SessionId::new(0x7777);
    ctx.store
        .append(
            &ctx.conversation_id,
            &"zed".to_string(),
            OutboundSignal {
                receiver_id: "ben".to_string(),
                session_id: intruder_session,
                call_type: CallMediaType::Audio,
                message: Message::Offer(Offer {
                    call_media_type: CallMediaType::Audio,
                    sdp: "v=0 intruder-offer".to_string(),
                }),
            },
        )
        .await
        .unwrap();
    ctx.deliver().await;

    // The active call is untouched; the intruder got a call-end.
    assert_eq!(ctx.callee_state(), CallState::Connected);
    assert_eq!(ctx.caller_state(), CallState::Connected);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::IncomingRinging), 1);
    assert!(ctx.store.rows().iter().any(|r| {
        r.typ == MessageType::CallEnd
            && r.receiver_id == "zed"
            && r.session_id == intruder_session
    }));
    assert_eq!(ctx.callee_platform.notification_count_titled("Missed call"), 1);
    assert!(ctx
        .callee_platform
        .analytics_events()
        .contains(&"call_missed_busy".to_string()));
}

// An offer for a session whose call-end was already seen must not ring:
// the store can hand rows back in any order.
#[tokio::test(start_paused = true)]
async fn offer_after_call_end_does_not_ring() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    let session_id = SessionId::new(0x9999);

    ctx.store
        .append(
            &ctx.conversation_id,
            &"amy".to_string(),
            OutboundSignal {
                receiver_id: "ben".to_string(),
                session_id,
                call_type: CallMediaType::Audio,
                message: Message::CallEnd,
            },
        )
        .await
        .unwrap();
    ctx.deliver().await;

    ctx.store
        .append(
            &ctx.conversation_id,
            &"amy".to_string(),
            OutboundSignal {
                receiver_id: "ben".to_string(),
                session_id,
                call_type: CallMediaType::Audio,
                message: Message::Offer(Offer {
                    call_media_type: CallMediaType::Audio,
                    sdp: "v=0 stale-offer".to_string(),
                }),
            },
        )
        .await
        .unwrap();
    ctx.deliver().await;

    assert_eq!(ctx.callee_state(), CallState::Idle);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::IncomingRinging), 0);
    assert_eq!(ctx.callee_platform.engine().streams_opened(), 0);
}

#[tokio::test(start_paused = true)]
async fn answer_and_decline_require_a_ringing_call() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    assert!(ctx.callee.answer_call(false).is_err());
    assert!(ctx.callee.decline_call().is_err());

    ctx.connect_voice_call().await;
    assert!(ctx.callee.answer_call(false).is_err());
    assert!(ctx.callee.decline_call().is_err());
    assert_eq!(ctx.callee_state(), CallState::Connected);
}

// Hanging up a still-ringing incoming call must signal the caller: the
// callee never sent an offer or answer, but it knows the remote party,
// and the caller must not be left ringing out its full timeout.
#[tokio::test(start_paused = true)]
async fn end_call_while_ringing_stops_the_caller() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.caller.start_voice_call().unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.callee_state(), CallState::Ringing);

    ctx.callee.end_call().unwrap();
    ctx.deliver().await;

    assert_eq!(ctx.callee_state(), CallState::Idle);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::EndedLocalHangup), 1);
    assert!(ctx
        .store
        .rows()
        .iter()
        .any(|r| r.sender_id == "ben" && r.typ == MessageType::CallEnd));

    // The caller resolved immediately, not at its 45s timer.
    assert_eq!(ctx.caller_state(), CallState::Idle);
    assert_eq!(ctx.caller_events.count(ApplicationEvent::EndedNoAnswer), 1);

    ctx.advance(Duration::from_secs(50)).await;
    assert_eq!(ctx.caller_events.count(ApplicationEvent::EndedNoAnswer), 1);
}

#[tokio::test(start_paused = true)]
async fn remote_hangup_during_ring_is_a_missed_call() {
    test_init();

    let ctx = TestContext::new(PushMode::Healthy);
    ctx.caller.start_voice_call().unwrap();
    ctx.deliver().await;
    assert_eq!(ctx.callee_state(), CallState::Ringing);

    ctx.caller.end_call().unwrap();
    ctx.deliver().await;

    assert_eq!(ctx.callee_state(), CallState::Idle);
    assert_eq!(ctx.callee_events.count(ApplicationEvent::EndedRemoteHangup), 1);
    assert_eq!(ctx.callee_platform.notification_count_titled("Missed call"), 1);
}
