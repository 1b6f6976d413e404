//! Session relay integration tests
//!
//! Run against a scripted upstream so every response is under test control.

use std::time::Duration;

use beacon_duplex::protocol::{ControlEvent, Envelope};
use beacon_duplex::relay::StatusChange;
use beacon_duplex::voice::PlaybackScheduler;
use beacon_duplex::voice::pcm::encode_pcm16;
use beacon_duplex::{
    ClientChannel, Error, RelayOptions, ResponseChunk, SessionRelay, SessionStatus, TeardownReason,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

mod common;
use common::{ManualOutput, ScriptedUpstream, next_control, tagged_frame};

fn relay(upstream: &ScriptedUpstream) -> SessionRelay {
    SessionRelay::new(upstream.service(), RelayOptions::default())
}

async fn open(relay: &SessionRelay) -> (String, tokio::sync::mpsc::Receiver<Envelope>) {
    let (client, mut rx) = ClientChannel::bounded(16);
    let id = relay.create_session(client).await.unwrap();
    let started = next_control(&mut rx).await;
    assert_eq!(started.event, ControlEvent::SessionStarted);
    assert_eq!(started.session_id.as_deref(), Some(id.as_str()));
    (id, rx)
}

async fn wait_closed(changes: &mut broadcast::Receiver<StatusChange>, id: &str) {
    loop {
        let change = changes.recv().await.unwrap();
        if change.session_id == id && change.to == SessionStatus::Closed {
            return;
        }
    }
}

#[tokio::test]
async fn frames_are_forwarded_in_order_and_responses_play_gaplessly() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (id, mut rx) = open(&relay).await;

    let frames: Vec<_> = (0..3).map(|i| tagged_frame(i, i)).collect();
    for frame in &frames {
        assert!(relay.on_client_frame(&id, frame.clone()).await);
    }

    let received = upstream.wait_received(3).await;
    let sent: Vec<_> = frames.iter().map(|f| f.pcm.clone()).collect();
    assert_eq!(received, sent);

    upstream.respond(0, ResponseChunk::Audio(encode_pcm16(&vec![0.25; 2400])));
    upstream.respond(0, ResponseChunk::Audio(encode_pcm16(&vec![-0.25; 2400])));

    let output = ManualOutput::new(24_000);
    let mut playback = PlaybackScheduler::new(output.clone());
    playback.start().unwrap();

    for expected_seq in 0..2 {
        let Some(Envelope::Audio(payload)) = rx.recv().await else {
            panic!("expected response audio");
        };
        assert_eq!(payload.seq, expected_seq);
        assert_eq!(payload.timestamp_ms, expected_seq * 100);
        assert_eq!(payload.sample_rate, 24_000);
        let frame = payload.to_frame().unwrap();
        assert!(playback.queue().enqueue_pcm16(&frame.pcm).unwrap().is_some());
    }

    let rendered = output.render(6000);
    assert_eq!(output.spans(), vec![(0, 2400), (2400, 4800)]);
    assert!(rendered[2399] > 0.2);
    assert!(rendered[2400] < -0.2);
    assert!(rendered[4800..].iter().all(|s| *s == 0.0));
    assert_eq!(playback.stats().played(), 2);
}

#[tokio::test]
async fn text_responses_reach_the_client() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (id, mut rx) = open(&relay).await;

    upstream.respond(0, ResponseChunk::Text("hello there".to_string()));

    let Some(Envelope::Text(payload)) = rx.recv().await else {
        panic!("expected text");
    };
    assert_eq!(payload.text, "hello there");
    assert_eq!(payload.session_id.as_deref(), Some(id.as_str()));
}

#[tokio::test]
async fn rejected_handshake_never_activates() {
    let upstream = ScriptedUpstream::rejecting("no capacity");
    let relay = relay(&upstream);
    let mut changes = relay.subscribe();
    let (client, mut rx) = ClientChannel::bounded(16);

    let err = relay.create_session(client).await.unwrap_err();
    assert!(matches!(err, Error::UpstreamUnavailable(_)));

    let msg = next_control(&mut rx).await;
    assert_eq!(msg.event, ControlEvent::SessionError);
    assert_eq!(msg.payload_str("code"), Some("upstream_unavailable"));

    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push((change.from, change.to));
    }
    assert_eq!(
        seen,
        vec![
            (SessionStatus::Idle, SessionStatus::Initializing),
            (SessionStatus::Initializing, SessionStatus::Closed),
        ]
    );
    assert_eq!(relay.active_sessions().await, 0);
}

#[tokio::test(start_paused = true)]
async fn idle_session_expires_and_a_new_one_can_start() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (id, mut rx) = open(&relay).await;
    let opened_at = Instant::now();

    let msg = next_control(&mut rx).await;
    assert_eq!(msg.event, ControlEvent::SessionExpired);
    assert_eq!(msg.session_id.as_deref(), Some(id.as_str()));
    assert_eq!(msg.payload_str("reason"), Some("idle_timeout"));
    assert!(opened_at.elapsed() >= Duration::from_secs(60));

    assert_eq!(upstream.closes(), 1);
    assert_eq!(relay.status(&id).await, None);

    let (second, _rx) = open(&relay).await;
    assert_ne!(second, id);
    assert_eq!(upstream.sessions(), 2);
}

#[tokio::test(start_paused = true)]
async fn client_activity_defers_idle_expiry() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (id, mut rx) = open(&relay).await;
    let opened_at = Instant::now();

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert!(relay.on_client_frame(&id, tagged_frame(0, 0)).await);

    tokio::time::sleep(Duration::from_secs(40)).await;
    assert_eq!(relay.status(&id).await, Some(SessionStatus::Active));

    let msg = next_control(&mut rx).await;
    assert_eq!(msg.payload_str("reason"), Some("idle_timeout"));
    assert!(opened_at.elapsed() >= Duration::from_secs(100));
}

#[tokio::test]
async fn teardown_runs_once() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (id, mut rx) = open(&relay).await;

    assert!(relay.teardown(&id, TeardownReason::ClientRequested).await);
    assert!(!relay.teardown(&id, TeardownReason::ClientRequested).await);
    assert!(!relay.teardown(&id, TeardownReason::IdleTimeout).await);

    let msg = next_control(&mut rx).await;
    assert_eq!(msg.event, ControlEvent::SessionEnd);
    assert!(rx.try_recv().is_err());
    assert_eq!(upstream.closes(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_teardown_has_one_winner() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (id, _rx) = open(&relay).await;

    let (a, b, c) = tokio::join!(
        relay.teardown(&id, TeardownReason::ClientRequested),
        relay.teardown(&id, TeardownReason::ClientDisconnected),
        relay.teardown(&id, TeardownReason::Shutdown),
    );

    assert_eq!([a, b, c].iter().filter(|won| **won).count(), 1);
    assert_eq!(upstream.closes(), 1);
}

#[tokio::test]
async fn frames_after_teardown_are_dropped() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (id, _rx) = open(&relay).await;

    relay.teardown(&id, TeardownReason::ClientRequested).await;

    assert!(!relay.on_client_frame(&id, tagged_frame(0, 0)).await);
    assert!(!relay.on_client_frame("no-such-session", tagged_frame(1, 1)).await);
    assert!(upstream.received().is_empty());
}

#[tokio::test]
async fn upstream_end_expires_the_session() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (id, mut rx) = open(&relay).await;

    upstream.end(0);

    let msg = next_control(&mut rx).await;
    assert_eq!(msg.event, ControlEvent::SessionExpired);
    assert_eq!(msg.payload_str("reason"), Some("upstream_terminated"));
    assert_eq!(relay.status(&id).await, None);
    assert_eq!(upstream.closes(), 1);
}

#[tokio::test]
async fn upstream_failure_is_reported_as_transport_error() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (_id, mut rx) = open(&relay).await;

    upstream.fail(0, "connection reset");

    let msg = next_control(&mut rx).await;
    assert_eq!(msg.event, ControlEvent::SessionError);
    assert_eq!(msg.payload_str("code"), Some("transport_error"));
    assert!(msg.payload_str("message").unwrap().contains("connection reset"));
}

#[tokio::test]
async fn client_disconnect_releases_upstream() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let mut changes = relay.subscribe();
    let (id, rx) = open(&relay).await;

    drop(rx);
    wait_closed(&mut changes, &id).await;

    assert_eq!(upstream.closes(), 1);
    assert_eq!(relay.active_sessions().await, 0);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_handshake_abandons_session() {
    let upstream = ScriptedUpstream::slow(Duration::from_secs(5));
    let relay = relay(&upstream);
    let mut changes = relay.subscribe();
    let (client, rx) = ClientChannel::bounded(16);

    let pending = tokio::spawn({
        let relay = relay.clone();
        async move { relay.create_session(client).await }
    });
    tokio::task::yield_now().await;
    drop(rx);

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(upstream.sessions(), 0);
    assert_eq!(relay.active_sessions().await, 0);

    let mut seen = Vec::new();
    while let Ok(change) = changes.try_recv() {
        seen.push(change.to);
    }
    assert_eq!(seen, vec![SessionStatus::Initializing, SessionStatus::Closed]);
}

#[tokio::test(start_paused = true)]
async fn slow_client_loses_chunks_without_stalling() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (client, mut rx) = ClientChannel::bounded(1);
    let id = relay.create_session(client).await.unwrap();
    let _started = next_control(&mut rx).await;

    for _ in 0..10 {
        upstream.respond(0, ResponseChunk::Audio(encode_pcm16(&[0.1; 240])));
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(relay.status(&id).await, Some(SessionStatus::Active));

    let Some(Envelope::Audio(first)) = rx.recv().await else {
        panic!("expected response audio");
    };
    assert_eq!(first.seq, 0);

    upstream.respond(0, ResponseChunk::Audio(encode_pcm16(&[0.1; 240])));
    let Some(Envelope::Audio(next)) = rx.recv().await else {
        panic!("expected response audio");
    };
    assert_eq!(next.seq, 10);
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_handshake_closes_the_late_session() {
    let upstream = ScriptedUpstream::slow(Duration::from_secs(5));
    let relay = relay(&upstream);
    let (client, mut rx) = ClientChannel::bounded(16);

    let pending = tokio::spawn({
        let relay = relay.clone();
        async move { relay.create_session(client).await }
    });
    while relay.active_sessions().await == 0 {
        tokio::task::yield_now().await;
    }

    relay.shutdown().await;

    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(upstream.sessions(), 1);
    assert_eq!(upstream.closes(), 1);

    let msg = next_control(&mut rx).await;
    assert_eq!(msg.event, ControlEvent::SessionEnd);
    assert_eq!(msg.payload_str("reason"), Some("server_shutdown"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn no_response_follows_the_end_notification() {
    let upstream = ScriptedUpstream::new();
    let relay = relay(&upstream);
    let (client, mut rx) = ClientChannel::bounded(1024);
    let id = relay.create_session(client).await.unwrap();
    let _started = next_control(&mut rx).await;

    let flood = tokio::spawn({
        let upstream = upstream.clone();
        async move {
            for _ in 0..500 {
                upstream.respond(0, ResponseChunk::Audio(encode_pcm16(&[0.1; 64])));
                tokio::task::yield_now().await;
            }
        }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(relay.teardown(&id, TeardownReason::ClientRequested).await);
    flood.await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut after_end = 0;
    let mut ended = false;
    while let Ok(envelope) = rx.try_recv() {
        match envelope {
            Envelope::Control(msg) if msg.event == ControlEvent::SessionEnd => ended = true,
            Envelope::Audio(_) if ended => after_end += 1,
            _ => {}
        }
    }
    assert!(ended);
    assert_eq!(after_end, 0);
}
