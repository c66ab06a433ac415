use super::*;
use crate::core::connection::loopback::LoopbackNetwork;
use crate::core::media::synthetic::SyntheticMediaProvider;
use crate::core::media::MediaTrack;
use crate::core::protocol::TransferDirection;
use crate::core::signaling::LoopbackRelay;
use crate::core::types::{ConnectionKind, FacingMode, PeerConnectionState, Role};
use bytes::Bytes;
use serde_json::json;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

struct Node {
    engine: Engine,
    events: UnboundedReceiver<EngineEvent>,
    media: Arc<SyntheticMediaProvider>,
}

fn node(network: &LoopbackNetwork, relay: &LoopbackRelay, id: &str, config: EngineConfig) -> Node {
    let media = Arc::new(SyntheticMediaProvider::new());
    let engine = Engine::new(
        id,
        config,
        Arc::new(network.factory(id)),
        relay.endpoint(id),
        media.clone(),
    )
    .unwrap();
    relay.register(id, engine.clone());
    let events = engine.subscribe();
    Node {
        engine,
        events,
        media,
    }
}

/// "a" was already present when "b" arrived, so "a" is polite.
async fn connected_pair(network: &LoopbackNetwork, config: EngineConfig) -> (Node, Node) {
    let relay = LoopbackRelay::new();
    let a = node(network, &relay, "a", config.clone());
    let b = node(network, &relay, "b", config);
    a.engine.join_peer("b", true, json!({"name": "bob"})).await.unwrap();
    b.engine.join_peer("a", false, json!({"name": "alice"})).await.unwrap();
    wait_peer(&a.engine, "b", "a sees b connected", |p| {
        p.is_some_and(|p| p.connection == PeerConnectionState::Connected)
    })
    .await;
    wait_peer(&b.engine, "a", "b sees a connected", |p| {
        p.is_some_and(|p| p.connection == PeerConnectionState::Connected)
    })
    .await;
    (a, b)
}

async fn wait_peer(
    engine: &Engine,
    id: &str,
    what: &str,
    check: impl Fn(Option<&PeerSnapshot>) -> bool,
) -> Option<PeerSnapshot> {
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = engine.peer(id).await.unwrap();
        if check(snapshot.as_ref()) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "timed out: {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_event(
    events: &mut UnboundedReceiver<EngineEvent>,
    what: &str,
    check: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(event) if check(&event) => return event,
                Some(_) => continue,
                None => panic!("event stream closed while waiting for {what}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out: {what}"))
}

fn drain(events: &mut UnboundedReceiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn payload(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

// ── Sessions ──

#[tokio::test]
async fn join_assigns_opposite_roles_and_opens_control_channel() {
    let network = LoopbackNetwork::new();
    let (a, mut b) = connected_pair(&network, EngineConfig::default()).await;

    let ab = a.engine.peer("b").await.unwrap().unwrap();
    let ba = b.engine.peer("a").await.unwrap().unwrap();
    assert_eq!(ab.role, Role::Polite);
    assert_eq!(ba.role, Role::Impolite);
    assert_eq!(ba.info, json!({"name": "alice"}));

    // The control channel is opened once the link is up; retry until it is.
    let deadline = Instant::now() + WAIT;
    loop {
        a.engine
            .send_control_message(Target::Peer("b".into()), json!({"hello": "world"}))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let got = drain(&mut b.events).into_iter().find_map(|e| match e {
            EngineEvent::ControlMessage { from, text } => Some((from, text)),
            _ => None,
        });
        if let Some((from, text)) = got {
            assert_eq!(from, "a");
            assert_eq!(serde_json::from_str::<serde_json::Value>(&text).unwrap(), json!({"hello": "world"}));
            break;
        }
        assert!(Instant::now() < deadline, "control message never arrived");
    }
}

#[tokio::test]
async fn repeated_join_keeps_the_live_session() {
    let network = LoopbackNetwork::new();
    let (a, _b) = connected_pair(&network, EngineConfig::default()).await;

    a.engine.join_peer("b", false, json!({"name": "mallory"})).await.unwrap();
    let ab = a.engine.peer("b").await.unwrap().unwrap();
    assert_eq!(ab.role, Role::Polite);
    assert_eq!(ab.info, json!({"name": "bob"}));
    assert_eq!(ab.connection, PeerConnectionState::Connected);
    assert_eq!(a.engine.peers().await.unwrap().len(), 1);
}

#[tokio::test]
async fn rejoin_replaces_a_dead_session() {
    let network = LoopbackNetwork::new();
    let (a, b) = connected_pair(&network, EngineConfig::default()).await;

    b.engine.leave_peer("a").await.unwrap();
    assert!(b.engine.peer("a").await.unwrap().is_none());
    wait_peer(&a.engine, "b", "a sees the link drop", |p| {
        p.is_some_and(|p| p.connection == PeerConnectionState::Disconnected)
    })
    .await;

    a.engine.join_peer("b", true, serde_json::Value::Null).await.unwrap();
    wait_peer(&a.engine, "b", "fresh session connects", |p| {
        p.is_some_and(|p| p.connection == PeerConnectionState::Connected)
    })
    .await;
    let ba = wait_peer(&b.engine, "a", "b recreated a session", |p| p.is_some()).await;
    assert_eq!(ba.unwrap().role, Role::Impolite);
}

#[tokio::test]
async fn invalid_relay_payloads_are_ignored() {
    let network = LoopbackNetwork::new();
    let relay = LoopbackRelay::new();
    let a = node(&network, &relay, "a", EngineConfig::default());

    for bad in ["not json", r#"{"bogus":1}"#, r#"{"offer":{"type":"offer","sdp":"x"},"answer":{"type":"answer","sdp":"y"}}"#] {
        a.engine.on_socket_message(bad.into(), "x", None).await.unwrap();
    }
    assert!(a.engine.peers().await.unwrap().is_empty());

    // A candidate from an unknown participant creates a session for it.
    let candidate = r#"{"iceCandidate":{"candidate":"candidate:1 1 udp 1 10.0.0.1 9 typ host","sdpMid":"0","sdpMLineIndex":0},"forScreenShare":false}"#;
    a.engine
        .on_socket_message(candidate.into(), "z", Some(json!({"name": "zed"})))
        .await
        .unwrap();
    let az = a.engine.peer("z").await.unwrap().unwrap();
    assert_eq!(az.role, Role::Impolite);
    assert_eq!(az.info, json!({"name": "zed"}));
}

#[tokio::test]
async fn ice_failure_restarts_then_recovers() {
    let network = LoopbackNetwork::new();
    let (a, _b) = connected_pair(&network, EngineConfig::default()).await;

    assert!(network.fail_ice("a", "b", ConnectionKind::Media));
    wait_until("restart offer reaches b", || {
        network.restart_offers("b", "a", ConnectionKind::Media) == 1
    })
    .await;
    let ab = a.engine.peer("b").await.unwrap().unwrap();
    assert_eq!(ab.connection, PeerConnectionState::Connected);
}

#[tokio::test]
async fn ice_failure_past_the_limit_tears_down() {
    let network = LoopbackNetwork::new();
    let config = EngineConfig {
        ice_restart_limit: 0,
        ..EngineConfig::default()
    };
    let (mut a, _b) = connected_pair(&network, config).await;

    network.fail_ice("a", "b", ConnectionKind::Media);
    next_event(&mut a.events, "negotiation error", |e| {
        matches!(e, EngineEvent::Error(EngineError::Negotiation { peer, .. }) if peer == "b")
    })
    .await;
    assert!(a.engine.peer("b").await.unwrap().is_none());
}

#[tokio::test]
async fn shutdown_stops_the_engine() {
    let network = LoopbackNetwork::new();
    let (a, b) = connected_pair(&network, EngineConfig::default()).await;

    a.engine.start_audio().await.unwrap();
    let track = a.media.last(MediaSource::Microphone).unwrap();
    a.engine.shutdown().await.unwrap();

    assert!(track.is_stopped());
    assert_eq!(a.engine.peers().await.unwrap_err(), EngineError::System);
    wait_peer(&b.engine, "a", "b sees a go away", |p| {
        p.is_some_and(|p| p.connection == PeerConnectionState::Disconnected)
    })
    .await;
}

// ── Media ──

#[tokio::test]
async fn simultaneous_camera_start_converges() {
    let network = LoopbackNetwork::new();
    let (a, b) = connected_pair(&network, EngineConfig::default()).await;

    let (ra, rb) = tokio::join!(a.engine.start_camera(None), b.engine.start_camera(None));
    ra.unwrap();
    rb.unwrap();

    wait_peer(&a.engine, "b", "a sees b's camera", |p| p.is_some_and(|p| p.is_video_on)).await;
    wait_peer(&b.engine, "a", "b sees a's camera", |p| p.is_some_and(|p| p.is_video_on)).await;

    let a_cam = a.media.last(MediaSource::Camera).unwrap().id();
    let b_cam = b.media.last(MediaSource::Camera).unwrap().id();
    assert_eq!(network.sender_tracks("a", "b", ConnectionKind::Media), vec![a_cam]);
    assert_eq!(network.sender_tracks("b", "a", ConnectionKind::Media), vec![b_cam]);
    assert!(a.engine.is_local_video_on().await.unwrap());
}

#[tokio::test]
async fn restarting_camera_replaces_the_sent_track() {
    let network = LoopbackNetwork::new();
    let (a, b) = connected_pair(&network, EngineConfig::default()).await;

    a.engine.start_camera(None).await.unwrap();
    let first = a.media.last(MediaSource::Camera).unwrap();
    let seen = wait_peer(&b.engine, "a", "camera arrives", |p| p.is_some_and(|p| p.is_video_on))
        .await
        .unwrap();
    let remote_id = seen.video.unwrap().id();

    a.engine.start_camera(None).await.unwrap();
    let second = a.media.last(MediaSource::Camera).unwrap();
    assert!(first.is_stopped());
    assert_eq!(
        network.sender_tracks("a", "b", ConnectionKind::Media),
        vec![second.id()]
    );
    let ba = b.engine.peer("a").await.unwrap().unwrap();
    assert_eq!(ba.video.unwrap().id(), remote_id);

    a.engine.stop_camera().await.unwrap();
    assert!(network.sender_tracks("a", "b", ConnectionKind::Media).is_empty());
    wait_peer(&b.engine, "a", "camera cleared", |p| {
        p.is_some_and(|p| !p.is_video_on && p.video.is_none())
    })
    .await;
}

#[tokio::test]
async fn tracks_started_before_join_are_attached() {
    let network = LoopbackNetwork::new();
    let relay = LoopbackRelay::new();
    let a = node(&network, &relay, "a", EngineConfig::default());
    let b = node(&network, &relay, "b", EngineConfig::default());

    a.engine.start_audio().await.unwrap();
    a.engine.join_peer("b", true, serde_json::Value::Null).await.unwrap();
    b.engine.join_peer("a", false, serde_json::Value::Null).await.unwrap();

    wait_peer(&b.engine, "a", "audio arrives", |p| p.is_some_and(|p| p.is_audio_on)).await;
    assert!(a.engine.is_local_audio_on().await.unwrap());

    a.engine.toggle_audio().await.unwrap();
    assert!(!a.engine.is_local_audio_on().await.unwrap());
    wait_peer(&b.engine, "a", "audio stops", |p| p.is_some_and(|p| !p.is_audio_on)).await;
}

#[tokio::test]
async fn capture_failure_is_a_device_error() {
    let network = LoopbackNetwork::new();
    let relay = LoopbackRelay::new();
    let mut a = node(&network, &relay, "a", EngineConfig::default());

    a.media.set_failing(MediaSource::Camera, true);
    a.engine.start_camera(None).await.unwrap();
    next_event(&mut a.events, "device error", |e| {
        matches!(e, EngineEvent::Error(EngineError::Device { kind: MediaSource::Camera, .. }))
    })
    .await;
    assert!(!a.engine.is_local_video_on().await.unwrap());
}

#[tokio::test]
async fn screen_share_handshake_and_capture_end() {
    let network = LoopbackNetwork::new();
    let (mut a, b) = connected_pair(&network, EngineConfig::default()).await;

    a.engine.start_screen_share().await.unwrap();
    let screen = a.media.last(MediaSource::Screen).unwrap();
    wait_peer(&b.engine, "a", "screen arrives", |p| {
        p.is_some_and(|p| p.is_screen_share_on && !p.is_video_on)
    })
    .await;
    assert_eq!(
        network.sender_tracks("a", "b", ConnectionKind::Screen),
        vec![screen.id()]
    );
    assert!(network.sender_tracks("a", "b", ConnectionKind::Media).is_empty());

    // User pressed the OS "stop sharing" button.
    screen.end();
    next_event(&mut a.events, "local screen off", |e| {
        matches!(e, EngineEvent::LocalMediaChanged { source: MediaSource::Screen, on: false, .. })
    })
    .await;
    assert!(!a.engine.is_local_screen_share_on().await.unwrap());
    wait_peer(&b.engine, "a", "screen cleared", |p| {
        p.is_some_and(|p| !p.is_screen_share_on && p.screen.is_none())
    })
    .await;
}

#[tokio::test]
async fn switch_camera_restarts_with_flipped_facing() {
    let network = LoopbackNetwork::new();
    let relay = LoopbackRelay::new();
    let config = EngineConfig {
        camera_switch_delay_ms: 20,
        ..EngineConfig::default()
    };
    let a = node(&network, &relay, "a", config);

    // Idle camera only flips the preference.
    a.engine.switch_camera().await.unwrap();
    assert_eq!(a.media.issued_count(MediaSource::Camera), 0);

    a.engine.start_camera(None).await.unwrap();
    a.engine.switch_camera().await.unwrap();
    wait_until("camera restarted", || a.media.issued_count(MediaSource::Camera) == 2).await;

    let requests = a.media.camera_requests();
    assert_eq!(requests[0].facing, FacingMode::Environment);
    assert_eq!(requests[1].facing, FacingMode::User);
    assert!(a.engine.is_local_video_on().await.unwrap());
}

#[tokio::test]
async fn stop_during_switch_keeps_the_camera_off() {
    let network = LoopbackNetwork::new();
    let relay = LoopbackRelay::new();
    let config = EngineConfig {
        camera_switch_delay_ms: 50,
        ..EngineConfig::default()
    };
    let a = node(&network, &relay, "a", config);

    a.engine.start_camera(None).await.unwrap();
    a.engine.switch_camera().await.unwrap();
    a.engine.stop_camera().await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(!a.engine.is_local_video_on().await.unwrap());
    assert_eq!(a.media.issued_count(MediaSource::Camera), 1);
}

#[tokio::test]
async fn start_during_switch_keeps_the_new_track() {
    let network = LoopbackNetwork::new();
    let relay = LoopbackRelay::new();
    let config = EngineConfig {
        camera_switch_delay_ms: 50,
        ..EngineConfig::default()
    };
    let a = node(&network, &relay, "a", config);

    a.engine.start_camera(None).await.unwrap();
    a.engine.switch_camera().await.unwrap();
    a.engine.start_camera(None).await.unwrap();
    let started = a.media.last(MediaSource::Camera).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(a.media.issued_count(MediaSource::Camera), 2);
    assert!(!started.is_stopped());
    assert!(a.engine.is_local_video_on().await.unwrap());
}

// ── Files ──

#[tokio::test]
async fn large_file_arrives_intact_under_the_high_water_mark() {
    let network = LoopbackNetwork::with_drain_rate(16 * 1024 * 1024);
    let config = EngineConfig {
        chunk_size: 10 * 1024,
        high_water_mark: 1024 * 1024,
        ..EngineConfig::default()
    };
    let (mut a, mut b) = connected_pair(&network, config).await;
    wait_until_control_open(&a, "b").await;
    let data = payload(3 * 1024 * 1024);

    let file_id = a
        .engine
        .send_file("b", FileSource::Bytes { name: "blob.bin".into(), data: data.clone() })
        .await
        .unwrap();

    let received = next_event(&mut b.events, "incoming completion", |e| {
        matches!(e, EngineEvent::TransferCompleted { direction: TransferDirection::Incoming, .. })
    })
    .await;
    let sent = next_event(&mut a.events, "outgoing completion", |e| {
        matches!(e, EngineEvent::TransferCompleted { direction: TransferDirection::Outgoing, .. })
    })
    .await;

    let (EngineEvent::TransferCompleted { transfer: rt, digest: rd, data: Some(bytes), .. },
         EngineEvent::TransferCompleted { transfer: st, digest: sd, data: None, .. }) = (received, sent)
    else {
        panic!("unexpected completion shape");
    };
    assert_eq!(rt.file_id, file_id);
    assert_eq!(st.file_id, file_id);
    assert_eq!(rt.peer_id, "a");
    assert_eq!(rt.progress, 100.0);
    assert_eq!(st.progress, 100.0);
    assert_eq!(bytes.len(), data.len());
    assert_eq!(bytes, data);
    assert_eq!(rd, sd);
    assert!(network.max_buffered() <= 1024 * 1024, "buffer peaked at {}", network.max_buffered());
}

#[tokio::test]
async fn empty_file_completes_without_a_channel() {
    let network = LoopbackNetwork::new();
    let (mut a, mut b) = connected_pair(&network, EngineConfig::default()).await;
    wait_until_control_open(&a, "b").await;

    a.engine
        .send_file("b", FileSource::Bytes { name: "empty".into(), data: Bytes::new() })
        .await
        .unwrap();
    let got = next_event(&mut b.events, "incoming completion", |e| {
        matches!(e, EngineEvent::TransferCompleted { direction: TransferDirection::Incoming, .. })
    })
    .await;
    match got {
        EngineEvent::TransferCompleted { transfer, data, .. } => {
            assert_eq!(transfer.progress, 100.0);
            assert_eq!(data.unwrap().len(), 0);
        }
        _ => unreachable!(),
    }
    next_event(&mut a.events, "outgoing completion", |e| {
        matches!(e, EngineEvent::TransferCompleted { direction: TransferDirection::Outgoing, .. })
    })
    .await;
}

#[tokio::test]
async fn filtered_file_is_rejected() {
    let network = LoopbackNetwork::new();
    let (mut a, mut b) = connected_pair(&network, EngineConfig::default()).await;
    wait_until_control_open(&a, "b").await;
    b.engine
        .set_file_request_filter(|name, _from| !name.ends_with(".exe"))
        .await
        .unwrap();

    let file_id = a
        .engine
        .send_file("b", FileSource::Bytes { name: "setup.exe".into(), data: payload(100) })
        .await
        .unwrap();
    next_event(&mut a.events, "rejection", |e| {
        matches!(e, EngineEvent::Error(EngineError::Transfer { file_id: id, .. }) if *id == file_id)
    })
    .await;
    assert!(!drain(&mut b.events)
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferCompleted { .. } | EngineEvent::TransferProgress { .. })));
}

#[tokio::test]
async fn leaving_mid_transfer_reports_one_error_and_stops_progress() {
    let network = LoopbackNetwork::with_drain_rate(256 * 1024);
    let config = EngineConfig {
        chunk_size: 16 * 1024,
        high_water_mark: 64 * 1024,
        ..EngineConfig::default()
    };
    let (mut a, _b) = connected_pair(&network, config).await;
    wait_until_control_open(&a, "b").await;

    let file_id = a
        .engine
        .send_file("b", FileSource::Bytes { name: "slow.bin".into(), data: payload(1024 * 1024) })
        .await
        .unwrap();
    next_event(&mut a.events, "first progress", |e| {
        matches!(e, EngineEvent::TransferProgress { direction: TransferDirection::Outgoing, .. })
    })
    .await;

    a.engine.leave_peer("b").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = drain(&mut a.events);

    let errors: Vec<usize> = after
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, EngineEvent::Error(EngineError::Transfer { file_id: id, .. }) if *id == file_id))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(errors.len(), 1, "events: {after:?}");
    assert!(!after[errors[0]..]
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferProgress { .. } | EngineEvent::TransferCompleted { .. })));
    assert!(a.engine.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn receiver_leaving_mid_transfer_reports_one_error_and_stops_progress() {
    let network = LoopbackNetwork::with_drain_rate(256 * 1024);
    let config = EngineConfig {
        chunk_size: 16 * 1024,
        high_water_mark: 64 * 1024,
        ..EngineConfig::default()
    };
    let (a, mut b) = connected_pair(&network, config).await;
    wait_until_control_open(&a, "b").await;

    let file_id = a
        .engine
        .send_file("b", FileSource::Bytes { name: "slow.bin".into(), data: payload(1024 * 1024) })
        .await
        .unwrap();
    next_event(&mut b.events, "first incoming progress", |e| {
        matches!(e, EngineEvent::TransferProgress { direction: TransferDirection::Incoming, .. })
    })
    .await;

    b.engine.leave_peer("a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    let after = drain(&mut b.events);

    let errors: Vec<usize> = after
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, EngineEvent::Error(EngineError::Transfer { file_id: id, .. }) if *id == file_id))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(errors.len(), 1, "events: {after:?}");
    assert!(!after[errors[0]..]
        .iter()
        .any(|e| matches!(e, EngineEvent::TransferProgress { .. } | EngineEvent::TransferCompleted { .. })));
    assert!(b.engine.peers().await.unwrap().is_empty());
}

#[tokio::test]
async fn control_message_to_unknown_peer_is_a_channel_error() {
    let network = LoopbackNetwork::new();
    let relay = LoopbackRelay::new();
    let mut a = node(&network, &relay, "a", EngineConfig::default());

    a.engine
        .send_control_message(Target::Peer("ghost".into()), json!({"x": 1}))
        .await
        .unwrap();
    next_event(&mut a.events, "channel error", |e| {
        matches!(e, EngineEvent::Error(EngineError::Channel { peer, .. }) if peer == "ghost")
    })
    .await;
}

/// Ping until an application message gets through in the a -> b direction.
async fn wait_until_control_open(a: &Node, to: &str) {
    let deadline = Instant::now() + WAIT;
    let mut probe = a.engine.subscribe();
    loop {
        a.engine
            .send_control_message(Target::Peer(to.into()), json!({"probe": true}))
            .await
            .unwrap();
        let failed = drain(&mut probe)
            .iter()
            .any(|e| matches!(e, EngineEvent::Error(EngineError::Channel { .. })));
        if !failed {
            return;
        }
        assert!(Instant::now() < deadline, "control channel never opened");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
