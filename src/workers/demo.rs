//! Two engines in one process: join, share media, send a file.

use crate::workers::args::{Args, Backend};
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use peermesh::core::connection::loopback::LoopbackNetwork;
use peermesh::core::connection::webrtc::{RtcConnectionFactory, RtcMediaProvider};
use peermesh::core::connection::PeerConnectionFactory;
use peermesh::core::engine::Target;
use peermesh::core::error::EngineError;
use peermesh::core::media::synthetic::SyntheticMediaProvider;
use peermesh::core::media::MediaProvider;
use peermesh::core::pipeline::FileSource;
use peermesh::core::protocol::TransferDirection;
use peermesh::core::signaling::LoopbackRelay;
use peermesh::core::types::PeerConnectionState;
use peermesh::utils::hash::{sha3_256, to_hex};
use peermesh::utils::sos::SignalOfStop;
use peermesh::{Engine, EngineEvent};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

const ALICE: &str = "alice";
const BOB: &str = "bob";
const POLL: Duration = Duration::from_millis(20);
const HELLO_WAIT: Duration = Duration::from_millis(250);

pub async fn run(args: Args, sos: SignalOfStop) -> Result<()> {
    let relay = LoopbackRelay::new();
    let (alice, bob) = build_pair(&args, &relay)?;
    spawn_event_log(&alice);
    spawn_event_log(&bob);

    let outcome = sos.select(session(&args, &alice, &bob)).await;

    relay.unregister(ALICE);
    relay.unregister(BOB);
    for engine in [&alice, &bob] {
        if let Err(e) = engine.shutdown().await {
            debug!(event = "engine_already_stopped", local = engine.local_id(), error = %e);
        }
    }

    match outcome {
        Some(result) => result,
        None => {
            warn!(event = "demo_interrupted", "Stopped before the transfer finished");
            Ok(())
        }
    }
}

fn build_pair(args: &Args, relay: &LoopbackRelay) -> Result<(Engine, Engine)> {
    type Backends = (
        Arc<dyn PeerConnectionFactory>,
        Arc<dyn PeerConnectionFactory>,
        Arc<dyn MediaProvider>,
        Arc<dyn MediaProvider>,
    );

    let (alice_factory, bob_factory, alice_media, bob_media): Backends = match args.backend {
        Backend::Loopback => {
            let network = LoopbackNetwork::new();
            (
                Arc::new(network.factory(ALICE)),
                Arc::new(network.factory(BOB)),
                Arc::new(SyntheticMediaProvider::new()),
                Arc::new(SyntheticMediaProvider::new()),
            )
        }
        Backend::Webrtc => {
            let factory: Arc<dyn PeerConnectionFactory> = Arc::new(RtcConnectionFactory::new()?);
            (
                factory.clone(),
                factory,
                Arc::new(RtcMediaProvider::new()),
                Arc::new(RtcMediaProvider::new()),
            )
        }
    };
    info!(event = "demo_backend", backend = ?args.backend, chunk_size = args.engine.chunk_size);

    let alice = Engine::new(
        ALICE,
        args.engine.clone(),
        alice_factory,
        relay.endpoint(ALICE),
        alice_media,
    )?;
    let bob = Engine::new(
        BOB,
        args.engine.clone(),
        bob_factory,
        relay.endpoint(BOB),
        bob_media,
    )?;
    relay.register(ALICE, alice.clone());
    relay.register(BOB, bob.clone());
    Ok((alice, bob))
}

async fn session(args: &Args, alice: &Engine, bob: &Engine) -> Result<()> {
    let mut bob_events = bob.subscribe();
    let connect_timeout = Duration::from_secs(args.connect_timeout);

    // Alice was here first and sees Bob arrive.
    alice.join_peer(BOB, true, json!({ "name": "Alice" })).await?;
    bob.join_peer(ALICE, false, json!({ "name": "Bob" })).await?;

    wait_connected(alice, BOB, connect_timeout).await?;
    wait_connected(bob, ALICE, connect_timeout).await?;
    info!(event = "demo_connected", "Both peers connected");

    for engine in [alice, bob] {
        engine.start_camera(None).await?;
        engine.start_audio().await?;
    }

    wait_control_open(alice, &mut bob_events, connect_timeout).await?;

    let data = demo_payload(args.file_size);
    let expected = sha3_256(&data);
    let file_id = alice
        .send_file(
            BOB,
            FileSource::Bytes {
                name: "demo.bin".into(),
                data,
            },
        )
        .await?;
    info!(event = "demo_file_offered", %file_id, size = args.file_size);

    loop {
        match bob_events.recv().await {
            Some(EngineEvent::TransferCompleted {
                transfer,
                direction: TransferDirection::Incoming,
                digest,
                ..
            }) if transfer.file_id == file_id => {
                if digest != expected {
                    bail!("digest mismatch: got {}, expected {}", to_hex(&digest), to_hex(&expected));
                }
                info!(
                    event = "demo_file_received",
                    %file_id,
                    bytes = transfer.total_size,
                    speed = transfer.transfer_speed,
                    sha3 = %to_hex(&digest),
                );
                break;
            }
            Some(EngineEvent::Error(EngineError::Transfer { file_id: failed, reason }))
                if failed == file_id =>
            {
                bail!("transfer failed: {reason}");
            }
            Some(_) => {}
            None => bail!("bob's engine stopped"),
        }
    }

    for engine in [alice, bob] {
        for peer in engine.peers().await? {
            info!(
                event = "demo_peer_snapshot",
                local = engine.local_id(),
                peer = %peer.peer_id,
                role = ?peer.role,
                connection = ?peer.connection,
                audio = peer.is_audio_on,
                video = peer.is_video_on,
                screen = peer.is_screen_share_on,
                info = %peer.info,
            );
        }
    }
    Ok(())
}

async fn wait_connected(engine: &Engine, peer: &str, limit: Duration) -> Result<()> {
    timeout(limit, poll_connected(engine, peer))
        .await
        .with_context(|| format!("{} never connected to {}", engine.local_id(), peer))??;
    Ok(())
}

async fn poll_connected(engine: &Engine, peer: &str) -> Result<(), EngineError> {
    loop {
        match engine.peer(peer).await?.map(|p| p.connection) {
            Some(PeerConnectionState::Connected) => return Ok(()),
            Some(PeerConnectionState::Failed) => {
                return Err(EngineError::negotiation(peer, "connection failed"))
            }
            _ => tokio::time::sleep(POLL).await,
        }
    }
}

/// Say hello until Bob hears it. The control channel opens after the
/// connection, so the first attempts may fail.
async fn wait_control_open(
    alice: &Engine,
    bob_events: &mut mpsc::UnboundedReceiver<EngineEvent>,
    limit: Duration,
) -> Result<()> {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        alice
            .send_control_message(Target::Peer(BOB.into()), json!({ "hello": ALICE }))
            .await?;
        let heard = timeout(HELLO_WAIT, async {
            loop {
                match bob_events.recv().await {
                    Some(EngineEvent::ControlMessage { from, .. }) if from == ALICE => return true,
                    Some(_) => {}
                    None => return false,
                }
            }
        })
        .await;
        if matches!(heard, Ok(true)) {
            return Ok(());
        }
    }
    Err(anyhow!("control channel to {BOB} never opened"))
}

fn demo_payload(size: u64) -> Bytes {
    (0..size).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

fn spawn_event_log(engine: &Engine) {
    let local = engine.local_id().to_string();
    let mut events = engine.subscribe();
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                EngineEvent::Error(e) => warn!(event = "engine_error", %local, error = %e),
                EngineEvent::PeersChanged(peers) => {
                    debug!(event = "peers_changed", %local, count = peers.len())
                }
                EngineEvent::LocalMediaChanged { source, on, .. } => {
                    info!(event = "local_media", %local, %source, on)
                }
                EngineEvent::ControlMessage { from, text } => {
                    debug!(event = "control_message", %local, %from, %text)
                }
                EngineEvent::TransferProgress { transfer, direction } => debug!(
                    event = "transfer_progress",
                    %local,
                    direction = ?direction,
                    progress = transfer.progress,
                ),
                EngineEvent::TransferCompleted { transfer, direction, .. } => info!(
                    event = "transfer_completed",
                    %local,
                    direction = ?direction,
                    file = %transfer.file_name,
                ),
            }
        }
    });
}
