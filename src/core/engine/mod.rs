//! Session engine: a cloneable [`Engine`] handle in front of a single task
//! that owns every session, the local media state and all transfers.
//!
//! The task consumes three queues: commands from handles, callbacks from
//! connections ([`SessionEvent`]), and internal notifications (timers,
//! finished transfer tasks). Each item runs to completion before the next,
//! so session state is never touched concurrently.

mod channels;
mod media;
mod peers;
#[cfg(test)]
mod tests;

use crate::core::aggregator::{snapshot, snapshot_all, PeerSnapshot};
use crate::core::config::EngineConfig;
use crate::core::connection::{PeerConnectionFactory, SessionEvent};
use crate::core::error::EngineError;
use crate::core::events::{EngineEvent, EventHub};
use crate::core::media::local::LocalMediaState;
use crate::core::media::MediaProvider;
use crate::core::pipeline::{FileSource, IncomingTransfer};
use crate::core::protocol::FileTransfer;
use crate::core::session::PeerSession;
use crate::core::signaling::MessageTransport;
use crate::core::types::{CameraConstraints, MediaSource, PeerId};
use crate::utils::hash::Digest256;
use crate::utils::sos::SignalOfStop;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use uuid::Uuid;

/// Decides whether to accept an incoming file: `(file_name, sender) -> accept`.
pub type FileRequestFilter = Arc<dyn Fn(&str, &PeerId) -> bool + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    All,
    Peer(PeerId),
}

// ── Commands ─────────────────────────────────────────────────────────────────

pub(crate) enum MediaCommand {
    Start(MediaSource, Option<CameraConstraints>),
    Stop(MediaSource),
    Toggle(MediaSource),
    SwitchCamera,
}

pub(crate) enum Command {
    JoinPeer {
        id: PeerId,
        is_new_participant: bool,
        info: serde_json::Value,
    },
    LeavePeer(PeerId),
    SocketMessage {
        payload: String,
        source: PeerId,
        extra: Option<serde_json::Value>,
    },
    Media(MediaCommand),
    SendFile {
        to: PeerId,
        source: FileSource,
        reply: oneshot::Sender<Uuid>,
    },
    SendControl {
        target: Target,
        payload: serde_json::Value,
    },
    SetFileFilter(FileRequestFilter),
    Peers(oneshot::Sender<Vec<PeerSnapshot>>),
    Peer(PeerId, oneshot::Sender<Option<PeerSnapshot>>),
    IsLocalOn(MediaSource, oneshot::Sender<bool>),
    Shutdown,
}

struct Envelope {
    command: Command,
    done: oneshot::Sender<()>,
}

/// Notifications the engine task sends itself.
pub(crate) enum Internal {
    /// Settle delay of the camera switch with this token elapsed.
    CameraSwitchSettled(u64),
    CaptureEnded {
        source: MediaSource,
        track_id: String,
    },
    OutgoingFinished {
        file_id: Uuid,
        outcome: std::result::Result<(FileTransfer, Digest256), String>,
    },
}

// ── Handle ───────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Engine {
    local_id: PeerId,
    tx: mpsc::UnboundedSender<Envelope>,
    events: EventHub,
}

impl Engine {
    /// Validate `config` and spawn the engine task. Requires a tokio runtime.
    pub fn new(
        local_id: impl Into<PeerId>,
        config: EngineConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        transport: Arc<dyn MessageTransport>,
        provider: Arc<dyn MediaProvider>,
    ) -> Result<Self> {
        config.validate()?;
        let local_id = local_id.into();
        let events = EventHub::new();
        let (tx, commands) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let engine_loop = EngineLoop {
            local_id: local_id.clone(),
            local: LocalMediaState::new(config.default_camera),
            config,
            factory,
            transport,
            provider,
            events: events.clone(),
            sessions: HashMap::new(),
            next_generation: 0,
            pending_camera_switch: None,
            next_camera_switch: 0,
            session_tx,
            internal_tx,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            file_filter: Arc::new(|_, _| true),
        };
        tokio::spawn(engine_loop.run(commands, session_rx, internal_rx));
        info!(event = "engine_started", local = %local_id);

        Ok(Self {
            local_id,
            tx,
            events,
        })
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Ordered stream of every event emitted from now on.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<EngineEvent> {
        self.events.subscribe()
    }

    async fn call(&self, command: Command) -> Result<(), EngineError> {
        let (done, rx) = oneshot::channel();
        self.tx
            .send(Envelope { command, done })
            .map_err(|_| EngineError::System)?;
        rx.await.map_err(|_| EngineError::System)
    }

    async fn query<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.call(build(reply)).await?;
        rx.await.map_err(|_| EngineError::System)
    }

    // ── Peers & signaling ──

    /// `is_new_participant`: we were already present and saw `id` arrive.
    /// That side is polite and opens the control channel.
    pub async fn join_peer(
        &self,
        id: impl Into<PeerId>,
        is_new_participant: bool,
        info: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.call(Command::JoinPeer {
            id: id.into(),
            is_new_participant,
            info,
        })
        .await
    }

    pub async fn leave_peer(&self, id: impl Into<PeerId>) -> Result<(), EngineError> {
        self.call(Command::LeavePeer(id.into())).await
    }

    /// Feed a payload received from the relay.
    pub async fn on_socket_message(
        &self,
        payload: String,
        source: impl Into<PeerId>,
        extra: Option<serde_json::Value>,
    ) -> Result<(), EngineError> {
        self.call(Command::SocketMessage {
            payload,
            source: source.into(),
            extra,
        })
        .await
    }

    // ── Camera ──

    pub async fn start_camera(&self, constraints: Option<CameraConstraints>) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Start(MediaSource::Camera, constraints)))
            .await
    }

    pub async fn stop_camera(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Stop(MediaSource::Camera))).await
    }

    pub async fn toggle_camera(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Toggle(MediaSource::Camera))).await
    }

    /// Flip between front and back cameras.
    pub async fn switch_camera(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::SwitchCamera)).await
    }

    // ── Screen share ──

    pub async fn start_screen_share(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Start(MediaSource::Screen, None)))
            .await
    }

    pub async fn stop_screen_share(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Stop(MediaSource::Screen))).await
    }

    pub async fn toggle_screen_share(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Toggle(MediaSource::Screen))).await
    }

    // ── Audio ──

    pub async fn start_audio(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Start(MediaSource::Microphone, None)))
            .await
    }

    pub async fn stop_audio(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Stop(MediaSource::Microphone)))
            .await
    }

    pub async fn toggle_audio(&self) -> Result<(), EngineError> {
        self.call(Command::Media(MediaCommand::Toggle(MediaSource::Microphone)))
            .await
    }

    // ── Data ──

    /// Offer a file to `to`. Progress and the outcome arrive as events.
    pub async fn send_file(&self, to: impl Into<PeerId>, source: FileSource) -> Result<Uuid, EngineError> {
        let to = to.into();
        self.query(|reply| Command::SendFile { to, source, reply }).await
    }

    pub async fn send_control_message(
        &self,
        target: Target,
        payload: serde_json::Value,
    ) -> Result<(), EngineError> {
        self.call(Command::SendControl { target, payload }).await
    }

    pub async fn set_file_request_filter<F>(&self, filter: F) -> Result<(), EngineError>
    where
        F: Fn(&str, &PeerId) -> bool + Send + Sync + 'static,
    {
        self.call(Command::SetFileFilter(Arc::new(filter))).await
    }

    // ── State ──

    pub async fn peers(&self) -> Result<Vec<PeerSnapshot>, EngineError> {
        self.query(Command::Peers).await
    }

    pub async fn peer(&self, id: impl Into<PeerId>) -> Result<Option<PeerSnapshot>, EngineError> {
        let id = id.into();
        self.query(|reply| Command::Peer(id, reply)).await
    }

    pub async fn is_local_audio_on(&self) -> Result<bool, EngineError> {
        self.query(|reply| Command::IsLocalOn(MediaSource::Microphone, reply))
            .await
    }

    pub async fn is_local_video_on(&self) -> Result<bool, EngineError> {
        self.query(|reply| Command::IsLocalOn(MediaSource::Camera, reply)).await
    }

    pub async fn is_local_screen_share_on(&self) -> Result<bool, EngineError> {
        self.query(|reply| Command::IsLocalOn(MediaSource::Screen, reply)).await
    }

    /// Close every session, release local media and stop the engine task.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.call(Command::Shutdown).await
    }
}

// ── Engine task ──────────────────────────────────────────────────────────────

struct OutgoingTransfer {
    peer: PeerId,
    transfer: FileTransfer,
    stage: OutgoingStage,
}

enum OutgoingStage {
    AwaitingResponse(FileSource),
    Streaming(SignalOfStop),
}

struct IncomingEntry {
    peer: PeerId,
    transfer: IncomingTransfer,
}

pub(crate) struct EngineLoop {
    local_id: PeerId,
    config: EngineConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    transport: Arc<dyn MessageTransport>,
    provider: Arc<dyn MediaProvider>,
    events: EventHub,
    sessions: HashMap<PeerId, PeerSession>,
    local: LocalMediaState,
    next_generation: u64,
    /// Token of the camera switch waiting to restart capture, if any.
    pending_camera_switch: Option<u64>,
    next_camera_switch: u64,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    outgoing: HashMap<Uuid, OutgoingTransfer>,
    incoming: HashMap<Uuid, IncomingEntry>,
    file_filter: FileRequestFilter,
}

impl EngineLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Envelope>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut internal_rx: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                envelope = commands.recv() => {
                    let Some(Envelope { command, done }) = envelope else {
                        self.shutdown().await;
                        break;
                    };
                    let stop = matches!(command, Command::Shutdown);
                    self.handle_command(command).await;
                    let _ = done.send(());
                    if stop {
                        break;
                    }
                }
                Some(event) = session_rx.recv() => self.handle_session_event(event).await,
                Some(internal) = internal_rx.recv() => self.handle_internal(internal).await,
            }
        }
        info!(event = "engine_stopped", local = %self.local_id);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::JoinPeer {
                id,
                is_new_participant,
                info,
            } => self.join_peer(id, is_new_participant, info).await,
            Command::LeavePeer(id) => self.leave_peer(&id).await,
            Command::SocketMessage {
                payload,
                source,
                extra,
            } => self.on_socket_message(payload, source, extra).await,
            Command::Media(cmd) => self.handle_media(cmd).await,
            Command::SendFile { to, source, reply } => {
                let file_id = self.send_file(to, source).await;
                let _ = reply.send(file_id);
            }
            Command::SendControl { target, payload } => self.send_control(target, payload).await,
            Command::SetFileFilter(filter) => self.file_filter = filter,
            Command::Peers(reply) => {
                let _ = reply.send(snapshot_all(&self.sessions));
            }
            Command::Peer(id, reply) => {
                let _ = reply.send(self.sessions.get(&id).map(snapshot));
            }
            Command::IsLocalOn(source, reply) => {
                let _ = reply.send(self.local.is_on(source));
            }
            Command::Shutdown => self.shutdown().await,
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::CameraSwitchSettled(token) => self.on_camera_switch_settled(token).await,
            Internal::CaptureEnded { source, track_id } => {
                self.on_capture_ended(source, track_id).await
            }
            Internal::OutgoingFinished { file_id, outcome } => {
                self.on_outgoing_finished(file_id, outcome).await
            }
        }
    }

    fn emit_peers(&self) {
        self.events
            .emit(EngineEvent::PeersChanged(snapshot_all(&self.sessions)));
    }

    fn screen_track_id(&self) -> Option<String> {
        self.local.track(MediaSource::Screen).map(|t| t.id())
    }

    async fn shutdown(&mut self) {
        let ids: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for id in ids {
            self.teardown_session(&id, "engine shutdown").await;
        }
        self.local.release_all();
        debug!(event = "engine_shutdown", local = %self.local_id);
    }
}
