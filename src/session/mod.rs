//! # Session Module
//!
//! The public handle other subsystems hold for one voice context.
//!
//! ## Architecture
//!
//! ### [`Session`] - Command contract
//! - One trait, two variants; callers never branch on which one they hold
//! - Every operation is a [`Command`] answered by a [`Reply`]
//!
//! ### [`local`] - Authoritative owner
//! - Owns the [`MusicQueue`](crate::audio::queue::MusicQueue) and the
//!   [`StateMachine`](crate::audio::state::StateMachine) of the context
//! - Talks to the [`AudioEngine`](crate::audio::engine::AudioEngine) and
//!   publishes one [`StateSnapshot`] per version to mirrors and observers
//!
//! ### [`remote`] - Mirror
//! - Forwards every command to the owning node and waits for the ack
//! - Keeps the last snapshot seen for low-latency reads
//!
//! ### [`registry`] - Process-wide map
//! - Context → handle, creation race resolved through the ownership directory
//!
//! ### [`events`] - Engine event dispatcher
//! - Applies track started/finished/errored events in emission order

pub mod events;
pub mod local;
pub mod registry;
pub mod remote;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{fmt, sync::Arc, time::Duration};

use crate::{
    audio::{
        policy::{EnqueueMode, RepeatMode},
        state::SessionState,
        track::{QueuedTrack, Track, TrackRef},
    },
    cluster::NodeId,
    error::{Result, SessionError},
};

pub use local::LocalSession;
pub use registry::SessionRegistry;
pub use remote::RemoteSession;

/// Volumen máximo aceptado por `set_volume`.
pub const MAX_VOLUME: u16 = 1000;

/// Identidad de un contexto de escucha: canal de voz dentro de un guild.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContextId {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
}

impl ContextId {
    pub fn new(guild_id: GuildId, channel_id: ChannelId) -> Self {
        Self { guild_id, channel_id }
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.guild_id, self.channel_id)
    }
}

/// Comandos que acepta una sesión, locales o remotos.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    Enqueue { track: Track, requester: UserId },
    EnqueueBatch { tracks: Vec<Track>, requester: UserId },
    InsertAt { track: Track, requester: UserId, index: usize },
    /// `observed` es el track que el emisor creía sonando; si ya cambió, no hace nada.
    Skip { observed: Option<TrackRef> },
    MoveBy { offset: i64 },
    MoveTo { index: usize },
    Pause,
    Resume,
    Stop,
    Disconnect,
    SetRepeatMode(RepeatMode),
    SetEnqueueMode(EnqueueMode),
    SetVolume(u16),
    Remove { index: usize },
    Dequeue { requester: UserId },
    ClearUpcoming,
    QueueSnapshot,
    StateSnapshot,
}

impl Command {
    /// Nombre corto para logs.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Enqueue { .. } => "enqueue",
            Command::EnqueueBatch { .. } => "enqueue_batch",
            Command::InsertAt { .. } => "insert_at",
            Command::Skip { .. } => "skip",
            Command::MoveBy { .. } => "move_by",
            Command::MoveTo { .. } => "move_to",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Stop => "stop",
            Command::Disconnect => "disconnect",
            Command::SetRepeatMode(_) => "set_repeat_mode",
            Command::SetEnqueueMode(_) => "set_enqueue_mode",
            Command::SetVolume(_) => "set_volume",
            Command::Remove { .. } => "remove",
            Command::Dequeue { .. } => "dequeue",
            Command::ClearUpcoming => "clear_upcoming",
            Command::QueueSnapshot => "queue_snapshot",
            Command::StateSnapshot => "state_snapshot",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    State(StateSnapshot),
    Queue(QueueSnapshot),
}

impl Reply {
    /// Snapshot de estado contenido en la respuesta.
    pub fn state(&self) -> &StateSnapshot {
        match self {
            Reply::State(state) => state,
            Reply::Queue(queue) => &queue.state,
        }
    }

    pub fn into_state(self) -> StateSnapshot {
        match self {
            Reply::State(state) => state,
            Reply::Queue(queue) => queue.state,
        }
    }

    pub fn into_queue(self) -> Result<QueueSnapshot> {
        match self {
            Reply::Queue(queue) => Ok(queue),
            Reply::State(state) => Err(SessionError::unreachable(
                &state.owner,
                "respuesta inesperada",
            )),
        }
    }
}

/// Estado observable de una sesión. También es el delta que se difunde a los
/// espejos: cada versión nueva produce exactamente uno.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub context: ContextId,
    pub owner: NodeId,
    pub version: u64,
    pub state: SessionState,
    pub cursor: Option<usize>,
    pub len: usize,
    pub repeat: RepeatMode,
    pub enqueue_mode: EnqueueMode,
    pub volume: u16,
    pub now_playing: Option<TrackRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub state: StateSnapshot,
    pub tracks: Vec<QueuedTrack>,
}

impl QueueSnapshot {
    pub fn current(&self) -> Option<&QueuedTrack> {
        self.state.cursor.and_then(|cursor| self.tracks.get(cursor))
    }

    pub fn upcoming(&self) -> &[QueuedTrack] {
        match self.state.cursor {
            Some(cursor) => &self.tracks[cursor + 1..],
            None => &[],
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.tracks.iter().filter_map(|item| item.track.duration).sum()
    }

    /// Obtiene una página específica de la cola (páginas desde 1)
    pub fn page(&self, page: usize, per_page: usize) -> QueuePage {
        let per_page = per_page.max(1);
        let total_items = self.tracks.len();
        let total_pages = if total_items == 0 { 1 } else { total_items.div_ceil(per_page) };
        let current_page = page.clamp(1, total_pages);
        let start = (current_page - 1) * per_page;
        let end = (start + per_page).min(total_items);

        QueuePage {
            items: self.tracks[start..end].to_vec(),
            first_index: start,
            current_page,
            total_pages,
            total_items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuePage {
    pub items: Vec<QueuedTrack>,
    /// Índice absoluto del primer elemento de la página.
    pub first_index: usize,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

/// Lo que ven los observadores externos (UI de "now playing", historial).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(StateSnapshot),
    NowPlaying { context: ContextId, track: QueuedTrack },
    Position { context: ContextId, position_ms: u64 },
    Failed { context: ContextId, error: SessionError },
    Closed { context: ContextId },
}

/// Misma superficie de comandos para sesiones locales y remotas.
#[async_trait]
pub trait Session: Send + Sync {
    fn context(&self) -> ContextId;

    /// Nodo que tiene la conexión de voz.
    fn owner(&self) -> NodeId;

    /// Lectura sin suspensión: el estado local o el último delta recibido.
    fn state_snapshot(&self) -> StateSnapshot;

    async fn execute(&self, command: Command) -> Result<Reply>;

    async fn enqueue(&self, track: Track, requester: UserId) -> Result<StateSnapshot> {
        self.execute(Command::Enqueue { track, requester })
            .await
            .map(Reply::into_state)
    }

    async fn enqueue_batch(&self, tracks: Vec<Track>, requester: UserId) -> Result<StateSnapshot> {
        self.execute(Command::EnqueueBatch { tracks, requester })
            .await
            .map(Reply::into_state)
    }

    async fn insert_at(&self, track: Track, requester: UserId, index: usize) -> Result<StateSnapshot> {
        self.execute(Command::InsertAt { track, requester, index })
            .await
            .map(Reply::into_state)
    }

    /// Salta el track que este handle ve sonando.
    async fn skip(&self) -> Result<StateSnapshot> {
        let observed = self.state_snapshot().now_playing;
        self.execute(Command::Skip { observed })
            .await
            .map(Reply::into_state)
    }

    async fn move_by(&self, offset: i64) -> Result<StateSnapshot> {
        self.execute(Command::MoveBy { offset }).await.map(Reply::into_state)
    }

    async fn move_to(&self, index: usize) -> Result<StateSnapshot> {
        self.execute(Command::MoveTo { index }).await.map(Reply::into_state)
    }

    async fn pause(&self) -> Result<StateSnapshot> {
        self.execute(Command::Pause).await.map(Reply::into_state)
    }

    async fn resume(&self) -> Result<StateSnapshot> {
        self.execute(Command::Resume).await.map(Reply::into_state)
    }

    async fn stop(&self) -> Result<StateSnapshot> {
        self.execute(Command::Stop).await.map(Reply::into_state)
    }

    async fn disconnect(&self) -> Result<StateSnapshot> {
        self.execute(Command::Disconnect).await.map(Reply::into_state)
    }

    async fn set_repeat_mode(&self, mode: RepeatMode) -> Result<StateSnapshot> {
        self.execute(Command::SetRepeatMode(mode)).await.map(Reply::into_state)
    }

    async fn set_enqueue_mode(&self, mode: EnqueueMode) -> Result<StateSnapshot> {
        self.execute(Command::SetEnqueueMode(mode)).await.map(Reply::into_state)
    }

    async fn set_volume(&self, volume: u16) -> Result<StateSnapshot> {
        self.execute(Command::SetVolume(volume)).await.map(Reply::into_state)
    }

    async fn remove(&self, index: usize) -> Result<StateSnapshot> {
        self.execute(Command::Remove { index }).await.map(Reply::into_state)
    }

    async fn dequeue(&self, requester: UserId) -> Result<StateSnapshot> {
        self.execute(Command::Dequeue { requester }).await.map(Reply::into_state)
    }

    async fn clear_upcoming(&self) -> Result<StateSnapshot> {
        self.execute(Command::ClearUpcoming).await.map(Reply::into_state)
    }

    async fn queue_snapshot(&self) -> Result<QueueSnapshot> {
        self.execute(Command::QueueSnapshot).await?.into_queue()
    }
}

impl fmt::Debug for dyn Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("context", &self.context())
            .field("owner", &self.owner())
            .finish_non_exhaustive()
    }
}

/// Handle guardado en el registro.
#[derive(Clone)]
pub enum SessionHandle {
    Local(Arc<LocalSession>),
    Remote(Arc<RemoteSession>),
}

impl SessionHandle {
    pub fn session(&self) -> Arc<dyn Session> {
        match self {
            SessionHandle::Local(local) => local.clone(),
            SessionHandle::Remote(remote) => remote.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, SessionHandle::Local(_))
    }

    /// Una sesión local desconectada ya no sirve y se reemplaza.
    fn is_live(&self) -> bool {
        match self {
            SessionHandle::Local(local) => !local.state_snapshot().state.is_terminal(),
            SessionHandle::Remote(remote) => !remote.state_snapshot().state.is_terminal(),
        }
    }
}
