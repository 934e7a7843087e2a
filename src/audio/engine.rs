//! Narrow command/event contract with the audio backend.
//!
//! Sessions drive the backend through [`AudioEngine`]; the backend answers
//! asynchronously with [`EngineEvent`]s on an mpsc channel. Every event carries
//! the [`TrackRef`] it was started with so late events can be told apart.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::track::{QueuedTrack, TrackRef};
use crate::{error::Result, session::ContextId};

/// Por qué terminó un track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FinishReason {
    /// Terminó solo; aplica la política de repetición.
    Finished,
    /// Detenido explícitamente.
    Stopped,
    /// Reemplazado por otro `play`.
    Replaced,
}

impl FinishReason {
    pub fn may_advance(self) -> bool {
        self == FinishReason::Finished
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    TrackStarted {
        context: ContextId,
        track_ref: TrackRef,
    },
    TrackFinished {
        context: ContextId,
        track_ref: TrackRef,
        reason: FinishReason,
    },
    TrackErrored {
        context: ContextId,
        track_ref: TrackRef,
        error: String,
    },
    PositionUpdate {
        context: ContextId,
        position_ms: u64,
    },
    /// La conexión de voz se perdió sin que nadie la pidiera.
    Disconnected { context: ContextId },
}

impl EngineEvent {
    pub fn context(&self) -> ContextId {
        match self {
            EngineEvent::TrackStarted { context, .. }
            | EngineEvent::TrackFinished { context, .. }
            | EngineEvent::TrackErrored { context, .. }
            | EngineEvent::PositionUpdate { context, .. }
            | EngineEvent::Disconnected { context } => *context,
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioEngine: Send + Sync {
    async fn connect(&self, context: ContextId) -> Result<()>;

    async fn disconnect(&self, context: ContextId) -> Result<()>;

    /// Reemplaza lo que esté sonando; los eventos posteriores llevan `track_ref`.
    async fn play(&self, context: ContextId, track_ref: TrackRef, item: &QueuedTrack) -> Result<()>;

    async fn pause(&self, context: ContextId) -> Result<()>;

    async fn resume(&self, context: ContextId) -> Result<()>;

    async fn stop(&self, context: ContextId) -> Result<()>;

    /// Volumen en porcentaje, `0..=1000`.
    async fn set_volume(&self, context: ContextId, volume: u16) -> Result<()>;
}

/// Una llamada recibida por [`RecordingEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Connect,
    Disconnect,
    Play { track_ref: TrackRef, title: String },
    Pause,
    Resume,
    Stop,
    SetVolume(u16),
}

/// In-memory engine that accepts every command and records it per context.
///
/// Emits no events on its own: whoever drives it decides when tracks start or
/// finish, which makes engine races reproducible.
#[derive(Debug, Default)]
pub struct RecordingEngine {
    calls: Mutex<HashMap<ContextId, Vec<EngineCall>>>,
}

impl RecordingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self, context: ContextId) -> Vec<EngineCall> {
        self.calls.lock().get(&context).cloned().unwrap_or_default()
    }

    /// Último `play` recibido para el contexto.
    pub fn last_played(&self, context: ContextId) -> Option<(TrackRef, String)> {
        self.calls.lock().get(&context).and_then(|calls| {
            calls.iter().rev().find_map(|call| match call {
                EngineCall::Play { track_ref, title } => Some((*track_ref, title.clone())),
                _ => None,
            })
        })
    }

    fn record(&self, context: ContextId, call: EngineCall) {
        self.calls.lock().entry(context).or_default().push(call);
    }
}

#[async_trait]
impl AudioEngine for RecordingEngine {
    async fn connect(&self, context: ContextId) -> Result<()> {
        self.record(context, EngineCall::Connect);
        Ok(())
    }

    async fn disconnect(&self, context: ContextId) -> Result<()> {
        self.record(context, EngineCall::Disconnect);
        Ok(())
    }

    async fn play(&self, context: ContextId, track_ref: TrackRef, item: &QueuedTrack) -> Result<()> {
        self.record(
            context,
            EngineCall::Play {
                track_ref,
                title: item.title().to_string(),
            },
        );
        Ok(())
    }

    async fn pause(&self, context: ContextId) -> Result<()> {
        self.record(context, EngineCall::Pause);
        Ok(())
    }

    async fn resume(&self, context: ContextId) -> Result<()> {
        self.record(context, EngineCall::Resume);
        Ok(())
    }

    async fn stop(&self, context: ContextId) -> Result<()> {
        self.record(context, EngineCall::Stop);
        Ok(())
    }

    async fn set_volume(&self, context: ContextId, volume: u16) -> Result<()> {
        self.record(context, EngineCall::SetVolume(volume));
        Ok(())
    }
}
