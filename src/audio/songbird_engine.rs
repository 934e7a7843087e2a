use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use songbird::{
    events::CoreEvent,
    input::{Input, YoutubeDl},
    tracks::{PlayMode, TrackHandle},
    Event, EventContext, EventHandler as VoiceEventHandler, Songbird, TrackEvent,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::{
    engine::{AudioEngine, EngineEvent, FinishReason},
    track::{QueuedTrack, TrackRef},
};
use crate::{
    error::{Result, SessionError},
    session::ContextId,
};

/// [`AudioEngine`] sobre songbird: una llamada de voz por guild, entradas
/// `YoutubeDl` y eventos de track traducidos a [`EngineEvent`].
pub struct SongbirdEngine {
    manager: Arc<Songbird>,
    http: reqwest::Client,
    events: mpsc::UnboundedSender<EngineEvent>,
    position_interval: Duration,
    current_tracks: DashMap<GuildId, TrackHandle>,
    volumes: DashMap<GuildId, u16>,
}

impl SongbirdEngine {
    pub fn new(
        manager: Arc<Songbird>,
        events: mpsc::UnboundedSender<EngineEvent>,
        position_interval: Duration,
    ) -> Self {
        Self {
            manager,
            http: reqwest::Client::new(),
            events,
            position_interval,
            current_tracks: DashMap::new(),
            volumes: DashMap::new(),
        }
    }

    /// URLs se abren directo; cualquier otro texto se busca con yt-dlp.
    fn input_for(&self, item: &QueuedTrack) -> Input {
        let source = item.track.source.clone();
        if source.starts_with("http://") || source.starts_with("https://") {
            Input::from(YoutubeDl::new(self.http.clone(), source))
        } else {
            Input::from(YoutubeDl::new_search(self.http.clone(), source))
        }
    }

    fn with_track<F>(&self, context: ContextId, action: F) -> Result<()>
    where
        F: FnOnce(&TrackHandle) -> songbird::tracks::TrackResult<()>,
    {
        match self.current_tracks.get(&context.guild_id) {
            Some(track) => action(track.value()).map_err(engine_error),
            None => {
                debug!("Sin track activo en guild {}", context.guild_id);
                Ok(())
            }
        }
    }
}

fn engine_error(err: impl std::fmt::Display) -> SessionError {
    SessionError::Engine(err.to_string())
}

fn as_gain(volume: u16) -> f32 {
    f32::from(volume) / 100.0
}

#[async_trait]
impl AudioEngine for SongbirdEngine {
    async fn connect(&self, context: ContextId) -> Result<()> {
        let call = self
            .manager
            .join(context.guild_id, context.channel_id)
            .await
            .map_err(engine_error)?;

        let mut handler = call.lock().await;
        handler.add_global_event(
            Event::Core(CoreEvent::DriverDisconnect),
            DisconnectNotifier {
                context,
                events: self.events.clone(),
            },
        );

        info!("🔊 Conectado a voz en {}", context);
        Ok(())
    }

    async fn disconnect(&self, context: ContextId) -> Result<()> {
        if let Some((_, track)) = self.current_tracks.remove(&context.guild_id) {
            let _ = track.stop();
        }
        self.volumes.remove(&context.guild_id);

        if self.manager.get(context.guild_id).is_some() {
            self.manager
                .remove(context.guild_id)
                .await
                .map_err(engine_error)?;
        }

        info!("👋 Desconectado de voz en {}", context);
        Ok(())
    }

    async fn play(&self, context: ContextId, track_ref: TrackRef, item: &QueuedTrack) -> Result<()> {
        let call = self
            .manager
            .get(context.guild_id)
            .ok_or_else(|| SessionError::Engine(format!("sin llamada de voz para {context}")))?;

        if let Some((_, previous)) = self.current_tracks.remove(&context.guild_id) {
            let _ = previous.stop();
        }

        let handle = {
            let mut handler = call.lock().await;
            handler.play_input(self.input_for(item))
        };

        let volume = self.volumes.get(&context.guild_id).map(|v| *v).unwrap_or(100);
        handle.set_volume(as_gain(volume)).map_err(engine_error)?;

        let notifier = TrackNotifier {
            context,
            track_ref,
            events: self.events.clone(),
            started: Arc::new(AtomicBool::new(false)),
        };
        for event in [
            Event::Track(TrackEvent::Play),
            Event::Track(TrackEvent::End),
            Event::Track(TrackEvent::Error),
            Event::Periodic(self.position_interval, None),
        ] {
            handle
                .add_event(event, notifier.clone())
                .map_err(engine_error)?;
        }

        self.current_tracks.insert(context.guild_id, handle);
        info!("🎵 Reproduciendo {} {} en {}", track_ref, item.title(), context);
        Ok(())
    }

    async fn pause(&self, context: ContextId) -> Result<()> {
        self.with_track(context, |track| track.pause())?;
        info!("⏸️ Reproducción pausada en {}", context);
        Ok(())
    }

    async fn resume(&self, context: ContextId) -> Result<()> {
        self.with_track(context, |track| track.play())?;
        info!("▶️ Reproducción reanudada en {}", context);
        Ok(())
    }

    async fn stop(&self, context: ContextId) -> Result<()> {
        if let Some((_, track)) = self.current_tracks.remove(&context.guild_id) {
            track.stop().map_err(engine_error)?;
        }
        info!("⏹️ Reproducción detenida en {}", context);
        Ok(())
    }

    async fn set_volume(&self, context: ContextId, volume: u16) -> Result<()> {
        self.volumes.insert(context.guild_id, volume);
        self.with_track(context, |track| track.set_volume(as_gain(volume)))?;
        info!("🔊 Volumen ajustado a {}% en {}", volume, context);
        Ok(())
    }
}

/// Traduce los eventos de un track de songbird a [`EngineEvent`].
#[derive(Clone)]
struct TrackNotifier {
    context: ContextId,
    track_ref: TrackRef,
    events: mpsc::UnboundedSender<EngineEvent>,
    started: Arc<AtomicBool>,
}

impl TrackNotifier {
    fn send(&self, event: EngineEvent) {
        if self.events.send(event).is_err() {
            warn!("Canal de eventos cerrado para {}", self.context);
        }
    }
}

#[async_trait]
impl VoiceEventHandler for TrackNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        let EventContext::Track(track_list) = ctx else {
            return None;
        };
        let (state, _handle) = track_list.first()?;

        match &state.playing {
            // Play también llega al reanudar; sólo el primero cuenta
            PlayMode::Play => {
                if !self.started.swap(true, Ordering::SeqCst) {
                    self.send(EngineEvent::TrackStarted {
                        context: self.context,
                        track_ref: self.track_ref,
                    });
                } else {
                    self.send(EngineEvent::PositionUpdate {
                        context: self.context,
                        position_ms: state.position.as_millis() as u64,
                    });
                }
            }
            PlayMode::Pause => self.send(EngineEvent::PositionUpdate {
                context: self.context,
                position_ms: state.position.as_millis() as u64,
            }),
            PlayMode::End => self.send(EngineEvent::TrackFinished {
                context: self.context,
                track_ref: self.track_ref,
                reason: FinishReason::Finished,
            }),
            PlayMode::Stop => self.send(EngineEvent::TrackFinished {
                context: self.context,
                track_ref: self.track_ref,
                reason: FinishReason::Stopped,
            }),
            PlayMode::Errored(err) => {
                error!("❌ Error en track {} para {}: {:?}", self.track_ref, self.context, err);
                self.send(EngineEvent::TrackErrored {
                    context: self.context,
                    track_ref: self.track_ref,
                    error: format!("{err:?}"),
                });
            }
            _ => {}
        }

        None
    }
}

/// Avisa cuando el driver pierde la conexión sin que se haya pedido.
struct DisconnectNotifier {
    context: ContextId,
    events: mpsc::UnboundedSender<EngineEvent>,
}

#[async_trait]
impl VoiceEventHandler for DisconnectNotifier {
    async fn act(&self, ctx: &EventContext<'_>) -> Option<Event> {
        if let EventContext::DriverDisconnect(data) = ctx {
            if data.reason.is_some() {
                warn!("🔌 Driver de voz desconectado en {}: {:?}", self.context, data.reason);
                let _ = self.events.send(EngineEvent::Disconnected {
                    context: self.context,
                });
            }
        }

        None
    }
}
