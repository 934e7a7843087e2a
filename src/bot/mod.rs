//! # Bot Module
//!
//! Discord gateway side of a worker process.
//!
//! ## Architecture
//!
//! The worker is built around the [`WorkerBot`] struct which implements
//! Serenity's [`EventHandler`] trait. It does not own any playback state:
//!
//! - Sessions live in the [`SessionRegistry`]
//! - Audio flows through songbird, registered on the same client
//! - Voice state updates for the bot user are turned into
//!   [`EngineEvent::Disconnected`] so the owning session closes
//!
//! ## Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use open_music_sessions::{bot::WorkerBot, session::SessionRegistry};
//! # fn example(registry: Arc<SessionRegistry>) {
//! let (events_tx, _events_rx) = tokio::sync::mpsc::unbounded_channel();
//! let bot = WorkerBot::new(registry, events_tx);
//! # }
//! ```

use serenity::{
    all::{ChannelId, Context, EventHandler, GuildId, Ready, VoiceState},
    async_trait,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    audio::engine::EngineEvent,
    session::{ContextId, SessionRegistry},
};

/// Handler de eventos de Discord para un worker.
pub struct WorkerBot {
    registry: Arc<SessionRegistry>,
    engine_events: mpsc::UnboundedSender<EngineEvent>,
}

impl WorkerBot {
    pub fn new(registry: Arc<SessionRegistry>, engine_events: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self {
            registry,
            engine_events,
        }
    }

    /// Contexto local que deja de ser válido cuando el bot queda en `channel`
    /// (fuera de voz o en otro canal) dentro de `guild_id`.
    pub fn lost_context(&self, guild_id: GuildId, channel: Option<ChannelId>) -> Option<ContextId> {
        self.registry
            .local_context_in_guild(guild_id)
            .filter(|context| Some(context.channel_id) != channel)
    }
}

#[async_trait]
impl EventHandler for WorkerBot {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        info!("🤖 {} está en línea como nodo {}!", ready.user.name, self.registry.node());
        info!("📊 Conectado a {} servidores", ready.guilds.len());
    }

    /// Sólo interesa el usuario del bot: si sale del canal de la sesión local
    /// (lo echaron o lo movieron), la sesión se cierra.
    async fn voice_state_update(&self, ctx: Context, _old: Option<VoiceState>, new: VoiceState) {
        let current_user_id = ctx.cache.current_user().id;
        if new.user_id != current_user_id {
            return;
        }
        let Some(guild_id) = new.guild_id else {
            return;
        };

        match self.lost_context(guild_id, new.channel_id) {
            Some(context) => {
                info!("🔌 Bot fuera del canal de {}", context);
                if self.engine_events.send(EngineEvent::Disconnected { context }).is_err() {
                    warn!("⚠️ Despachador de eventos cerrado, {} queda sin cerrar", context);
                }
            }
            None => debug!("Estado de voz del bot en guild {}: {:?}", guild_id, new.channel_id),
        }
    }
}
