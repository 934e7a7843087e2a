use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::SessionRegistry;
use crate::{
    audio::engine::EngineEvent,
    error::{Result, SessionError},
};

/// Consume los eventos del motor en el orden en que se emiten y los aplica a
/// la sesión local del contexto.
///
/// Un contexto sin sesión se ignora (el evento compitió con el cierre). Los
/// demás errores se registran y se publican a los observadores; nunca frenan
/// el procesamiento de otros contextos.
pub struct EventHandler {
    registry: Arc<SessionRegistry>,
    events: mpsc::UnboundedReceiver<EngineEvent>,
}

impl EventHandler {
    pub fn new(registry: Arc<SessionRegistry>, events: mpsc::UnboundedReceiver<EngineEvent>) -> Self {
        Self { registry, events }
    }

    pub async fn run(mut self) {
        info!("🎧 Despachador de eventos del motor iniciado");
        while let Some(event) = self.events.recv().await {
            dispatch(&self.registry, event).await;
        }
        info!("🎧 Canal de eventos del motor cerrado");
    }
}

/// Aplica un evento y absorbe su error.
pub async fn dispatch(registry: &SessionRegistry, event: EngineEvent) {
    let context = event.context();
    match handle(registry, event).await {
        Ok(()) => {}
        Err(err) if err.is_no_session() => {
            debug!("Evento para {} sin sesión, ignorado", context);
        }
        Err(err) => {
            error!("❌ Error procesando evento en {}: {}", context, err);
            registry.report(context, err);
        }
    }
}

async fn handle(registry: &SessionRegistry, event: EngineEvent) -> Result<()> {
    let context = event.context();
    let session = registry
        .local(context)
        .ok_or(SessionError::NoSession(context))?;

    match event {
        EngineEvent::TrackStarted { track_ref, .. } => session.track_started(track_ref).await,
        EngineEvent::TrackFinished { track_ref, reason, .. } => {
            session.track_finished(track_ref, reason).await
        }
        EngineEvent::TrackErrored { track_ref, error, .. } => {
            registry.report(context, SessionError::Engine(error.clone()));
            session.track_errored(track_ref, &error).await
        }
        EngineEvent::PositionUpdate { position_ms, .. } => {
            session.position(position_ms);
            Ok(())
        }
        EngineEvent::Disconnected { .. } => {
            warn!("🔌 El motor reporta desconexión en {}", context);
            session.connection_lost().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::{
            engine::{FinishReason, RecordingEngine},
            state::SessionState,
            track::{Track, TrackRef},
        },
        cluster::{memory::MemoryNetwork, LocalDirectory, NodeId},
        session::{local::SessionSettings, ContextId, Session, SessionEvent},
    };
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId, UserId};
    use std::time::Duration;

    fn context() -> ContextId {
        ContextId::new(GuildId::new(1), ChannelId::new(2))
    }

    fn registry(engine: Arc<RecordingEngine>) -> Arc<SessionRegistry> {
        let network = MemoryNetwork::new();
        SessionRegistry::new(
            engine,
            network.join(NodeId::from("node-0")),
            Arc::new(LocalDirectory::new()),
            SessionSettings::default(),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn events_without_session_are_ignored() {
        let registry = registry(Arc::new(RecordingEngine::new()));
        let mut observers = registry.subscribe();

        dispatch(
            &registry,
            EngineEvent::TrackFinished {
                context: context(),
                track_ref: TrackRef(1),
                reason: FinishReason::Finished,
            },
        )
        .await;
        assert!(observers.try_recv().is_err());
    }

    #[tokio::test]
    async fn run_drives_the_session_in_order() {
        let engine = Arc::new(RecordingEngine::new());
        let registry = registry(engine.clone());
        let session = registry.get_or_create(context()).await.unwrap();
        for title in ["a", "b"] {
            session.enqueue(Track::new(title, title), UserId::new(3)).await.unwrap();
        }
        let (first, _) = engine.last_played(context()).unwrap();

        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(EventHandler::new(registry.clone(), rx).run());
        tx.send(EngineEvent::TrackStarted { context: context(), track_ref: first }).unwrap();
        tx.send(EngineEvent::PositionUpdate { context: context(), position_ms: 1500 }).unwrap();
        tx.send(EngineEvent::TrackFinished {
            context: context(),
            track_ref: first,
            reason: FinishReason::Finished,
        })
        .unwrap();
        drop(tx);
        dispatcher.await.unwrap();

        let snapshot = session.state_snapshot();
        assert_eq!(snapshot.cursor, Some(1));
        assert_eq!(snapshot.state, SessionState::Playing);
        assert_eq!(engine.last_played(context()).unwrap().1, "b");
    }

    #[tokio::test]
    async fn errored_tracks_are_reported() {
        let engine = Arc::new(RecordingEngine::new());
        let registry = registry(engine.clone());
        let session = registry.get_or_create(context()).await.unwrap();
        session.enqueue(Track::new("a", "a"), UserId::new(3)).await.unwrap();
        let (first, _) = engine.last_played(context()).unwrap();
        let mut observers = registry.subscribe();

        dispatch(
            &registry,
            EngineEvent::TrackErrored {
                context: context(),
                track_ref: first,
                error: "sin formato".into(),
            },
        )
        .await;

        let mut failed = false;
        while let Ok(event) = observers.try_recv() {
            if let SessionEvent::Failed { error, .. } = event {
                assert_eq!(error, SessionError::Engine("sin formato".into()));
                failed = true;
            }
        }
        assert!(failed);
        assert_eq!(session.state_snapshot().state, SessionState::Ended);
    }

    #[tokio::test]
    async fn engine_disconnect_closes_the_session() {
        let engine = Arc::new(RecordingEngine::new());
        let registry = registry(engine.clone());
        registry.get_or_create(context()).await.unwrap();

        dispatch(&registry, EngineEvent::Disconnected { context: context() }).await;
        assert!(registry.get(context()).is_err());
        assert!(registry.local(context()).is_none());
    }
}
