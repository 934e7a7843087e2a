use async_trait::async_trait;
use parking_lot::Mutex;
use serenity::model::id::UserId;
use std::{
    collections::BTreeSet,
    sync::{Arc, Weak},
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    Command, ContextId, QueueSnapshot, Reply, Session, SessionEvent, SessionRegistry, StateSnapshot,
    MAX_VOLUME,
};
use crate::{
    audio::{
        engine::{AudioEngine, FinishReason},
        policy::{EnqueueMode, RepeatMode, RepeatPolicy},
        queue::MusicQueue,
        state::{SessionState, StateMachine},
        track::{QueuedTrack, Track, TrackRef},
    },
    cluster::{NodeId, Transport},
    error::{Result, SessionError},
};

/// Valores iniciales de cada sesión nueva.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub max_queue_size: usize,
    pub default_volume: u16,
    pub repeat: RepeatMode,
    pub enqueue_mode: EnqueueMode,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            default_volume: 100,
            repeat: RepeatMode::None,
            enqueue_mode: EnqueueMode::Fifo,
        }
    }
}

/// Queue, state machine and settings of one session, always swapped as a
/// whole so readers never see a half-applied command.
#[derive(Debug, Clone)]
struct SessionCore {
    queue: MusicQueue,
    machine: StateMachine,
    repeat: RepeatMode,
    enqueue_mode: EnqueueMode,
    volume: u16,
    version: u64,
    now_playing: Option<TrackRef>,
    next_ref: u64,
}

/// Lo que hay que pedirle al motor antes de confirmar el cambio.
#[derive(Debug)]
enum Effect {
    /// Cambio sólo de estado, sin llamar al motor.
    Nothing,
    /// No hay cambio: no se incrementa la versión ni se difunde nada.
    Unchanged,
    Play(TrackRef, QueuedTrack),
    Pause,
    Resume,
    Stop,
    Volume(u16),
    Disconnect,
}

impl SessionCore {
    fn new(settings: &SessionSettings) -> Self {
        Self {
            queue: MusicQueue::new(settings.max_queue_size),
            machine: StateMachine::new(),
            repeat: settings.repeat,
            enqueue_mode: settings.enqueue_mode,
            volume: settings.default_volume.min(MAX_VOLUME),
            version: 0,
            now_playing: None,
            next_ref: 0,
        }
    }

    fn state(&self) -> SessionState {
        self.machine.state()
    }

    fn snapshot(&self, context: ContextId, owner: &NodeId) -> StateSnapshot {
        StateSnapshot {
            context,
            owner: owner.clone(),
            version: self.version,
            state: self.state(),
            cursor: self.queue.cursor(),
            len: self.queue.len(),
            repeat: self.repeat,
            enqueue_mode: self.enqueue_mode,
            volume: self.volume,
            now_playing: self.now_playing,
        }
    }

    /// Carga el track del cursor con una referencia nueva.
    fn start_track(&mut self) -> Result<Effect> {
        let item = self.queue.current_track()?.clone();
        self.next_ref += 1;
        let track_ref = TrackRef(self.next_ref);
        self.now_playing = Some(track_ref);
        Ok(Effect::Play(track_ref, item))
    }

    /// El cursor cambió: reemplaza lo que suena por el track del cursor.
    fn replace_current(&mut self) -> Result<Effect> {
        match self.state() {
            SessionState::New => return Ok(Effect::Nothing),
            SessionState::Playing | SessionState::Paused => {
                self.machine.transition(SessionState::Skipped)?;
            }
            SessionState::Skipped => {}
            SessionState::Stopped | SessionState::Ended | SessionState::Disconnected => {
                self.machine.transition(SessionState::Playing)?;
            }
        }
        self.start_track()
    }

    /// Tras agregar tracks, arranca si la sesión estaba sin reproducir.
    fn start_if_idle(&mut self, was_empty: bool) -> Result<Effect> {
        match self.state() {
            SessionState::Stopped => {}
            SessionState::Ended if was_empty => {}
            SessionState::Ended if !self.queue.is_at_end() => {
                self.queue.move_by(1)?;
            }
            _ => return Ok(Effect::Nothing),
        }
        self.machine.transition(SessionState::Playing)?;
        self.start_track()
    }

    /// Fin de reproducción sin reinicio.
    fn halt(&mut self) -> Result<()> {
        if self.state() != SessionState::Ended {
            self.machine.transition(SessionState::Ended)?;
        }
        self.now_playing = None;
        Ok(())
    }

    fn enqueue(&mut self, tracks: Vec<Track>, requester: UserId) -> Result<Effect> {
        if tracks.is_empty() {
            return Ok(Effect::Unchanged);
        }
        let max = self.queue.max_size();
        if self.queue.len() + tracks.len() > max {
            return Err(SessionError::QueueFull { max });
        }

        let was_empty = self.queue.is_empty();
        let mut rng = rand::thread_rng();
        for track in tracks {
            self.queue
                .enqueue(QueuedTrack::new(track, requester), self.enqueue_mode, &mut rng)?;
        }
        self.start_if_idle(was_empty)
    }

    fn insert_at(&mut self, track: Track, requester: UserId, index: usize) -> Result<Effect> {
        let was_empty = self.queue.is_empty();
        self.queue.insert_at(QueuedTrack::new(track, requester), index)?;
        self.start_if_idle(was_empty)
    }

    fn skip(&mut self, observed: Option<TrackRef>) -> Result<Effect> {
        if observed.is_some() && observed != self.now_playing {
            debug!("⏭️ Skip obsoleto: {:?} ya no está sonando", observed);
            return Ok(Effect::Unchanged);
        }
        self.machine.check(SessionState::Skipped)?;

        if self.queue.is_at_end() {
            if self.repeat == RepeatMode::All {
                self.queue.set_position(0)?;
                self.machine.transition(SessionState::Skipped)?;
                return self.start_track();
            }
            self.halt()?;
            return Ok(Effect::Stop);
        }

        self.queue.move_by(1)?;
        self.machine.transition(SessionState::Skipped)?;
        self.start_track()
    }

    fn pause(&mut self) -> Result<Effect> {
        self.machine.transition(SessionState::Paused)?;
        Ok(Effect::Pause)
    }

    fn resume(&mut self) -> Result<Effect> {
        let from = self.state();
        if from != SessionState::Paused {
            return Err(SessionError::TransitionNotPermitted {
                from,
                to: SessionState::Playing,
            });
        }
        self.machine.transition(SessionState::Playing)?;
        Ok(Effect::Resume)
    }

    fn stop(&mut self) -> Result<Effect> {
        self.machine.transition(SessionState::Ended)?;
        self.now_playing = None;
        Ok(Effect::Stop)
    }

    fn remove(&mut self, index: usize) -> Result<Effect> {
        if self.now_playing.is_some() && self.queue.cursor() == Some(index) {
            return Err(SessionError::InvalidPosition {
                index,
                min: 0,
                max: self.queue.len().saturating_sub(1),
            });
        }
        self.queue.remove(index)?;
        Ok(Effect::Nothing)
    }

    fn apply(&mut self, command: Command) -> Result<Effect> {
        match command {
            Command::Enqueue { track, requester } => self.enqueue(vec![track], requester),
            Command::EnqueueBatch { tracks, requester } => self.enqueue(tracks, requester),
            Command::InsertAt { track, requester, index } => self.insert_at(track, requester, index),
            Command::Skip { observed } => self.skip(observed),
            Command::MoveBy { offset } => {
                if offset == 0 {
                    return Ok(Effect::Unchanged);
                }
                self.queue.move_by(offset)?;
                self.replace_current()
            }
            Command::MoveTo { index } => {
                self.queue.set_position(index)?;
                self.replace_current()
            }
            Command::Pause => self.pause(),
            Command::Resume => self.resume(),
            Command::Stop => self.stop(),
            Command::Disconnect => {
                self.machine.transition(SessionState::Disconnected)?;
                self.now_playing = None;
                Ok(Effect::Disconnect)
            }
            Command::SetRepeatMode(mode) => {
                self.repeat = mode;
                Ok(Effect::Nothing)
            }
            Command::SetEnqueueMode(mode) => {
                self.enqueue_mode = mode;
                Ok(Effect::Nothing)
            }
            Command::SetVolume(volume) => {
                self.volume = volume.min(MAX_VOLUME);
                Ok(Effect::Volume(self.volume))
            }
            Command::Remove { index } => self.remove(index),
            Command::Dequeue { requester } => {
                self.queue.dequeue(requester);
                Ok(Effect::Nothing)
            }
            Command::ClearUpcoming => {
                self.queue.clear_upcoming();
                Ok(Effect::Nothing)
            }
            Command::QueueSnapshot | Command::StateSnapshot => Ok(Effect::Unchanged),
        }
    }
}

/// Sesión autoritativa: la única instancia del clúster que muta la cola y la
/// máquina de estados de su contexto.
///
/// Los comandos y los eventos del motor pasan por `gate` en orden de llegada;
/// cada uno planifica sobre una copia del núcleo, llama al motor y sólo si
/// éste acepta reemplaza el núcleo e incrementa la versión.
pub struct LocalSession {
    context: ContextId,
    owner: NodeId,
    gate: tokio::sync::Mutex<()>,
    core: Mutex<SessionCore>,
    mirrors: Mutex<BTreeSet<NodeId>>,
    engine: Arc<dyn AudioEngine>,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<SessionEvent>,
    registry: Weak<SessionRegistry>,
}

impl LocalSession {
    pub fn new(
        context: ContextId,
        settings: &SessionSettings,
        engine: Arc<dyn AudioEngine>,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            context,
            owner: transport.node().clone(),
            gate: tokio::sync::Mutex::new(()),
            core: Mutex::new(SessionCore::new(settings)),
            mirrors: Mutex::new(BTreeSet::new()),
            engine,
            transport,
            events,
            registry: Weak::new(),
        }
    }

    /// Registro al que la sesión avisa cuando se cierra.
    pub(crate) fn attached(mut self, registry: Weak<SessionRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Conecta el motor al canal de voz: NEW -> STOPPED.
    pub async fn connect(&self) -> Result<StateSnapshot> {
        let _turn = self.gate.lock().await;
        let mut draft = self.core.lock().clone();
        draft.machine.check(SessionState::Stopped)?;

        self.engine.connect(self.context).await?;
        draft.machine.transition(SessionState::Stopped)?;
        Ok(self.commit(draft))
    }

    /// Registra un espejo remoto y devuelve el estado con el que arranca.
    pub fn subscribe(&self, node: NodeId) -> StateSnapshot {
        if self.mirrors.lock().insert(node.clone()) {
            info!("🪞 Espejo {} suscrito a {}", node, self.context);
        }
        self.state_snapshot()
    }

    pub fn unsubscribe(&self, node: &NodeId) {
        if self.mirrors.lock().remove(node) {
            info!("🪞 Espejo {} desuscrito de {}", node, self.context);
        }
    }

    pub fn mirrors(&self) -> Vec<NodeId> {
        self.mirrors.lock().iter().cloned().collect()
    }

    pub fn queue(&self) -> QueueSnapshot {
        let core = self.core.lock();
        QueueSnapshot {
            state: core.snapshot(self.context, &self.owner),
            tracks: core.queue.items().to_vec(),
        }
    }

    /// El motor confirmó que `track_ref` empezó a sonar.
    pub(crate) async fn track_started(&self, track_ref: TrackRef) -> Result<()> {
        let _turn = self.gate.lock().await;
        let mut draft = self.core.lock().clone();
        if draft.now_playing != Some(track_ref) {
            debug!("Inicio obsoleto {} en {}", track_ref, self.context);
            return Ok(());
        }

        match draft.state() {
            SessionState::Skipped | SessionState::Stopped | SessionState::Ended => {
                draft.machine.transition(SessionState::Playing)?;
                self.commit(draft.clone());
            }
            SessionState::Paused => debug!("Inicio tardío de {} con {} en pausa", track_ref, self.context),
            _ => {}
        }

        let track = draft.queue.current_track()?.clone();
        info!("▶️ Reproduciendo: {} en {}", track.title(), self.context);
        let _ = self.events.send(SessionEvent::NowPlaying {
            context: self.context,
            track,
        });
        Ok(())
    }

    /// Fin de un track: sólo un fin natural aplica la política de repetición.
    pub(crate) async fn track_finished(&self, track_ref: TrackRef, reason: FinishReason) -> Result<()> {
        let _turn = self.gate.lock().await;
        let mut draft = self.core.lock().clone();
        if draft.now_playing != Some(track_ref) {
            debug!("Fin obsoleto {} en {}", track_ref, self.context);
            return Ok(());
        }
        if !reason.may_advance() {
            debug!("Track {} terminó por {:?} en {}, sin avanzar", track_ref, reason, self.context);
            return Ok(());
        }

        draft.machine.transition(SessionState::Ended)?;
        draft.now_playing = None;
        let Some(cursor) = draft.queue.cursor() else {
            self.commit(draft);
            return Ok(());
        };

        let advance = RepeatPolicy::decide(draft.repeat, cursor, draft.queue.len());
        let Some(target) = advance.target(cursor) else {
            info!("📭 Fin de la cola en {}", self.context);
            self.commit(draft);
            return Ok(());
        };

        let ended = draft.clone();
        draft.queue.set_position(target)?;
        draft.machine.transition(SessionState::Playing)?;
        let effect = draft.start_track()?;
        debug!("🔁 {:?} en {}", advance, self.context);

        if let Err(err) = self.drive(&effect).await {
            self.commit(ended);
            return Err(err);
        }
        self.commit(draft);
        Ok(())
    }

    /// Error del motor: se intenta el siguiente track, nunca se repite.
    pub(crate) async fn track_errored(&self, track_ref: TrackRef, error: &str) -> Result<()> {
        let _turn = self.gate.lock().await;
        let mut draft = self.core.lock().clone();
        if draft.now_playing != Some(track_ref) {
            debug!("Error obsoleto {} en {}", track_ref, self.context);
            return Ok(());
        }
        warn!("❌ Track {} falló en {}: {}", track_ref, self.context, error);

        let effect = if draft.queue.is_at_end() {
            draft.halt()?;
            Effect::Stop
        } else {
            draft.queue.move_by(1)?;
            draft.replace_current()?
        };

        let mut ended = self.core.lock().clone();
        ended.halt()?;
        if let Err(err) = self.drive(&effect).await {
            self.commit(ended);
            return Err(err);
        }
        self.commit(draft);
        Ok(())
    }

    pub(crate) fn position(&self, position_ms: u64) {
        let _ = self.events.send(SessionEvent::Position {
            context: self.context,
            position_ms,
        });
    }

    /// La conexión de voz se perdió sin que se pidiera.
    pub(crate) async fn connection_lost(&self) -> Result<()> {
        let _turn = self.gate.lock().await;
        let mut draft = self.core.lock().clone();
        if draft.state().is_terminal() {
            return Ok(());
        }

        warn!("🔌 Conexión de voz perdida en {}", self.context);
        draft.machine.transition(SessionState::Disconnected)?;
        draft.now_playing = None;
        if let Err(err) = self.engine.disconnect(self.context).await {
            debug!("Limpieza del motor en {}: {}", self.context, err);
        }
        self.commit(draft);
        let _ = self.events.send(SessionEvent::Closed { context: self.context });
        drop(_turn);
        self.retire().await;
        Ok(())
    }

    /// Quita la sesión del registro y libera el contexto en el directorio.
    async fn retire(&self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.retire(self).await;
        }
    }

    async fn drive(&self, effect: &Effect) -> Result<()> {
        match effect {
            Effect::Nothing | Effect::Unchanged => Ok(()),
            Effect::Play(track_ref, item) => self.engine.play(self.context, *track_ref, item).await,
            Effect::Pause => self.engine.pause(self.context).await,
            Effect::Resume => self.engine.resume(self.context).await,
            Effect::Stop => self.engine.stop(self.context).await,
            Effect::Volume(volume) => self.engine.set_volume(self.context, *volume).await,
            Effect::Disconnect => {
                if let Err(err) = self.engine.stop(self.context).await {
                    debug!("Stop previo a desconectar falló en {}: {}", self.context, err);
                }
                if let Err(err) = self.engine.disconnect(self.context).await {
                    warn!("⚠️ Error al desconectar {}: {}", self.context, err);
                }
                Ok(())
            }
        }
    }

    /// Reemplaza el núcleo con una versión nueva y difunde exactamente un delta.
    fn commit(&self, mut draft: SessionCore) -> StateSnapshot {
        let snapshot = {
            let mut core = self.core.lock();
            draft.version = core.version + 1;
            *core = draft;
            core.snapshot(self.context, &self.owner)
        };

        debug!(
            "📦 {} v{} {} cursor={:?} len={}",
            self.context, snapshot.version, snapshot.state, snapshot.cursor, snapshot.len
        );
        for mirror in self.mirrors() {
            self.transport.notify(&mirror, snapshot.clone());
        }
        let _ = self.events.send(SessionEvent::StateChanged(snapshot.clone()));
        snapshot
    }
}

#[async_trait]
impl Session for LocalSession {
    fn context(&self) -> ContextId {
        self.context
    }

    fn owner(&self) -> NodeId {
        self.owner.clone()
    }

    fn state_snapshot(&self) -> StateSnapshot {
        self.core.lock().snapshot(self.context, &self.owner)
    }

    async fn execute(&self, command: Command) -> Result<Reply> {
        match command {
            Command::QueueSnapshot => return Ok(Reply::Queue(self.queue())),
            Command::StateSnapshot => return Ok(Reply::State(self.state_snapshot())),
            _ => {}
        }

        let name = command.name();
        let closing = matches!(command, Command::Disconnect);
        let _turn = self.gate.lock().await;

        let mut draft = self.core.lock().clone();
        if draft.state().is_terminal() {
            return Err(SessionError::NoSession(self.context));
        }

        let effect = draft.apply(command)?;
        if let Effect::Unchanged = effect {
            return Ok(Reply::State(self.state_snapshot()));
        }

        self.drive(&effect).await?;
        let snapshot = self.commit(draft);
        debug!("✅ {} aplicado en {}", name, self.context);

        if closing {
            let _ = self.events.send(SessionEvent::Closed { context: self.context });
            drop(_turn);
            self.retire().await;
        }
        Ok(Reply::State(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        audio::engine::{EngineCall, MockAudioEngine, RecordingEngine},
        cluster::memory::MemoryNetwork,
        error::ErrorKind,
    };
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId};

    const USER: UserId = UserId::new(7);

    fn context() -> ContextId {
        ContextId::new(GuildId::new(1), ChannelId::new(2))
    }

    fn track(title: &str) -> Track {
        Track::new(format!("ytsearch:{title}"), title)
    }

    async fn session_with(engine: Arc<dyn AudioEngine>) -> LocalSession {
        let network = MemoryNetwork::new();
        let transport = network.join(NodeId::from("node-0"));
        let (events, _) = broadcast::channel(64);
        let session = LocalSession::new(context(), &SessionSettings::default(), engine, transport, events);
        session.connect().await.unwrap();
        session
    }

    async fn playing(titles: &[&str]) -> (LocalSession, Arc<RecordingEngine>) {
        let engine = Arc::new(RecordingEngine::new());
        let session = session_with(engine.clone()).await;
        for title in titles {
            session.enqueue(track(title), USER).await.unwrap();
        }
        let (first, _) = engine.last_played(context()).unwrap();
        session.track_started(first).await.unwrap();
        (session, engine)
    }

    fn now_playing(session: &LocalSession) -> TrackRef {
        session.state_snapshot().now_playing.unwrap()
    }

    #[tokio::test]
    async fn connect_moves_new_to_stopped() {
        let engine = Arc::new(RecordingEngine::new());
        let session = session_with(engine.clone()).await;
        let snapshot = session.state_snapshot();
        assert_eq!(snapshot.state, SessionState::Stopped);
        assert_eq!(snapshot.version, 1);
        assert_eq!(engine.calls(context()), vec![EngineCall::Connect]);
    }

    #[tokio::test]
    async fn first_enqueue_starts_playback() {
        let (session, engine) = playing(&["a", "b"]).await;
        let snapshot = session.state_snapshot();
        assert_eq!(snapshot.state, SessionState::Playing);
        assert_eq!(snapshot.cursor, Some(0));
        assert_eq!(snapshot.len, 2);

        let plays: Vec<_> = engine
            .calls(context())
            .into_iter()
            .filter(|call| matches!(call, EngineCall::Play { .. }))
            .collect();
        assert_eq!(plays.len(), 1);
    }

    #[tokio::test]
    async fn repeat_all_walks_the_queue_and_wraps() {
        let (session, engine) = playing(&["T1", "T2", "T3"]).await;
        session.set_repeat_mode(RepeatMode::All).await.unwrap();

        for expected in [1, 2, 0] {
            let current = now_playing(&session);
            session.track_finished(current, FinishReason::Finished).await.unwrap();

            let snapshot = session.state_snapshot();
            assert_eq!(snapshot.cursor, Some(expected));
            assert_eq!(snapshot.state, SessionState::Playing);

            let (next, _) = engine.last_played(context()).unwrap();
            assert_eq!(Some(next), snapshot.now_playing);
            session.track_started(next).await.unwrap();
        }
    }

    #[tokio::test]
    async fn repeat_none_ends_at_last_track() {
        let (session, _engine) = playing(&["only"]).await;
        let current = now_playing(&session);
        session.track_finished(current, FinishReason::Finished).await.unwrap();

        let snapshot = session.state_snapshot();
        assert_eq!(snapshot.state, SessionState::Ended);
        assert_eq!(snapshot.cursor, Some(0));
        assert_eq!(snapshot.now_playing, None);
    }

    #[tokio::test]
    async fn repeat_one_replays_without_moving() {
        let (session, engine) = playing(&["a", "b"]).await;
        session.set_repeat_mode(RepeatMode::One).await.unwrap();
        let current = now_playing(&session);

        session.track_finished(current, FinishReason::Finished).await.unwrap();
        let snapshot = session.state_snapshot();
        assert_eq!(snapshot.cursor, Some(0));
        let (replay, title) = engine.last_played(context()).unwrap();
        assert_ne!(replay, current);
        assert_eq!(title, "a");
    }

    #[tokio::test]
    async fn abnormal_finish_never_advances() {
        let (session, _engine) = playing(&["a", "b"]).await;
        let before = session.state_snapshot();
        let current = now_playing(&session);

        session.track_finished(current, FinishReason::Replaced).await.unwrap();
        session.track_finished(current, FinishReason::Stopped).await.unwrap();
        assert_eq!(session.state_snapshot(), before);
    }

    #[tokio::test]
    async fn skip_and_finish_race_advances_once() {
        let (session, _engine) = playing(&["a", "b", "c"]).await;
        let current = now_playing(&session);

        session.execute(Command::Skip { observed: Some(current) }).await.unwrap();
        session.track_finished(current, FinishReason::Finished).await.unwrap();
        session.execute(Command::Skip { observed: Some(current) }).await.unwrap();

        let snapshot = session.state_snapshot();
        assert_eq!(snapshot.cursor, Some(1));
        assert_eq!(snapshot.state, SessionState::Skipped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_skip_and_finish_advance_once() {
        for _ in 0..20 {
            let (session, engine) = playing(&["a", "b", "c"]).await;
            let session = Arc::new(session);
            let current = now_playing(&session);

            let skipper = tokio::spawn({
                let session = session.clone();
                async move { session.execute(Command::Skip { observed: Some(current) }).await }
            });
            let finisher = tokio::spawn({
                let session = session.clone();
                async move { session.track_finished(current, FinishReason::Finished).await }
            });
            let (skipped, finished) = tokio::join!(skipper, finisher);
            skipped.unwrap().unwrap();
            finished.unwrap().unwrap();

            assert_eq!(session.state_snapshot().cursor, Some(1));
            let plays = engine
                .calls(context())
                .into_iter()
                .filter(|call| matches!(call, EngineCall::Play { .. }))
                .count();
            assert_eq!(plays, 2);
        }
    }

    #[tokio::test]
    async fn late_start_keeps_the_pause() {
        let engine = Arc::new(RecordingEngine::new());
        let session = session_with(engine.clone()).await;
        session.enqueue(track("a"), USER).await.unwrap();
        let (first, _) = engine.last_played(context()).unwrap();

        session.pause().await.unwrap();
        session.track_started(first).await.unwrap();
        assert_eq!(session.state_snapshot().state, SessionState::Paused);

        let resumed = session.resume().await.unwrap();
        assert_eq!(resumed.state, SessionState::Playing);
    }

    #[tokio::test]
    async fn skip_at_end_stops_the_engine() {
        let (session, engine) = playing(&["a"]).await;
        let snapshot = session.skip().await.unwrap();
        assert_eq!(snapshot.state, SessionState::Ended);
        assert_eq!(engine.calls(context()).last(), Some(&EngineCall::Stop));
    }

    #[tokio::test]
    async fn enqueue_after_end_resumes_with_new_track() {
        let (session, engine) = playing(&["a"]).await;
        let current = now_playing(&session);
        session.track_finished(current, FinishReason::Finished).await.unwrap();

        let snapshot = session.enqueue(track("b"), USER).await.unwrap();
        assert_eq!(snapshot.state, SessionState::Playing);
        assert_eq!(snapshot.cursor, Some(1));
        assert_eq!(engine.last_played(context()).unwrap().1, "b");
    }

    #[tokio::test]
    async fn errored_track_moves_forward_then_ends() {
        let (session, engine) = playing(&["a", "b"]).await;
        let first = now_playing(&session);
        session.track_errored(first, "403").await.unwrap();
        assert_eq!(session.state_snapshot().cursor, Some(1));

        let second = now_playing(&session);
        session.track_errored(second, "403").await.unwrap();
        let snapshot = session.state_snapshot();
        assert_eq!(snapshot.state, SessionState::Ended);
        assert_eq!(snapshot.cursor, Some(1));
        assert_eq!(engine.calls(context()).last(), Some(&EngineCall::Stop));
    }

    #[tokio::test]
    async fn pause_resume_and_invalid_transitions() {
        let (session, _engine) = playing(&["a"]).await;
        assert_eq!(session.pause().await.unwrap().state, SessionState::Paused);

        let err = session.pause().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransitionNotPermitted);
        assert_eq!(session.resume().await.unwrap().state, SessionState::Playing);
        assert!(session.resume().await.is_err());
    }

    #[tokio::test]
    async fn version_increments_once_per_change() {
        let (session, _engine) = playing(&["a", "b"]).await;
        let before = session.state_snapshot().version;

        session.move_by(0).await.unwrap();
        assert_eq!(session.state_snapshot().version, before);

        session.set_volume(5000).await.unwrap();
        let snapshot = session.state_snapshot();
        assert_eq!(snapshot.version, before + 1);
        assert_eq!(snapshot.volume, MAX_VOLUME);
    }

    #[tokio::test]
    async fn remove_refuses_the_loaded_track() {
        let (session, _engine) = playing(&["a", "b"]).await;
        assert_eq!(session.remove(0).await.unwrap_err().kind(), ErrorKind::InvalidPosition);
        assert_eq!(session.remove(1).await.unwrap().len, 1);
    }

    #[tokio::test]
    async fn engine_failure_leaves_state_unchanged() {
        let mut engine = MockAudioEngine::new();
        engine.expect_connect().returning(|_| Ok(()));
        engine
            .expect_play()
            .returning(|_, _, _| Err(SessionError::Engine("sin llamada".into())));
        let session = session_with(Arc::new(engine)).await;
        let before = session.state_snapshot();

        let err = session.enqueue(track("a"), USER).await.unwrap_err();
        assert_eq!(err, SessionError::Engine("sin llamada".into()));
        assert_eq!(session.state_snapshot(), before);
        assert_eq!(session.queue().tracks.len(), 0);
    }

    #[tokio::test]
    async fn disconnected_session_refuses_commands() {
        let (session, engine) = playing(&["a"]).await;
        assert_eq!(session.disconnect().await.unwrap().state, SessionState::Disconnected);
        assert!(engine.calls(context()).contains(&EngineCall::Disconnect));

        let err = session.enqueue(track("b"), USER).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSession);
    }

    #[tokio::test]
    async fn observers_see_now_playing_and_deltas() {
        let engine = Arc::new(RecordingEngine::new());
        let session = session_with(engine.clone()).await;
        let mut events = session.events.subscribe();

        session.enqueue(track("a"), USER).await.unwrap();
        let (first, _) = engine.last_played(context()).unwrap();
        session.track_started(first).await.unwrap();

        match events.recv().await.unwrap() {
            SessionEvent::StateChanged(snapshot) => assert_eq!(snapshot.state, SessionState::Playing),
            other => panic!("evento inesperado: {other:?}"),
        }
        match events.recv().await.unwrap() {
            SessionEvent::NowPlaying { track, .. } => assert_eq!(track.title(), "a"),
            other => panic!("evento inesperado: {other:?}"),
        }
    }
}
