use async_trait::async_trait;
use dashmap::DashMap;
use serenity::model::id::GuildId;
use std::{
    sync::{Arc, Weak},
    time::Duration,
};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    local::SessionSettings, Command, ContextId, LocalSession, RemoteSession, Reply, Session,
    SessionEvent, SessionHandle, StateSnapshot,
};
use crate::{
    audio::engine::AudioEngine,
    cluster::{call, Inbound, NodeId, OwnershipDirectory, Request, Response, Transport},
    error::{Result, SessionError},
};

/// Capacidad del canal de observadores.
const EVENT_CAPACITY: usize = 256;

/// Mapa del proceso: contexto -> sesión válida en este nodo (local o espejo).
///
/// Crear una entrada sólo ocurre con el lock de creación del contexto
/// tomado; quién queda como dueño lo decide el directorio.
pub struct SessionRegistry {
    node: NodeId,
    engine: Arc<dyn AudioEngine>,
    transport: Arc<dyn Transport>,
    directory: Arc<dyn OwnershipDirectory>,
    settings: SessionSettings,
    remote_timeout: Duration,
    sessions: DashMap<ContextId, SessionHandle>,
    creating: DashMap<ContextId, Arc<tokio::sync::Mutex<()>>>,
    events: broadcast::Sender<SessionEvent>,
    this: Weak<SessionRegistry>,
}

impl SessionRegistry {
    pub fn new(
        engine: Arc<dyn AudioEngine>,
        transport: Arc<dyn Transport>,
        directory: Arc<dyn OwnershipDirectory>,
        settings: SessionSettings,
        remote_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let registry = Arc::new_cyclic(|this| Self {
            node: transport.node().clone(),
            engine,
            transport: transport.clone(),
            directory,
            settings,
            remote_timeout,
            sessions: DashMap::new(),
            creating: DashMap::new(),
            events,
            this: this.clone(),
        });

        let inbound: Weak<SessionRegistry> = Arc::downgrade(&registry);
        transport.bind(inbound);
        registry
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Observadores externos: estado, now playing, posición, fallas.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Publica una falla a los observadores.
    pub fn report(&self, context: ContextId, error: SessionError) {
        let _ = self.events.send(SessionEvent::Failed { context, error });
    }

    fn live(&self, context: ContextId) -> Option<SessionHandle> {
        self.sessions
            .get(&context)
            .map(|handle| handle.clone())
            .filter(SessionHandle::is_live)
    }

    fn creation_lock(&self, context: ContextId) -> Arc<tokio::sync::Mutex<()>> {
        self.creating.entry(context).or_default().clone()
    }

    /// Devuelve la sesión del contexto, creándola si hace falta.
    ///
    /// Si este nodo gana el directorio se conecta el motor y queda una sesión
    /// local; si gana otro, queda un espejo suscrito al ganador.
    pub async fn get_or_create(&self, context: ContextId) -> Result<Arc<dyn Session>> {
        if let Some(handle) = self.live(context) {
            return Ok(handle.session());
        }

        let lock = self.creation_lock(context);
        let _creating = lock.lock().await;
        if let Some(handle) = self.live(context) {
            return Ok(handle.session());
        }

        let owner = self.directory.claim(context, &self.node).await?;
        let handle = if owner == self.node {
            SessionHandle::Local(self.create_local(context).await?)
        } else {
            info!("🪞 {} pertenece a {}, creando espejo", context, owner);
            let remote = RemoteSession::subscribe(context, owner, self.transport.clone(), self.remote_timeout).await?;
            SessionHandle::Remote(Arc::new(remote))
        };

        self.sessions.insert(context, handle.clone());
        Ok(handle.session())
    }

    async fn create_local(&self, context: ContextId) -> Result<Arc<LocalSession>> {
        if let Some(other) = self.local_context_in_guild(context.guild_id) {
            warn!("⚠️ Ya hay una sesión en {} para el guild de {}", other, context);
            self.release(context).await;
            return Err(SessionError::SessionAlreadyExists(other));
        }

        let session = Arc::new(
            LocalSession::new(
                context,
                &self.settings,
                self.engine.clone(),
                self.transport.clone(),
                self.events.clone(),
            )
            .attached(self.this.clone()),
        );
        if let Err(err) = session.connect().await {
            warn!("❌ No se pudo conectar {}: {}", context, err);
            self.release(context).await;
            return Err(err);
        }

        info!("✅ Sesión local creada para {}", context);
        Ok(session)
    }

    /// Pide a `node` que tome el contexto y devuelve un handle hacia el dueño.
    pub async fn connect_on(&self, node: &NodeId, context: ContextId) -> Result<Arc<dyn Session>> {
        if node == &self.node {
            return self.get_or_create(context).await;
        }
        if let Some(handle) = self.live(context) {
            return Ok(handle.session());
        }

        let lock = self.creation_lock(context);
        let _creating = lock.lock().await;
        let response = call(
            self.transport.as_ref(),
            node,
            Request::Connect { context },
            self.remote_timeout,
        )
        .await?;
        let snapshot = response.into_reply(node)?.into_state();

        let remote = if snapshot.owner == *node {
            RemoteSession::new(snapshot, self.transport.clone(), self.remote_timeout)
        } else {
            RemoteSession::subscribe(context, snapshot.owner, self.transport.clone(), self.remote_timeout).await?
        };
        let handle = SessionHandle::Remote(Arc::new(remote));
        self.sessions.insert(context, handle.clone());
        Ok(handle.session())
    }

    pub fn get(&self, context: ContextId) -> Result<Arc<dyn Session>> {
        self.live(context)
            .map(|handle| handle.session())
            .ok_or(SessionError::NoSession(context))
    }

    /// Sesión local del contexto, si este nodo es el dueño.
    pub fn local(&self, context: ContextId) -> Option<Arc<LocalSession>> {
        match self.sessions.get(&context)?.value() {
            SessionHandle::Local(local) => Some(local.clone()),
            SessionHandle::Remote(_) => None,
        }
    }

    /// Contexto con sesión local viva en el guild (a lo sumo uno).
    pub fn local_context_in_guild(&self, guild_id: GuildId) -> Option<ContextId> {
        self.sessions
            .iter()
            .filter(|entry| entry.key().guild_id == guild_id)
            .filter(|entry| entry.value().is_local() && entry.value().is_live())
            .map(|entry| *entry.key())
            .next()
    }

    pub fn contexts(&self) -> Vec<ContextId> {
        self.sessions.iter().map(|entry| *entry.key()).collect()
    }

    /// Quita la entrada; una sesión local libera además su lugar en el directorio.
    pub async fn remove(&self, context: ContextId) {
        let Some((_, handle)) = self.sessions.remove(&context) else {
            return;
        };

        match handle {
            SessionHandle::Local(_) => self.release(context).await,
            SessionHandle::Remote(remote) => remote.unsubscribe().await,
        }
        self.forget_creation(context);
        info!("🗑️ Sesión {} eliminada del registro", context);
    }

    /// Una sesión local cerrada se quita sola, sólo si sigue siendo la registrada.
    pub(crate) async fn retire(&self, session: &LocalSession) {
        let context = session.context();
        let removed = self.sessions.remove_if(&context, |_, handle| {
            matches!(handle, SessionHandle::Local(local) if std::ptr::eq(Arc::as_ptr(local), session))
        });
        if removed.is_none() {
            return;
        }

        self.release(context).await;
        self.forget_creation(context);
        info!("🗑️ Sesión {} eliminada del registro", context);
    }

    /// Descarta el lock de creación si nadie lo está usando.
    fn forget_creation(&self, context: ContextId) {
        self.creating.remove_if(&context, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn release(&self, context: ContextId) {
        if let Err(err) = self.directory.release(context, &self.node).await {
            warn!("⚠️ No se pudo liberar {}: {}", context, err);
        }
    }

    /// Desconecta la sesión (local o remota) y la quita del registro.
    pub async fn disconnect(&self, context: ContextId) -> Result<StateSnapshot> {
        let session = self.get(context)?;
        let snapshot = session.disconnect().await?;
        self.remove(context).await;
        Ok(snapshot)
    }

    /// Cierra todo lo que tenga este nodo.
    pub async fn shutdown(&self) {
        for context in self.contexts() {
            if let Some(local) = self.local(context) {
                if let Err(err) = local.disconnect().await {
                    debug!("Cierre de {}: {}", context, err);
                }
            }
            self.remove(context).await;
        }
        info!("👋 Registro de {} cerrado", self.node);
    }

    async fn run_command(&self, context: ContextId, command: Command) -> Result<Reply> {
        let local = self.local(context).ok_or(SessionError::NoSession(context))?;
        local.execute(command).await
    }

    /// Espera a que termine una creación en curso antes de buscar la sesión local.
    async fn settled_local(&self, context: ContextId) -> Result<Arc<LocalSession>> {
        let lock = self.creation_lock(context);
        let _settled = lock.lock().await;
        self.local(context)
            .filter(|local| !local.state_snapshot().state.is_terminal())
            .ok_or(SessionError::NoSession(context))
    }
}

#[async_trait]
impl Inbound for SessionRegistry {
    async fn handle_request(&self, from: NodeId, request: Request) -> Result<Response> {
        debug!("📨 Pedido de {}: {:?}", from, request);
        match request {
            Request::Connect { context } => {
                let session = self.get_or_create(context).await?;
                if let Some(local) = self.local(context) {
                    local.subscribe(from);
                }
                Ok(Response::Session(Reply::State(session.state_snapshot())))
            }
            Request::Command { context, command } => {
                self.run_command(context, command).await.map(Response::Session)
            }
            Request::Subscribe { context } => {
                let local = self.settled_local(context).await?;
                Ok(Response::Session(Reply::State(local.subscribe(from))))
            }
            Request::Unsubscribe { context } => {
                if let Some(local) = self.local(context) {
                    local.unsubscribe(&from);
                }
                Ok(Response::Done)
            }
            Request::Claim { context, candidate } => {
                let owner = self.directory.claim(context, &candidate).await?;
                Ok(Response::Owner(Some(owner)))
            }
            Request::Release { context, owner } => {
                self.directory.release(context, &owner).await?;
                Ok(Response::Done)
            }
            Request::Lookup { context } => self.directory.lookup(context).await.map(Response::Owner),
        }
    }

    fn handle_delta(&self, from: NodeId, snapshot: StateSnapshot) {
        let context = snapshot.context;
        let Some(SessionHandle::Remote(remote)) = self.sessions.get(&context).map(|h| h.clone()) else {
            debug!("Delta de {} sin espejo para {}", from, context);
            return;
        };
        if !remote.apply_delta(snapshot.clone()) {
            return;
        }

        let closed = snapshot.state.is_terminal();
        let _ = self.events.send(SessionEvent::StateChanged(snapshot));
        if closed {
            self.sessions.remove(&context);
            info!("🔌 {} cerrada por su dueño {}", context, from);
            let _ = self.events.send(SessionEvent::Closed { context });
        }
    }
}
