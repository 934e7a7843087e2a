use async_trait::async_trait;
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use super::{Command, ContextId, Reply, Session, StateSnapshot};
use crate::{
    cluster::{call, NodeId, Request, Transport},
    error::Result,
};

/// Espejo de una sesión cuyo dueño es otro nodo.
///
/// Cada comando viaja al dueño y espera su confirmación; sólo con una
/// confirmación exitosa se actualiza el espejo. Las lecturas sin suspensión
/// devuelven el último estado conocido.
pub struct RemoteSession {
    context: ContextId,
    owner: NodeId,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    mirror: Mutex<StateSnapshot>,
}

impl RemoteSession {
    pub fn new(snapshot: StateSnapshot, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            context: snapshot.context,
            owner: snapshot.owner.clone(),
            transport,
            timeout,
            mirror: Mutex::new(snapshot),
        }
    }

    /// Se suscribe a los deltas del dueño y arranca con su estado actual.
    pub async fn subscribe(
        context: ContextId,
        owner: NodeId,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Result<Self> {
        let response = call(transport.as_ref(), &owner, Request::Subscribe { context }, timeout).await?;
        let snapshot = response.into_reply(&owner)?.into_state();
        debug!("🪞 Espejo de {} creado (dueño {}, v{})", context, owner, snapshot.version);
        Ok(Self::new(snapshot, transport, timeout))
    }

    pub async fn unsubscribe(&self) {
        let request = Request::Unsubscribe { context: self.context };
        if let Err(err) = call(self.transport.as_ref(), &self.owner, request, self.timeout).await {
            warn!("⚠️ No se pudo desuscribir {} de {}: {}", self.context, self.owner, err);
        }
    }

    /// Aplica un delta si es más nuevo que el espejo. Devuelve si se aplicó.
    pub fn apply_delta(&self, snapshot: StateSnapshot) -> bool {
        let mut mirror = self.mirror.lock();
        if snapshot.context != self.context || snapshot.version <= mirror.version {
            return false;
        }
        *mirror = snapshot;
        true
    }
}

#[async_trait]
impl Session for RemoteSession {
    fn context(&self) -> ContextId {
        self.context
    }

    fn owner(&self) -> NodeId {
        self.owner.clone()
    }

    fn state_snapshot(&self) -> StateSnapshot {
        self.mirror.lock().clone()
    }

    async fn execute(&self, command: Command) -> Result<Reply> {
        let name = command.name();
        let request = Request::Command {
            context: self.context,
            command,
        };

        let reply = call(self.transport.as_ref(), &self.owner, request, self.timeout)
            .await?
            .into_reply(&self.owner)?;
        self.apply_delta(reply.state().clone());
        debug!("✅ {} confirmado por {} para {}", name, self.owner, self.context);
        Ok(reply)
    }
}
