use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

use super::{call, NodeId, Request, Response, Transport};
use crate::{
    error::{Result, SessionError},
    session::ContextId,
};

/// Quién es dueño de cada contexto. Para un contexto dado, exactamente un
/// `claim` gana; los demás reciben el nombre del ganador.
#[async_trait]
pub trait OwnershipDirectory: Send + Sync {
    /// Devuelve el dueño resultante, que puede no ser `candidate`.
    async fn claim(&self, context: ContextId, candidate: &NodeId) -> Result<NodeId>;

    /// Sólo el dueño registrado puede liberar.
    async fn release(&self, context: ContextId, owner: &NodeId) -> Result<()>;

    async fn lookup(&self, context: ContextId) -> Result<Option<NodeId>>;
}

/// Directorio autoritativo, corre en el nodo coordinador.
#[derive(Debug, Default)]
pub struct LocalDirectory {
    owners: DashMap<ContextId, NodeId>,
}

impl LocalDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OwnershipDirectory for LocalDirectory {
    async fn claim(&self, context: ContextId, candidate: &NodeId) -> Result<NodeId> {
        let owner = match self.owners.entry(context) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                info!("🏷️ {} es dueño de {}", candidate, context);
                entry.insert(candidate.clone());
                candidate.clone()
            }
        };
        Ok(owner)
    }

    async fn release(&self, context: ContextId, owner: &NodeId) -> Result<()> {
        if self.owners.remove_if(&context, |_, current| current == owner).is_some() {
            info!("🏷️ {} liberó {}", owner, context);
        } else {
            debug!("Liberación ignorada de {} para {}", owner, context);
        }
        Ok(())
    }

    async fn lookup(&self, context: ContextId) -> Result<Option<NodeId>> {
        Ok(self.owners.get(&context).map(|owner| owner.clone()))
    }
}

/// Reenvía las operaciones al coordinador.
pub struct RemoteDirectory {
    coordinator: NodeId,
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl RemoteDirectory {
    pub fn new(coordinator: NodeId, transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self {
            coordinator,
            transport,
            timeout,
        }
    }

    async fn ask(&self, request: Request) -> Result<Response> {
        call(self.transport.as_ref(), &self.coordinator, request, self.timeout).await
    }
}

#[async_trait]
impl OwnershipDirectory for RemoteDirectory {
    async fn claim(&self, context: ContextId, candidate: &NodeId) -> Result<NodeId> {
        let response = self
            .ask(Request::Claim {
                context,
                candidate: candidate.clone(),
            })
            .await?;
        response
            .into_owner(&self.coordinator)?
            .ok_or_else(|| SessionError::unreachable(&self.coordinator, "claim sin dueño"))
    }

    async fn release(&self, context: ContextId, owner: &NodeId) -> Result<()> {
        self.ask(Request::Release {
            context,
            owner: owner.clone(),
        })
        .await?;
        Ok(())
    }

    async fn lookup(&self, context: ContextId) -> Result<Option<NodeId>> {
        self.ask(Request::Lookup { context })
            .await?
            .into_owner(&self.coordinator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serenity::model::id::{ChannelId, GuildId};

    fn context() -> ContextId {
        ContextId::new(GuildId::new(5), ChannelId::new(6))
    }

    #[tokio::test]
    async fn first_claim_wins() {
        let directory = LocalDirectory::new();
        let a = NodeId::from("a");
        let b = NodeId::from("b");

        assert_eq!(directory.claim(context(), &a).await.unwrap(), a);
        assert_eq!(directory.claim(context(), &b).await.unwrap(), a);
        assert_eq!(directory.lookup(context()).await.unwrap(), Some(a));
    }

    #[tokio::test]
    async fn only_the_owner_releases() {
        let directory = LocalDirectory::new();
        let a = NodeId::from("a");
        let b = NodeId::from("b");
        directory.claim(context(), &a).await.unwrap();

        directory.release(context(), &b).await.unwrap();
        assert_eq!(directory.lookup(context()).await.unwrap(), Some(a.clone()));

        directory.release(context(), &a).await.unwrap();
        assert_eq!(directory.lookup(context()).await.unwrap(), None);
        assert_eq!(directory.claim(context(), &b).await.unwrap(), b);
    }
}
