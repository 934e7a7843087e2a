use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use tracing::debug;

use super::{Inbound, InboundSlot, NodeId, Request, Response, Transport};
use crate::{
    error::{Result, SessionError},
    session::StateSnapshot,
};

/// Falla inyectada en un nodo de la red en memoria.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Los pedidos fallan de inmediato y los deltas se pierden.
    Unreachable,
    /// Los pedidos nunca reciben respuesta y los deltas se pierden.
    Stalled,
}

#[derive(Default)]
struct NetworkInner {
    nodes: DashMap<NodeId, Arc<MemoryTransport>>,
    faults: DashMap<NodeId, Fault>,
}

/// Red en proceso: cada nodo es un [`MemoryTransport`] y los mensajes se
/// entregan llamando directamente al registro destino.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, node: NodeId) -> Arc<MemoryTransport> {
        let transport = Arc::new(MemoryTransport {
            node: node.clone(),
            network: Arc::downgrade(&self.inner),
            inbound: InboundSlot::default(),
        });
        self.inner.nodes.insert(node, transport.clone());
        transport
    }

    pub fn partition(&self, node: &NodeId, fault: Fault) {
        debug!("🧪 Nodo {} con falla {:?}", node, fault);
        self.inner.faults.insert(node.clone(), fault);
    }

    pub fn heal(&self, node: &NodeId) {
        self.inner.faults.remove(node);
    }
}

pub struct MemoryTransport {
    node: NodeId,
    network: Weak<NetworkInner>,
    inbound: InboundSlot,
}

impl MemoryTransport {
    fn route(&self, to: &NodeId) -> Result<(Arc<MemoryTransport>, Option<Fault>)> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| SessionError::unreachable(to, "red cerrada"))?;
        let fault = [&self.node, to]
            .into_iter()
            .find_map(|node| network.faults.get(node).map(|fault| *fault));
        let target = network
            .nodes
            .get(to)
            .map(|node| node.clone())
            .ok_or_else(|| SessionError::unreachable(to, "nodo desconocido"))?;
        Ok((target, fault))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn node(&self) -> &NodeId {
        &self.node
    }

    async fn request(&self, to: &NodeId, request: Request) -> Result<Response> {
        let (target, fault) = self.route(to)?;
        match fault {
            Some(Fault::Unreachable) => Err(SessionError::unreachable(to, "conexión rechazada")),
            Some(Fault::Stalled) => std::future::pending().await,
            None => target.inbound.dispatch(to, self.node.clone(), request).await,
        }
    }

    fn notify(&self, to: &NodeId, snapshot: StateSnapshot) {
        match self.route(to) {
            Ok((target, None)) => {
                if let Some(inbound) = target.inbound.get() {
                    inbound.handle_delta(self.node.clone(), snapshot);
                }
            }
            Ok((_, Some(fault))) => debug!("Delta para {} perdido ({:?})", to, fault),
            Err(err) => debug!("Delta para {} perdido: {}", to, err),
        }
    }

    fn bind(&self, inbound: Weak<dyn Inbound>) {
        self.inbound.bind(inbound);
    }
}
