//! # Cluster Module
//!
//! Plumbing between worker processes: who owns which context, and how
//! commands and state deltas travel between nodes.
//!
//! ## Architecture
//!
//! ### [`Transport`] - Node to node
//! - Request/response for commands, answered exactly once per issuance
//! - Fire-and-forget [`StateSnapshot`] deltas from owners to mirrors
//! - [`tcp::TcpTransport`] for real deployments, [`memory::MemoryNetwork`]
//!   for single-process runs and fault-injection tests
//!
//! ### [`directory`] - Ownership arbitration
//! - One coordinator node records `context -> owner`, first claim wins
//!
//! ### [`wire`] - Frame format
//! - serde JSON inside length-delimited frames

pub mod directory;
pub mod memory;
pub mod tcp;
pub mod wire;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{Arc, Weak},
    time::Duration,
};

use crate::{
    error::{Result, SessionError},
    session::{Command, ContextId, Reply, StateSnapshot},
};

pub use directory::{LocalDirectory, OwnershipDirectory, RemoteDirectory};

/// Identidad de un proceso del clúster.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for NodeId {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Pide al nodo destino que tome (o encuentre) la sesión del contexto.
    Connect { context: ContextId },
    Command { context: ContextId, command: Command },
    Subscribe { context: ContextId },
    Unsubscribe { context: ContextId },
    Claim { context: ContextId, candidate: NodeId },
    Release { context: ContextId, owner: NodeId },
    Lookup { context: ContextId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Session(Reply),
    Owner(Option<NodeId>),
    Done,
}

impl Response {
    pub fn into_reply(self, from: &NodeId) -> Result<Reply> {
        match self {
            Response::Session(reply) => Ok(reply),
            _ => Err(SessionError::unreachable(from, "respuesta inesperada")),
        }
    }

    pub fn into_owner(self, from: &NodeId) -> Result<Option<NodeId>> {
        match self {
            Response::Owner(owner) => Ok(owner),
            _ => Err(SessionError::unreachable(from, "respuesta inesperada")),
        }
    }
}

/// Lado receptor de un transporte: lo implementa el registro de sesiones.
#[async_trait]
pub trait Inbound: Send + Sync {
    async fn handle_request(&self, from: NodeId, request: Request) -> Result<Response>;

    fn handle_delta(&self, from: NodeId, snapshot: StateSnapshot);
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn node(&self) -> &NodeId;

    /// Una respuesta terminal por pedido. Sin timeout propio: ver [`call`].
    async fn request(&self, to: &NodeId, request: Request) -> Result<Response>;

    /// Entrega sin confirmación; un delta perdido se corrige con el siguiente.
    fn notify(&self, to: &NodeId, snapshot: StateSnapshot);

    fn bind(&self, inbound: Weak<dyn Inbound>);
}

/// Pedido con timeout explícito. Vencido el plazo el efecto es desconocido:
/// se informa `OwnerUnreachable` y no se reintenta.
pub async fn call(
    transport: &dyn Transport,
    to: &NodeId,
    request: Request,
    timeout: Duration,
) -> Result<Response> {
    match tokio::time::timeout(timeout, transport.request(to, request)).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::unreachable(
            to,
            format!("sin respuesta en {}", humantime::format_duration(timeout)),
        )),
    }
}

/// Receptor enlazado de un transporte, compartido con sus tareas.
#[derive(Default)]
pub(crate) struct InboundSlot(RwLock<Option<Weak<dyn Inbound>>>);

impl InboundSlot {
    pub(crate) fn bind(&self, inbound: Weak<dyn Inbound>) {
        *self.0.write() = Some(inbound);
    }

    pub(crate) fn get(&self) -> Option<Arc<dyn Inbound>> {
        self.0.read().as_ref().and_then(Weak::upgrade)
    }

    pub(crate) async fn dispatch(&self, local: &NodeId, from: NodeId, request: Request) -> Result<Response> {
        match self.get() {
            Some(inbound) => inbound.handle_request(from, request).await,
            None => Err(SessionError::unreachable(local, "nodo sin registro enlazado")),
        }
    }
}
