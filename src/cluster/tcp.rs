use async_trait::async_trait;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

use super::{
    wire::{self, Frame},
    Inbound, InboundSlot, NodeId, Request, Response, Transport,
};
use crate::{
    error::{Result, SessionError},
    session::StateSnapshot,
};

type Pending = DashMap<u64, oneshot::Sender<Result<Response>>>;

/// Conexión saliente hacia un nodo. Se abre al primer uso; los frames
/// encolados antes de conectar salen en orden.
struct Link {
    outgoing: mpsc::UnboundedSender<Frame>,
    pending: Arc<Pending>,
    closed: AtomicBool,
}

impl Link {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outgoing.is_closed()
    }

    /// Falla todos los pedidos en vuelo: su efecto queda desconocido.
    fn close(&self, peer: &NodeId, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        fail_pending(&self.pending, peer, reason);
    }
}

fn fail_pending(pending: &Pending, peer: &NodeId, reason: &str) {
    let ids: Vec<u64> = pending.iter().map(|entry| *entry.key()).collect();
    for id in ids {
        if let Some((_, waiter)) = pending.remove(&id) {
            let _ = waiter.send(Err(SessionError::unreachable(peer, reason)));
        }
    }
}

/// Quita el pedido de la tabla si quien espera se rinde (timeout).
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.id);
    }
}

/// Transporte TCP: frames JSON delimitados por longitud.
///
/// Cada nodo abre un enlace saliente por par para sus pedidos y deltas; los
/// pedidos que llegan por una conexión se atienden de a uno, en orden.
pub struct TcpTransport {
    node: NodeId,
    peers: HashMap<NodeId, SocketAddr>,
    links: DashMap<NodeId, Arc<Link>>,
    inbound: Arc<InboundSlot>,
    next_id: AtomicU64,
}

impl TcpTransport {
    pub fn new(node: NodeId, peers: HashMap<NodeId, SocketAddr>) -> Self {
        Self {
            node,
            peers,
            links: DashMap::new(),
            inbound: Arc::new(InboundSlot::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Acepta conexiones entrantes hasta que el listener falle.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!("🌐 Nodo {} escuchando en {}", self.node, listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("🔗 Conexión entrante desde {}", addr);
            let (tx, rx) = mpsc::unbounded_channel();
            let peer = NodeId::new(addr.to_string());
            tokio::spawn(run_connection(
                self.node.clone(),
                peer,
                stream,
                self.inbound.clone(),
                Arc::new(Pending::new()),
                tx,
                rx,
            ));
        }
    }

    fn link(&self, to: &NodeId) -> Result<Arc<Link>> {
        let addr = *self
            .peers
            .get(to)
            .ok_or_else(|| SessionError::unreachable(to, "nodo desconocido"))?;

        let mut entry = self
            .links
            .entry(to.clone())
            .or_insert_with(|| self.open_link(to, addr));
        if entry.is_closed() {
            *entry = self.open_link(to, addr);
        }
        Ok(Arc::clone(&entry))
    }

    fn open_link(&self, to: &NodeId, addr: SocketAddr) -> Arc<Link> {
        let (tx, rx) = mpsc::unbounded_channel();
        let link = Arc::new(Link {
            outgoing: tx.clone(),
            pending: Arc::new(Pending::new()),
            closed: AtomicBool::new(false),
        });

        let local = self.node.clone();
        let peer = to.clone();
        let inbound = self.inbound.clone();
        let task_link = Arc::downgrade(&link);
        tokio::spawn(async move {
            let stream = match TcpStream::connect(addr).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("❌ No se pudo conectar a {} ({}): {}", peer, addr, e);
                    close_link(&task_link, &peer, "conexión rechazada");
                    return;
                }
            };
            info!("🔗 Enlace abierto hacia {} ({})", peer, addr);

            let Some(pending) = task_link.upgrade().map(|link| link.pending.clone()) else {
                return;
            };
            if tx.send(Frame::Hello { node: local.clone() }).is_err() {
                return;
            }
            run_connection(local, peer.clone(), stream, inbound, pending, tx, rx).await;
            close_link(&task_link, &peer, "conexión cerrada");
        });

        link
    }
}

fn close_link(link: &Weak<Link>, peer: &NodeId, reason: &str) {
    if let Some(link) = link.upgrade() {
        link.close(peer, reason);
    }
}

/// Atiende una conexión en ambos sentidos hasta que se cierre.
async fn run_connection(
    local: NodeId,
    mut peer: NodeId,
    stream: TcpStream,
    inbound: Arc<InboundSlot>,
    pending: Arc<Pending>,
    outgoing: mpsc::UnboundedSender<Frame>,
    mut outgoing_rx: mpsc::UnboundedReceiver<Frame>,
) {
    let (mut sink, mut frames) = Framed::new(stream, LengthDelimitedCodec::new()).split();

    let writer_peer = peer.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = outgoing_rx.recv().await {
            let bytes = match wire::encode(&frame) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("Frame no serializable para {}: {}", writer_peer, e);
                    continue;
                }
            };
            if let Err(e) = sink.send(bytes).await {
                warn!("⚠️ Error al escribir a {}: {}", writer_peer, e);
                break;
            }
        }
    });

    // Pedidos entrantes en orden de llegada, uno a la vez
    let (requests, mut requests_rx) = mpsc::unbounded_channel::<(u64, NodeId, Request)>();
    let worker_inbound = inbound.clone();
    let worker_local = local.clone();
    let responses = outgoing.clone();
    let worker = tokio::spawn(async move {
        while let Some((id, from, request)) = requests_rx.recv().await {
            let result = worker_inbound.dispatch(&worker_local, from, request).await;
            if responses.send(Frame::Response { id, result }).is_err() {
                break;
            }
        }
    });

    while let Some(frame) = frames.next().await {
        let bytes = match frame {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("⚠️ Error al leer de {}: {}", peer, e);
                break;
            }
        };

        match wire::decode(&bytes) {
            Ok(Frame::Hello { node }) => {
                debug!("👋 {} se identificó como {}", peer, node);
                peer = node;
            }
            Ok(Frame::Request { id, from, request }) => {
                if requests.send((id, from, request)).is_err() {
                    break;
                }
            }
            Ok(Frame::Response { id, result }) => {
                if let Some((_, waiter)) = pending.remove(&id) {
                    let _ = waiter.send(result);
                }
            }
            Ok(Frame::Delta { from, snapshot }) => {
                if let Some(inbound) = inbound.get() {
                    inbound.handle_delta(from, snapshot);
                }
            }
            Err(e) => warn!("Frame inválido de {}: {}", peer, e),
        }
    }

    debug!("🔌 Conexión con {} cerrada", peer);
    drop(requests);
    let _ = worker.await;
    writer.abort();
    fail_pending(&pending, &peer, "conexión cerrada");
}

#[async_trait]
impl Transport for TcpTransport {
    fn node(&self) -> &NodeId {
        &self.node
    }

    async fn request(&self, to: &NodeId, request: Request) -> Result<Response> {
        if to == &self.node {
            return self.inbound.dispatch(&self.node, self.node.clone(), request).await;
        }

        let link = self.link(to)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        link.pending.insert(id, tx);
        let _guard = PendingGuard {
            pending: &link.pending,
            id,
        };

        let frame = Frame::Request {
            id,
            from: self.node.clone(),
            request,
        };
        if link.outgoing.send(frame).is_err() {
            return Err(SessionError::unreachable(to, "enlace cerrado"));
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(SessionError::unreachable(to, "conexión cerrada")),
        }
    }

    fn notify(&self, to: &NodeId, snapshot: StateSnapshot) {
        let frame = Frame::Delta {
            from: self.node.clone(),
            snapshot,
        };
        match self.link(to) {
            Ok(link) => {
                if link.outgoing.send(frame).is_err() {
                    debug!("Delta para {} perdido: enlace cerrado", to);
                }
            }
            Err(err) => debug!("Delta para {} perdido: {}", to, err),
        }
    }

    fn bind(&self, inbound: Weak<dyn Inbound>) {
        self.inbound.bind(inbound);
    }
}
