use open_music_sessions::{
    audio::{engine::RecordingEngine, state::SessionState, track::Track},
    cluster::{
        memory::{Fault, MemoryNetwork},
        LocalDirectory, NodeId, OwnershipDirectory, RemoteDirectory,
    },
    error::ErrorKind,
    session::{local::SessionSettings, ContextId, Session, SessionEvent, SessionRegistry},
};
use pretty_assertions::assert_eq;
use serenity::model::id::{ChannelId, GuildId, UserId};
use std::{sync::Arc, time::Duration};

const TIMEOUT: Duration = Duration::from_millis(200);

struct Node {
    registry: Arc<SessionRegistry>,
    engine: Arc<RecordingEngine>,
}

/// `node-a` coordina; el resto le pregunta por los dueños.
fn cluster(names: &[&str]) -> (MemoryNetwork, Vec<Node>) {
    let network = MemoryNetwork::new();
    let coordinator = NodeId::from(names[0]);
    let nodes = names
        .iter()
        .map(|name| {
            let transport = network.join(NodeId::from(*name));
            let directory: Arc<dyn OwnershipDirectory> = if *name == names[0] {
                Arc::new(LocalDirectory::new())
            } else {
                Arc::new(RemoteDirectory::new(coordinator.clone(), transport.clone(), TIMEOUT))
            };
            let engine = Arc::new(RecordingEngine::new());
            let registry = SessionRegistry::new(
                engine.clone(),
                transport,
                directory,
                SessionSettings::default(),
                TIMEOUT,
            );
            Node { registry, engine }
        })
        .collect();
    (network, nodes)
}

fn context() -> ContextId {
    ContextId::new(GuildId::new(7), ChannelId::new(70))
}

fn user() -> UserId {
    UserId::new(42)
}

#[tokio::test]
async fn concurrent_creation_yields_exactly_one_owner() {
    let (_network, nodes) = cluster(&["node-a", "node-b", "node-c"]);

    let (a, b, c) = tokio::join!(
        nodes[0].registry.get_or_create(context()),
        nodes[1].registry.get_or_create(context()),
        nodes[2].registry.get_or_create(context()),
    );
    let sessions = [a.unwrap(), b.unwrap(), c.unwrap()];

    let locals = nodes
        .iter()
        .filter(|node| node.registry.local(context()).is_some())
        .count();
    assert_eq!(locals, 1);

    let owner = sessions[0].owner();
    assert!(sessions.iter().all(|session| session.owner() == owner));
}

#[tokio::test]
async fn remote_commands_are_applied_by_the_owner() {
    let (_network, nodes) = cluster(&["node-a", "node-b"]);
    let local = nodes[0].registry.get_or_create(context()).await.unwrap();
    let remote = nodes[1].registry.get_or_create(context()).await.unwrap();
    assert_eq!(remote.owner(), NodeId::from("node-a"));
    assert!(nodes[1].registry.local(context()).is_none());

    remote.enqueue(Track::new("ytsearch:uno", "uno"), user()).await.unwrap();
    remote.enqueue(Track::new("ytsearch:dos", "dos"), user()).await.unwrap();
    let acked = remote.skip().await.unwrap();

    assert_eq!(acked, local.state_snapshot());
    assert_eq!(remote.state_snapshot(), local.state_snapshot());
    assert_eq!(acked.state, SessionState::Skipped);
    assert_eq!(acked.cursor, Some(1));
    assert_eq!(nodes[0].engine.last_played(context()).unwrap().1, "dos");
    assert!(nodes[1].engine.last_played(context()).is_none());

    let queue = remote.queue_snapshot().await.unwrap();
    assert_eq!(queue.current().map(|item| item.title()), Some("dos"));
}

#[tokio::test]
async fn local_changes_reach_the_mirror() {
    let (_network, nodes) = cluster(&["node-a", "node-b"]);
    let local = nodes[0].registry.get_or_create(context()).await.unwrap();
    let remote = nodes[1].registry.get_or_create(context()).await.unwrap();

    local.enqueue(Track::new("ytsearch:uno", "uno"), user()).await.unwrap();
    local.pause().await.unwrap();

    let mirrored = remote.state_snapshot();
    assert_eq!(mirrored, local.state_snapshot());
    assert_eq!(mirrored.state, SessionState::Paused);
}

#[tokio::test]
async fn unreachable_owner_fails_without_touching_the_mirror() {
    let (network, nodes) = cluster(&["node-a", "node-b"]);
    nodes[0].registry.get_or_create(context()).await.unwrap();
    let remote = nodes[1].registry.get_or_create(context()).await.unwrap();
    let before = remote.state_snapshot();
    let owner = NodeId::from("node-a");

    for fault in [Fault::Unreachable, Fault::Stalled] {
        network.partition(&owner, fault);
        let err = remote
            .enqueue(Track::new("ytsearch:uno", "uno"), user())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OwnerUnreachable);
        assert_eq!(remote.state_snapshot(), before);
    }

    network.heal(&owner);
    let after = remote.enqueue(Track::new("ytsearch:dos", "dos"), user()).await.unwrap();
    assert_eq!(after.state, SessionState::Playing);
}

#[tokio::test]
async fn owner_disconnect_closes_every_mirror() {
    let (_network, nodes) = cluster(&["node-a", "node-b"]);
    nodes[0].registry.get_or_create(context()).await.unwrap();
    nodes[1].registry.get_or_create(context()).await.unwrap();
    let mut observed = nodes[1].registry.subscribe();

    let closed = nodes[0].registry.disconnect(context()).await.unwrap();
    assert_eq!(closed.state, SessionState::Disconnected);

    assert_eq!(
        nodes[1].registry.get(context()).unwrap_err().kind(),
        ErrorKind::NoSession
    );
    let mut saw_close = false;
    while let Ok(event) = observed.try_recv() {
        if event == (SessionEvent::Closed { context: context() }) {
            saw_close = true;
        }
    }
    assert!(saw_close);

    // El contexto queda libre para cualquier nodo
    let fresh = nodes[1].registry.get_or_create(context()).await.unwrap();
    assert_eq!(fresh.owner(), NodeId::from("node-b"));
    assert!(nodes[1].registry.local(context()).is_some());
}

#[tokio::test]
async fn disconnect_from_a_mirror_frees_the_context() {
    let (_network, nodes) = cluster(&["node-a", "node-b"]);
    nodes[0].registry.get_or_create(context()).await.unwrap();
    nodes[1].registry.get_or_create(context()).await.unwrap();

    let closed = nodes[1].registry.disconnect(context()).await.unwrap();
    assert_eq!(closed.state, SessionState::Disconnected);
    assert!(nodes[0].registry.local(context()).is_none());
    assert!(nodes[1].registry.get(context()).is_err());

    let fresh = nodes[0].registry.get_or_create(context()).await.unwrap();
    assert_eq!(fresh.state_snapshot().state, SessionState::Stopped);
}

#[tokio::test]
async fn closing_the_owner_handle_lets_another_node_take_over() {
    let (_network, nodes) = cluster(&["node-a", "node-b"]);
    let session = nodes[0].registry.get_or_create(context()).await.unwrap();
    assert_eq!(session.owner(), NodeId::from("node-a"));

    let closed = session.disconnect().await.unwrap();
    assert_eq!(closed.state, SessionState::Disconnected);
    assert_eq!(
        nodes[0].registry.get(context()).unwrap_err().kind(),
        ErrorKind::NoSession
    );

    let fresh = nodes[1].registry.get_or_create(context()).await.unwrap();
    assert_eq!(fresh.owner(), NodeId::from("node-b"));
    assert!(nodes[1].registry.local(context()).is_some());
}
