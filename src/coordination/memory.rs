//! In-process coordination tree.
//!
//! [`MemoryTree`] is a shared tree of persistent and ephemeral nodes with
//! sessions and one-shot child watches.  Every [`MemorySession`] opened on it
//! behaves like a separate client connection.  The tree also exposes fault
//! injection (disconnect, reconnect, expire a session, refuse connections,
//! force create conflicts) and call counters, which the registry tests rely on.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tracing::debug;

use super::{
    ancestors, join_path, split_path, validate_path, Connector, CoordinationClient,
    CoordinationError, SessionEvent, Watch, WatchEvent, WatchEventKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionStatus {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

struct SessionEntry {
    status: SessionStatus,
    events: broadcast::Sender<SessionEvent>,
}

struct Node {
    /// Owning session for ephemeral nodes.
    owner: Option<String>,
}

struct PendingWatch {
    session: String,
    tx: oneshot::Sender<WatchEvent>,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TreeStats {
    pub ephemeral_creates: u64,
    pub deletes: u64,
    pub sessions_opened: u64,
}

#[derive(Default)]
struct TreeState {
    nodes: BTreeMap<String, Node>,
    watches: HashMap<String, Vec<PendingWatch>>,
    sessions: HashMap<String, SessionEntry>,
    next_session: u64,
    forced_conflicts: u32,
    refuse_connections: bool,
    stats: TreeStats,
}

impl TreeState {
    fn check_session(&self, id: &str) -> Result<(), CoordinationError> {
        match self.sessions.get(id).map(|s| s.status) {
            Some(SessionStatus::Connected) => Ok(()),
            Some(SessionStatus::Disconnected) => Err(CoordinationError::ConnectionLoss(format!(
                "session {id} disconnected"
            ))),
            Some(SessionStatus::Expired) => Err(CoordinationError::SessionExpired),
            Some(SessionStatus::Closed) | None => Err(CoordinationError::Closed),
        }
    }

    fn exists(&self, path: &str) -> bool {
        path == "/" || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Vec<String> {
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        self.nodes
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, _)| {
                let rest = &k[prefix.len()..];
                (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
            })
            .collect()
    }

    fn fire(&mut self, path: &str, kind: WatchEventKind) {
        if let Some(pending) = self.watches.remove(path) {
            for watch in pending {
                let _ = watch.tx.send(WatchEvent {
                    path: path.to_string(),
                    kind,
                });
            }
        }
    }

    fn fire_parent(&mut self, path: &str) {
        if let Some((parent, _)) = split_path(path) {
            let parent = parent.to_string();
            self.fire(&parent, WatchEventKind::ChildrenChanged);
        }
    }

    /// Drop everything a session owned and invalidate its watches.
    fn release_session(&mut self, id: &str) {
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, n)| n.owner.as_deref() == Some(id))
            .map(|(k, _)| k.clone())
            .collect();
        for path in owned {
            self.nodes.remove(&path);
            self.fire_parent(&path);
        }

        for (path, pending) in self.watches.iter_mut() {
            let (mine, others): (Vec<_>, Vec<_>) =
                std::mem::take(pending).into_iter().partition(|w| w.session == id);
            *pending = others;
            for watch in mine {
                let _ = watch.tx.send(WatchEvent {
                    path: path.clone(),
                    kind: WatchEventKind::SessionClosed,
                });
            }
        }
        self.watches.retain(|_, v| !v.is_empty());
    }

    fn set_status(&mut self, id: &str, status: SessionStatus, event: Option<SessionEvent>) {
        if let Some(entry) = self.sessions.get_mut(id) {
            entry.status = status;
            if let Some(event) = event {
                let _ = entry.events.send(event);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemoryTree
// ---------------------------------------------------------------------------

/// Shared in-process tree store.
#[derive(Default)]
pub struct MemoryTree {
    state: Mutex<TreeState>,
}

impl MemoryTree {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Open a new connected session.
    pub fn open_session(self: &Arc<Self>) -> Arc<MemorySession> {
        let mut state = self.state.lock();
        state.next_session += 1;
        state.stats.sessions_opened += 1;
        let id = format!("mem-{}", state.next_session);
        let (events, _) = broadcast::channel(64);
        state.sessions.insert(
            id.clone(),
            SessionEntry {
                status: SessionStatus::Connected,
                events: events.clone(),
            },
        );
        debug!(session = %id, "memory session opened");
        Arc::new(MemorySession {
            id,
            tree: Arc::clone(self),
            events,
        })
    }

    pub fn connector(self: &Arc<Self>) -> MemoryConnector {
        MemoryConnector {
            tree: Arc::clone(self),
        }
    }

    /// Simulate a transient network loss for `session`.
    pub fn disconnect(&self, session: &str) {
        self.state.lock().set_status(
            session,
            SessionStatus::Disconnected,
            Some(SessionEvent::Disconnected),
        );
    }

    /// Restore a disconnected session with its identity intact.
    pub fn reconnect(&self, session: &str) {
        let mut state = self.state.lock();
        if state.sessions.get(session).map(|s| s.status) == Some(SessionStatus::Disconnected) {
            state.set_status(session, SessionStatus::Connected, Some(SessionEvent::Connected));
        }
    }

    /// Expire `session`: its ephemeral nodes vanish and its watches die.
    pub fn expire(&self, session: &str) {
        let mut state = self.state.lock();
        state.release_session(session);
        state.set_status(session, SessionStatus::Expired, Some(SessionEvent::Expired));
        debug!(%session, "memory session expired");
    }

    /// Make the next `count` ephemeral creates fail with `NodeExists`.
    pub fn inject_conflicts(&self, count: u32) {
        self.state.lock().forced_conflicts = count;
    }

    /// Reject (or accept again) new sessions from [`MemoryConnector`].
    pub fn refuse_connections(&self, refuse: bool) {
        self.state.lock().refuse_connections = refuse;
    }

    pub fn stats(&self) -> TreeStats {
        self.state.lock().stats
    }

    pub fn exists(&self, path: &str) -> bool {
        self.state.lock().exists(path)
    }

    pub fn children(&self, path: &str) -> Vec<String> {
        self.state.lock().children(path)
    }

    /// Number of armed watches on `path`.
    pub fn watch_count(&self, path: &str) -> usize {
        self.state.lock().watches.get(path).map_or(0, Vec::len)
    }

    /// Owner session of an ephemeral node.
    pub fn owner(&self, path: &str) -> Option<String> {
        self.state.lock().nodes.get(path).and_then(|n| n.owner.clone())
    }
}

// ---------------------------------------------------------------------------
// MemorySession
// ---------------------------------------------------------------------------

/// One client session on a [`MemoryTree`].
pub struct MemorySession {
    id: String,
    tree: Arc<MemoryTree>,
    events: broadcast::Sender<SessionEvent>,
}

impl MemorySession {
    pub fn id(&self) -> &str {
        &self.id
    }
}

#[async_trait]
impl CoordinationClient for MemorySession {
    fn session_id(&self) -> String {
        self.id.clone()
    }

    async fn create(&self, path: &str) -> Result<(), CoordinationError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        state.check_session(&self.id)?;
        for p in ancestors(path) {
            if !state.nodes.contains_key(&p) {
                state.nodes.insert(p.clone(), Node { owner: None });
                state.fire_parent(&p);
            }
        }
        Ok(())
    }

    async fn create_ephemeral(&self, root: &str, node: &str) -> Result<String, CoordinationError> {
        validate_path(root)?;
        let full = join_path(root, node);
        let mut state = self.tree.state.lock();
        state.check_session(&self.id)?;
        state.stats.ephemeral_creates += 1;

        if state.forced_conflicts > 0 {
            state.forced_conflicts -= 1;
            return Err(CoordinationError::NodeExists { path: full });
        }
        if !state.exists(root) {
            return Err(CoordinationError::NoNode {
                path: root.to_string(),
            });
        }
        if state.nodes.contains_key(&full) {
            return Err(CoordinationError::NodeExists { path: full });
        }
        state.nodes.insert(
            full.clone(),
            Node {
                owner: Some(self.id.clone()),
            },
        );
        state.fire(root, WatchEventKind::ChildrenChanged);
        Ok(full)
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        state.check_session(&self.id)?;
        state.stats.deletes += 1;
        if !state.nodes.contains_key(path) {
            return Err(CoordinationError::NoNode {
                path: path.to_string(),
            });
        }
        if !state.children(path).is_empty() {
            return Err(CoordinationError::Backend(format!("node not empty: {path}")));
        }
        state.nodes.remove(path);
        state.fire(path, WatchEventKind::NodeDeleted);
        state.fire_parent(path);
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        validate_path(path)?;
        let state = self.tree.state.lock();
        state.check_session(&self.id)?;
        if !state.exists(path) {
            return Err(CoordinationError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(state.children(path))
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch), CoordinationError> {
        validate_path(path)?;
        let mut state = self.tree.state.lock();
        state.check_session(&self.id)?;
        if !state.exists(path) {
            return Err(CoordinationError::NoNode {
                path: path.to_string(),
            });
        }
        let children = state.children(path);
        let (tx, rx) = oneshot::channel();
        state
            .watches
            .entry(path.to_string())
            .or_default()
            .push(PendingWatch {
                session: self.id.clone(),
                tx,
            });
        Ok((children, rx))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        let mut state = self.tree.state.lock();
        if state.sessions.get(&self.id).map(|s| s.status) == Some(SessionStatus::Closed) {
            return;
        }
        state.release_session(&self.id);
        state.set_status(&self.id, SessionStatus::Closed, None);
        debug!(session = %self.id, "memory session closed");
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens sessions on a shared [`MemoryTree`].
#[derive(Clone)]
pub struct MemoryConnector {
    tree: Arc<MemoryTree>,
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn CoordinationClient>, CoordinationError> {
        if self.tree.state.lock().refuse_connections {
            return Err(CoordinationError::ConnectionLoss(
                "memory tree refusing connections".into(),
            ));
        }
        let session: Arc<dyn CoordinationClient> = self.tree.open_session();
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_is_recursive_and_idempotent() {
        let tree = MemoryTree::new();
        let s = tree.open_session();
        s.create("/dubbo/svc/providers").await.unwrap();
        s.create("/dubbo/svc/providers").await.unwrap();
        assert!(tree.exists("/dubbo"));
        assert!(tree.exists("/dubbo/svc"));
        assert_eq!(tree.children("/dubbo/svc"), vec!["providers"]);
    }

    #[tokio::test]
    async fn ephemeral_nodes_die_with_their_session() {
        let tree = MemoryTree::new();
        let a = tree.open_session();
        a.create("/r").await.unwrap();
        let path = a.create_ephemeral("/r", "n1").await.unwrap();
        assert_eq!(path, "/r/n1");
        assert_eq!(tree.owner("/r/n1").as_deref(), Some(a.id()));

        let b = tree.open_session();
        assert!(matches!(
            b.create_ephemeral("/r", "n1").await,
            Err(CoordinationError::NodeExists { .. })
        ));

        tree.expire(a.id());
        assert!(!tree.exists("/r/n1"));
        assert!(tree.exists("/r"));
        assert_eq!(
            a.get_children("/r").await,
            Err(CoordinationError::SessionExpired)
        );
        b.create_ephemeral("/r", "n1").await.unwrap();
    }

    #[tokio::test]
    async fn watches_fire_once() {
        let tree = MemoryTree::new();
        let s = tree.open_session();
        s.create("/r").await.unwrap();
        let (children, watch) = s.watch_children("/r").await.unwrap();
        assert!(children.is_empty());
        assert_eq!(tree.watch_count("/r"), 1);

        s.create_ephemeral("/r", "a").await.unwrap();
        let event = watch.await.unwrap();
        assert_eq!(event.kind, WatchEventKind::ChildrenChanged);
        assert_eq!(tree.watch_count("/r"), 0);

        // Not re-armed: a second change has nobody to notify.
        s.create_ephemeral("/r", "b").await.unwrap();
        assert_eq!(tree.watch_count("/r"), 0);
    }

    #[tokio::test]
    async fn expiry_invalidates_watches_of_that_session_only() {
        let tree = MemoryTree::new();
        let a = tree.open_session();
        let b = tree.open_session();
        a.create("/r").await.unwrap();
        let (_, wa) = a.watch_children("/r").await.unwrap();
        let (_, _wb) = b.watch_children("/r").await.unwrap();

        tree.expire(a.id());
        assert_eq!(wa.await.unwrap().kind, WatchEventKind::SessionClosed);
        assert_eq!(tree.watch_count("/r"), 1);
    }

    #[tokio::test]
    async fn disconnect_reports_connection_loss_until_reconnect() {
        let tree = MemoryTree::new();
        let s = tree.open_session();
        let mut events = s.session_events();
        tree.disconnect(s.id());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Disconnected);
        assert!(matches!(
            s.create("/x").await,
            Err(CoordinationError::ConnectionLoss(_))
        ));
        tree.reconnect(s.id());
        assert_eq!(events.recv().await.unwrap(), SessionEvent::Connected);
        s.create("/x").await.unwrap();
    }

    #[tokio::test]
    async fn delete_requires_existing_leaf() {
        let tree = MemoryTree::new();
        let s = tree.open_session();
        assert!(matches!(
            s.delete("/missing").await,
            Err(CoordinationError::NoNode { .. })
        ));
        s.create("/a/b").await.unwrap();
        assert!(matches!(
            s.delete("/a").await,
            Err(CoordinationError::Backend(_))
        ));
        s.delete("/a/b").await.unwrap();
        s.delete("/a").await.unwrap();
        assert_eq!(tree.stats().deletes, 4);
    }

    #[tokio::test]
    async fn connector_can_refuse() {
        let tree = MemoryTree::new();
        let connector = tree.connector();
        tree.refuse_connections(true);
        assert!(connector.connect().await.is_err());
        tree.refuse_connections(false);
        assert!(connector.connect().await.is_ok());
        assert_eq!(tree.stats().sessions_opened, 1);
    }
}
