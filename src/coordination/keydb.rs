//! Coordination tree stored in KeyDB.
//!
//! Layout, all keys under a configurable prefix:
//!
//! * `{prefix}:node:{path}` holds `persistent` or `ephemeral:{session}`.
//!   Ephemeral keys carry a TTL of the session timeout that the session
//!   heartbeat keeps refreshing, so a crashed client's nodes disappear.
//! * `{prefix}:children:{path}` is a SET of child names.  Members whose node
//!   key has expired are pruned lazily on listing.
//! * `{prefix}:session:{id}` is the session liveness key.
//! * Every child-set change publishes the parent path on `{prefix}:changes`.
//!
//! Watches are one-shot senders keyed by path.  A single subscriber
//! connection dispatches change messages to them, and a periodic poll fires
//! any watch whose listing changed without a publish (TTL expiry).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fred::clients::{Pool, SubscriberClient};
use fred::interfaces::{
    ClientLike, EventInterface, KeysInterface, PubsubInterface, SetsInterface,
};
use fred::types::{Expiration, SetOptions};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{
    ancestors, join_path, split_path, validate_path, Connector, CoordinationClient,
    CoordinationError, SessionEvent, Watch, WatchEvent, WatchEventKind,
};
use crate::config::KeyDbConfig;

/// Derive a unique session identifier: `<hostname>-<random-8-chars>`.
pub fn session_id() -> String {
    let hostname = gethostname::gethostname().to_string_lossy().into_owned();
    let suffix = &uuid::Uuid::new_v4().to_string()[..8];
    format!("{hostname}-{suffix}")
}

fn remote(e: impl std::fmt::Display) -> CoordinationError {
    CoordinationError::ConnectionLoss(e.to_string())
}

// ---------------------------------------------------------------------------
// Settings / key helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct KeyDbSettings {
    pub prefix: String,
    pub session_timeout: Duration,
    pub poll_interval: Duration,
}

impl KeyDbSettings {
    pub fn new(config: &KeyDbConfig, session_timeout: Duration) -> Self {
        Self {
            prefix: config.key_prefix.clone(),
            session_timeout,
            poll_interval: Duration::from_millis(config.watch_poll_ms),
        }
    }

    fn node_key(&self, path: &str) -> String {
        format!("{}:node:{path}", self.prefix)
    }

    fn children_key(&self, path: &str) -> String {
        format!("{}:children:{path}", self.prefix)
    }

    fn session_key(&self, id: &str) -> String {
        format!("{}:session:{id}", self.prefix)
    }

    fn changes_channel(&self) -> String {
        format!("{}:changes", self.prefix)
    }

    fn ttl_secs(&self) -> i64 {
        (self.session_timeout.as_millis() as i64 + 999) / 1000
    }
}

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Connected,
    Disconnected,
    Expired,
    Closed,
}

struct ArmedWatch {
    snapshot: Vec<String>,
    tx: oneshot::Sender<WatchEvent>,
}

struct Inner {
    id: String,
    pool: Pool,
    settings: KeyDbSettings,
    status: Mutex<Status>,
    owned: Mutex<HashSet<String>>,
    watches: Mutex<HashMap<String, Vec<ArmedWatch>>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Inner {
    fn check(&self) -> Result<(), CoordinationError> {
        match *self.status.lock() {
            Status::Connected => Ok(()),
            Status::Disconnected => Err(CoordinationError::ConnectionLoss(format!(
                "session {} disconnected",
                self.id
            ))),
            Status::Expired => Err(CoordinationError::SessionExpired),
            Status::Closed => Err(CoordinationError::Closed),
        }
    }

    fn transition(&self, to: Status, event: SessionEvent) {
        let mut status = self.status.lock();
        if *status == to || matches!(*status, Status::Expired | Status::Closed) {
            return;
        }
        *status = to;
        drop(status);
        let _ = self.events.send(event);
    }

    async fn publish(&self, parent: &str) -> Result<(), CoordinationError> {
        let _: () = self
            .pool
            .next()
            .publish(self.settings.changes_channel(), parent)
            .await
            .map_err(remote)?;
        Ok(())
    }

    async fn node_exists(&self, path: &str) -> Result<bool, CoordinationError> {
        if path == "/" {
            return Ok(true);
        }
        self.pool
            .exists(self.settings.node_key(path))
            .await
            .map_err(remote)
    }

    async fn link_child(&self, parent: &str, name: &str) -> Result<(), CoordinationError> {
        let added: i64 = self
            .pool
            .sadd(self.settings.children_key(parent), name.to_string())
            .await
            .map_err(remote)?;
        if added > 0 {
            self.publish(parent).await?;
        }
        Ok(())
    }

    async fn unlink_child(&self, path: &str) -> Result<(), CoordinationError> {
        if let Some((parent, name)) = split_path(path) {
            let _: i64 = self
                .pool
                .srem(self.settings.children_key(parent), name.to_string())
                .await
                .map_err(remote)?;
            self.publish(parent).await?;
        }
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        if !self.node_exists(path).await? {
            return Err(CoordinationError::NoNode {
                path: path.to_string(),
            });
        }
        let members: Vec<String> = self
            .pool
            .smembers(self.settings.children_key(path))
            .await
            .map_err(remote)?;

        let mut live = Vec::with_capacity(members.len());
        for name in members {
            if self.node_exists(&join_path(path, &name)).await? {
                live.push(name);
            } else {
                let _: i64 = self
                    .pool
                    .srem(self.settings.children_key(path), name.clone())
                    .await
                    .map_err(remote)?;
                debug!(%path, child = %name, "pruned expired child");
            }
        }
        live.sort();
        Ok(live)
    }

    fn fire(&self, path: &str, kind: WatchEventKind) {
        let armed = self.watches.lock().remove(path);
        for watch in armed.into_iter().flatten() {
            let _ = watch.tx.send(WatchEvent {
                path: path.to_string(),
                kind,
            });
        }
    }

    fn fire_all(&self, kind: WatchEventKind) {
        let all: Vec<(String, Vec<ArmedWatch>)> = self.watches.lock().drain().collect();
        for (path, armed) in all {
            for watch in armed {
                let _ = watch.tx.send(WatchEvent {
                    path: path.clone(),
                    kind,
                });
            }
        }
    }

    /// Refresh the session key and every owned ephemeral TTL.
    ///
    /// Returns `Ok(false)` when an owned node is already gone, meaning the
    /// session has effectively been lost.
    async fn heartbeat_once(&self) -> Result<bool, CoordinationError> {
        let ttl = self.settings.ttl_secs();
        let now = chrono::Utc::now().timestamp().to_string();
        let _: () = self
            .pool
            .set(
                self.settings.session_key(&self.id),
                now,
                Some(Expiration::EX(ttl)),
                None,
                false,
            )
            .await
            .map_err(remote)?;

        let owned: Vec<String> = self.owned.lock().iter().cloned().collect();
        for path in owned {
            let alive: bool = self
                .pool
                .expire(self.settings.node_key(&path), ttl, None)
                .await
                .map_err(remote)?;
            if !alive {
                warn!(session = %self.id, %path, "owned ephemeral node vanished");
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn expire_session(&self) {
        {
            let mut status = self.status.lock();
            if matches!(*status, Status::Expired | Status::Closed) {
                return;
            }
            *status = Status::Expired;
        }
        self.owned.lock().clear();
        self.fire_all(WatchEventKind::SessionClosed);
        let _ = self.events.send(SessionEvent::Expired);
        error!(session = %self.id, "KeyDB session expired");
    }
}

// ---------------------------------------------------------------------------
// Background loops
// ---------------------------------------------------------------------------

async fn run_heartbeat(inner: Arc<Inner>, cancel: CancellationToken) {
    let interval = inner.settings.session_timeout / 3;
    let mut last_ok = Instant::now();
    info!(session = %inner.id, ?interval, "starting session heartbeat");
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
        match inner.heartbeat_once().await {
            Ok(true) => {
                last_ok = Instant::now();
                inner.transition(Status::Connected, SessionEvent::Connected);
            }
            Ok(false) => {
                inner.expire_session();
                break;
            }
            Err(e) => {
                warn!(session = %inner.id, error = %e, "heartbeat tick failed");
                inner.transition(Status::Disconnected, SessionEvent::Disconnected);
                if last_ok.elapsed() > inner.settings.session_timeout {
                    inner.expire_session();
                    break;
                }
                let _ = inner.events.send(SessionEvent::Reconnecting);
            }
        }
    }
}

async fn run_dispatcher(inner: Arc<Inner>, subscriber: SubscriberClient, cancel: CancellationToken) {
    let mut messages = subscriber.message_rx();
    loop {
        let msg = tokio::select! {
            () = cancel.cancelled() => break,
            msg = messages.recv() => msg,
        };
        match msg {
            Ok(msg) => {
                if let Some(path) = msg.value.as_str() {
                    inner.fire(&path, WatchEventKind::ChildrenChanged);
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                // Unknown which paths changed; wake everyone.
                warn!(skipped, "change dispatcher lagged");
                inner.fire_all(WatchEventKind::ChildrenChanged);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn run_poller(inner: Arc<Inner>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(inner.settings.poll_interval) => {}
        }
        if inner.check().is_err() {
            continue;
        }
        let paths: Vec<String> = inner.watches.lock().keys().cloned().collect();
        for path in paths {
            let current = match inner.list(&path).await {
                Ok(children) => children,
                Err(CoordinationError::NoNode { .. }) => {
                    inner.fire(&path, WatchEventKind::NodeDeleted);
                    continue;
                }
                Err(e) => {
                    debug!(%path, error = %e, "watch poll failed");
                    continue;
                }
            };
            let changed: Vec<ArmedWatch> = {
                let mut watches = inner.watches.lock();
                let Some(armed) = watches.get_mut(&path) else {
                    continue;
                };
                let (changed, same): (Vec<_>, Vec<_>) = std::mem::take(armed)
                    .into_iter()
                    .partition(|w| w.snapshot != current);
                *armed = same;
                if armed.is_empty() {
                    watches.remove(&path);
                }
                changed
            };
            for watch in changed {
                let _ = watch.tx.send(WatchEvent {
                    path: path.clone(),
                    kind: WatchEventKind::ChildrenChanged,
                });
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// One coordination session backed by a KeyDB pool.
pub struct KeyDbClient {
    inner: Arc<Inner>,
    subscriber: SubscriberClient,
    cancel: CancellationToken,
}

impl KeyDbClient {
    /// Open a session: connect the change subscriber, write the session key,
    /// and start the heartbeat, dispatcher, and poll loops.
    pub async fn start(pool: Pool, settings: KeyDbSettings) -> Result<Self, CoordinationError> {
        let client = pool.next();
        let subscriber = SubscriberClient::new(
            client.client_config(),
            None,
            None,
            client.client_reconnect_policy(),
        );
        let _connect = subscriber.connect();
        subscriber.wait_for_connect().await.map_err(remote)?;
        let _resubscribe = subscriber.manage_subscriptions();
        subscriber
            .subscribe(settings.changes_channel())
            .await
            .map_err(remote)?;

        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(Inner {
            id: session_id(),
            pool,
            settings,
            status: Mutex::new(Status::Connected),
            owned: Mutex::new(HashSet::new()),
            watches: Mutex::new(HashMap::new()),
            events,
        });
        inner.heartbeat_once().await?;

        let cancel = CancellationToken::new();
        tokio::spawn(run_heartbeat(Arc::clone(&inner), cancel.clone()));
        tokio::spawn(run_dispatcher(
            Arc::clone(&inner),
            subscriber.clone(),
            cancel.clone(),
        ));
        tokio::spawn(run_poller(Arc::clone(&inner), cancel.clone()));

        info!(session = %inner.id, "KeyDB coordination session opened");
        Ok(Self {
            inner,
            subscriber,
            cancel,
        })
    }
}

#[async_trait]
impl CoordinationClient for KeyDbClient {
    fn session_id(&self) -> String {
        self.inner.id.clone()
    }

    async fn create(&self, path: &str) -> Result<(), CoordinationError> {
        validate_path(path)?;
        self.inner.check()?;
        for p in ancestors(path) {
            let _: Option<String> = self
                .inner
                .pool
                .set(
                    self.inner.settings.node_key(&p),
                    "persistent",
                    None,
                    Some(SetOptions::NX),
                    false,
                )
                .await
                .map_err(remote)?;
            if let Some((parent, name)) = split_path(&p) {
                self.inner.link_child(parent, name).await?;
            }
        }
        Ok(())
    }

    async fn create_ephemeral(&self, root: &str, node: &str) -> Result<String, CoordinationError> {
        validate_path(root)?;
        self.inner.check()?;
        if !self.inner.node_exists(root).await? {
            return Err(CoordinationError::NoNode {
                path: root.to_string(),
            });
        }
        let full = join_path(root, node);
        let created: Option<String> = self
            .inner
            .pool
            .set(
                self.inner.settings.node_key(&full),
                format!("ephemeral:{}", self.inner.id),
                Some(Expiration::EX(self.inner.settings.ttl_secs())),
                Some(SetOptions::NX),
                false,
            )
            .await
            .map_err(remote)?;
        if created.is_none() {
            return Err(CoordinationError::NodeExists { path: full });
        }
        self.inner.owned.lock().insert(full.clone());
        self.inner.link_child(root, node).await?;
        debug!(session = %self.inner.id, path = %full, "ephemeral node created");
        Ok(full)
    }

    async fn delete(&self, path: &str) -> Result<(), CoordinationError> {
        validate_path(path)?;
        self.inner.check()?;
        if !self.inner.list(path).await?.is_empty() {
            return Err(CoordinationError::Backend(format!("node not empty: {path}")));
        }
        let removed: i64 = self
            .inner
            .pool
            .del(self.inner.settings.node_key(path))
            .await
            .map_err(remote)?;
        self.inner.owned.lock().remove(path);
        self.inner.unlink_child(path).await?;
        self.inner.fire(path, WatchEventKind::NodeDeleted);
        if removed == 0 {
            return Err(CoordinationError::NoNode {
                path: path.to_string(),
            });
        }
        Ok(())
    }

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        validate_path(path)?;
        self.inner.check()?;
        self.inner.list(path).await
    }

    async fn watch_children(
        &self,
        path: &str,
    ) -> Result<(Vec<String>, Watch), CoordinationError> {
        validate_path(path)?;
        self.inner.check()?;
        let children = self.inner.list(path).await?;
        let (tx, rx) = oneshot::channel();
        // A publish racing with the listing above is caught by the poller,
        // which compares against this snapshot.
        self.inner
            .watches
            .lock()
            .entry(path.to_string())
            .or_default()
            .push(ArmedWatch {
                snapshot: children.clone(),
                tx,
            });
        Ok((children, rx))
    }

    fn session_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    async fn close(&self) {
        {
            let mut status = self.inner.status.lock();
            if *status == Status::Closed {
                return;
            }
            *status = Status::Closed;
        }
        self.cancel.cancel();

        let owned: Vec<String> = self.inner.owned.lock().drain().collect();
        for path in owned {
            let deleted: Result<i64, _> = self.inner.pool.del(self.inner.settings.node_key(&path)).await;
            if let Err(e) = deleted {
                warn!(%path, error = %e, "failed to delete ephemeral node on close");
                continue;
            }
            if let Err(e) = self.inner.unlink_child(&path).await {
                warn!(%path, error = %e, "failed to unlink ephemeral node on close");
            }
        }
        let _: Result<i64, _> = self
            .inner
            .pool
            .del(self.inner.settings.session_key(&self.inner.id))
            .await;
        self.inner.fire_all(WatchEventKind::SessionClosed);

        let _ = self
            .subscriber
            .unsubscribe(self.inner.settings.changes_channel())
            .await;
        let _ = self.subscriber.quit().await;
        info!(session = %self.inner.id, "KeyDB coordination session closed");
    }
}

impl Drop for KeyDbClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

/// Opens a fresh [`KeyDbClient`] session on a shared pool.
#[derive(Clone)]
pub struct KeyDbConnector {
    pool: Pool,
    settings: KeyDbSettings,
}

impl KeyDbConnector {
    pub fn new(pool: Pool, settings: KeyDbSettings) -> Self {
        Self { pool, settings }
    }
}

#[async_trait]
impl Connector for KeyDbConnector {
    async fn connect(&self) -> Result<Arc<dyn CoordinationClient>, CoordinationError> {
        let client = KeyDbClient::start(self.pool.clone(), self.settings.clone()).await?;
        Ok(Arc::new(client))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> KeyDbSettings {
        KeyDbSettings {
            prefix: "svcreg".into(),
            session_timeout: Duration::from_millis(15_500),
            poll_interval: Duration::from_secs(2),
        }
    }

    #[test]
    fn key_layout() {
        let s = settings();
        assert_eq!(
            s.node_key("/dubbo/svc/providers"),
            "svcreg:node:/dubbo/svc/providers"
        );
        assert_eq!(s.children_key("/dubbo"), "svcreg:children:/dubbo");
        assert_eq!(s.session_key("h-1"), "svcreg:session:h-1");
        assert_eq!(s.changes_channel(), "svcreg:changes");
    }

    #[test]
    fn ttl_rounds_up_to_whole_seconds() {
        assert_eq!(settings().ttl_secs(), 16);
    }

    #[test]
    fn session_ids_are_unique() {
        let a = session_id();
        let b = session_id();
        assert_ne!(a, b);
        assert!(a.len() > 9);
    }
}
