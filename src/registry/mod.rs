//! Registry core.
//!
//! [`Registry`] is the surface the RPC framework talks to: provider
//! registration as ephemeral nodes, consumer subscriptions as watched category
//! paths, and replay of both after the coordination session is replaced.
//!
//! Locking:
//! - `register_lock` serializes every remote create/delete issued for
//!   registrations, including replay.
//! - The bookkeeping map and the subscription table each have their own lock,
//!   held only for the map mutation.
//! - The shared client lives in a [`SessionHandle`]; only the supervisor swaps
//!   it.

pub mod change;
pub mod listener;
pub mod session;
pub mod supervisor;
pub mod table;


use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::task_tracker::TaskTrackerToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::RegistryConfig;
use crate::coordination::{join_path, Connector, CoordinationClient, CoordinationError};
use crate::error::{RegistryError, Result};
use crate::metrics::{Metrics, MetricsRegistry, Outcome};
use crate::url::{Category, ServiceUrl};

use self::change::ChangeListener;
use self::listener::ConfigurationListener;
pub use self::listener::{EventKind, ServiceEvent, Subscription};
use self::session::SessionHandle;
pub use self::session::{SessionState, StatePublisher};
use self::supervisor::{SessionSupervisor, Transition};
use self::table::SubscriptionTable;

/// One bookkept provider registration.
struct Registered {
    url: ServiceUrl,
    root: String,
    node: String,
    refs: usize,
}

struct Inner {
    config: RegistryConfig,
    session: Arc<SessionHandle>,
    state: StatePublisher,
    register_lock: tokio::sync::Mutex<()>,
    registered: Mutex<HashMap<String, Registered>>,
    subscriptions: SubscriptionTable<ConfigurationListener>,
    /// In-flight caller operations.
    operations: TaskTracker,
    /// Change-listener tasks.
    watchers: TaskTracker,
    cancel: CancellationToken,
    supervisor_cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
    metrics: Arc<Metrics>,
}

/// Service-registry client over a coordination tree.
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Open a session through `connector` and start supervising it.
    pub async fn connect(config: RegistryConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        Self::connect_with_metrics(config, connector, MetricsRegistry::new().metrics).await
    }

    pub async fn connect_with_metrics(
        config: RegistryConfig,
        connector: Arc<dyn Connector>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let client = connector.connect().await?;
        let events = client.session_events();
        let session_id = client.session_id();

        let cancel = CancellationToken::new();
        let supervisor_cancel = cancel.child_token();
        let state = StatePublisher::new(SessionState::Connected, Arc::clone(&metrics));
        let session = Arc::new(SessionHandle::new(Arc::clone(&client)));

        let inner = Arc::new(Inner {
            session: Arc::clone(&session),
            state: state.clone(),
            register_lock: tokio::sync::Mutex::new(()),
            registered: Mutex::new(HashMap::new()),
            subscriptions: SubscriptionTable::new(),
            operations: TaskTracker::new(),
            watchers: TaskTracker::new(),
            cancel: cancel.clone(),
            supervisor_cancel: supervisor_cancel.clone(),
            background: Mutex::new(Vec::new()),
            metrics,
            config,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let supervisor = SessionSupervisor::new(
            connector,
            session,
            state,
            inner.config.reconnect.clone(),
            inner.config.session_timeout(),
            tx,
            supervisor_cancel,
        );
        let supervisor = tokio::spawn(supervisor.run(client, events));
        let recovery = tokio::spawn(run_recovery(Arc::clone(&inner), rx));
        inner.background.lock().extend([supervisor, recovery]);

        info!(
            session = %session_id,
            namespace = %inner.config.namespace,
            "registry connected"
        );
        Ok(Self { inner })
    }

    /// Register a provider (or any URL) as an ephemeral node.
    ///
    /// Registering a URL that is already bookkept only bumps its reference
    /// count.  A call made while the session is being replaced waits for the
    /// replay to finish and lands on the new session.  A call that races the
    /// expiry itself can still fail with [`RegistryError::SessionExpired`];
    /// nothing is bookkept then, so callers retry on
    /// [`RegistryError::is_session_loss`].
    pub async fn register(&self, url: &ServiceUrl) -> Result<()> {
        let _op = self.inner.begin()?;
        let (root, node) = self.inner.node_paths(url);
        let path = join_path(&root, &node);

        if self.inner.acquire_existing(&path) {
            return Ok(());
        }
        self.inner.settled().await?;
        let _guard = self.inner.register_lock.lock().await;
        if self.inner.acquire_existing(&path) {
            return Ok(());
        }

        let client = self.inner.session.current()?;
        match create_ephemeral_node(client.as_ref(), &root, &node, &self.inner.metrics).await {
            Ok(created) => {
                self.inner.registered.lock().insert(
                    path,
                    Registered {
                        url: url.clone(),
                        root,
                        node,
                        refs: 1,
                    },
                );
                self.inner.refresh_gauges();
                self.inner.metrics.record_registration(Outcome::Created);
                info!(path = %created, %url, "registered");
                Ok(())
            }
            Err(e) => {
                self.inner.metrics.record_registration(Outcome::Failed);
                warn!(%url, error = %e, "registration failed");
                Err(e)
            }
        }
    }

    /// Drop one reference to a registration; the node is deleted when the
    /// last one goes.  Unknown URLs are ignored.
    pub async fn unregister(&self, url: &ServiceUrl) -> Result<()> {
        let _op = self.inner.begin()?;
        let (root, node) = self.inner.node_paths(url);
        let path = join_path(&root, &node);

        self.inner.settled().await?;
        let _guard = self.inner.register_lock.lock().await;
        {
            let mut registered = self.inner.registered.lock();
            match registered.get_mut(&path) {
                None => {
                    debug!(%url, "unregister of unknown url");
                    return Ok(());
                }
                Some(entry) if entry.refs > 1 => {
                    entry.refs -= 1;
                    debug!(%path, refs = entry.refs, "registration still referenced");
                    return Ok(());
                }
                Some(_) => {}
            }
        }

        let client = self.inner.session.current()?;
        match client.delete(&path).await {
            Ok(()) | Err(CoordinationError::NoNode { .. }) => {}
            Err(e) => return Err(e.into()),
        }
        self.inner.registered.lock().remove(&path);
        self.inner.refresh_gauges();
        info!(%path, %url, "unregistered");
        Ok(())
    }

    /// Subscribe `url` to its category path.
    ///
    /// Concurrent calls for the same URL share one listener and one watch.
    pub async fn subscribe(&self, url: &ServiceUrl) -> Result<Subscription> {
        let _op = self.inner.begin()?;
        let inner = &self.inner;
        let path = inner.category_path(url.service_interface(), url.subscribed_category());

        let mut client = None;
        let (listener, created) = inner.subscriptions.get_or_create(url, || {
            // Read under the table lock so replay cannot miss this entry.
            client = Some(inner.session.current()?);
            let (events, _) = broadcast::channel(inner.config.event_buffer.max(1));
            Ok::<_, RegistryError>(Arc::new(ConfigurationListener::new(
                url.clone(),
                path.clone(),
                events,
                BTreeSet::new(),
                Arc::clone(&inner.metrics),
            )))
        })?;

        // Attach before the watch starts so the first listing is not missed.
        let subscription = Subscription::new(url.clone(), &listener);
        if created {
            if let Some(client) = client {
                info!(
                    %url,
                    service = %url.service_key(),
                    %path,
                    listener = listener.id(),
                    "subscribed"
                );
                inner.start_watch(client, listener);
                inner.refresh_gauges();
            }
        } else {
            debug!(%url, listener = listener.id(), "joined existing subscription");
        }
        Ok(subscription)
    }

    /// Close and forget the subscription for `url`.  Idempotent.
    pub fn unsubscribe(&self, url: &ServiceUrl) -> Result<()> {
        if self.inner.cancel.is_cancelled() {
            return Err(RegistryError::Closed);
        }
        if let Some(listener) = self.inner.subscriptions.remove(url) {
            info!(%url, listener = listener.id(), "unsubscribed");
            self.inner.refresh_gauges();
        }
        Ok(())
    }

    /// Whether the registry is open and its session is connected.
    pub fn is_available(&self) -> bool {
        !self.inner.cancel.is_cancelled() && self.inner.state.get() == SessionState::Connected
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Wait until the session is connected again.  Fails once the registry
    /// is closed or has given up on the coordination service.
    pub async fn wait_connected(&self) -> Result<()> {
        let _op = self.inner.begin()?;
        self.inner.settled().await
    }

    /// Identifier of the current coordination session.
    pub fn session_id(&self) -> Option<String> {
        self.inner.session.current().ok().map(|c| c.session_id())
    }

    pub fn registered_urls(&self) -> Vec<ServiceUrl> {
        self.inner
            .registered
            .lock()
            .values()
            .map(|r| r.url.clone())
            .collect()
    }

    pub fn subscribed_urls(&self) -> Vec<ServiceUrl> {
        self.inner.subscriptions.urls()
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    /// Shut down: refuse new calls, stop supervision, wait for in-flight
    /// calls, close every listener, then release the session.
    pub async fn close(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();

        let background: Vec<JoinHandle<()>> = self.inner.background.lock().drain(..).collect();
        for task in background {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }

        self.inner.operations.close();
        self.inner.operations.wait().await;

        let listeners = self.inner.subscriptions.close_all();
        self.inner.watchers.close();
        self.inner.watchers.wait().await;

        if let Some(client) = self.inner.session.take() {
            client.close().await;
        }
        let registrations = {
            let mut registered = self.inner.registered.lock();
            let count = registered.len();
            registered.clear();
            count
        };
        self.inner.refresh_gauges();
        self.inner.state.set(SessionState::Closed);
        info!(listeners, registrations, "registry closed");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        // Background tasks hold `inner`; stop them if `close` was skipped.
        self.inner.cancel.cancel();
        self.inner.subscriptions.close_all();
    }
}

impl Inner {
    /// Count an operation as pending, or refuse it.
    fn begin(&self) -> Result<TaskTrackerToken> {
        let token = self.operations.token();
        if self.cancel.is_cancelled() {
            return Err(RegistryError::Closed);
        }
        if self.state.get() == SessionState::Closed {
            return Err(RegistryError::ConnectionBroken(
                "coordination session could not be re-established".into(),
            ));
        }
        Ok(token)
    }

    /// Wait out a disconnect or a session replacement.
    async fn settled(&self) -> Result<()> {
        let mut state = self.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                SessionState::Connected => return Ok(()),
                SessionState::Closed => break,
                _ => {}
            }
            tokio::select! {
                () = self.cancel.cancelled() => return Err(RegistryError::Closed),
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        Err(RegistryError::ConnectionBroken(
            "coordination session could not be re-established".into(),
        ))
    }

    /// `/<namespace>/<encoded interface>/<category>`
    fn category_path(&self, interface: &str, category: Category) -> String {
        format!(
            "/{}/{}/{}",
            self.config.namespace,
            urlencoding::encode(interface),
            category
        )
    }

    fn node_paths(&self, url: &ServiceUrl) -> (String, String) {
        let root = self.category_path(url.service_interface(), url.category());
        (root, url.encode())
    }

    /// Bump the reference count of an already registered path.
    fn acquire_existing(&self, path: &str) -> bool {
        let mut registered = self.registered.lock();
        let Some(entry) = registered.get_mut(path) else {
            return false;
        };
        entry.refs += 1;
        self.metrics.record_registration(Outcome::Duplicate);
        debug!(%path, refs = entry.refs, "already registered");
        true
    }

    fn start_watch(&self, client: Arc<dyn CoordinationClient>, listener: Arc<ConfigurationListener>) {
        let watcher = ChangeListener::new(client, listener, self.config.watch_retry());
        self.watchers.spawn(watcher.run());
    }

    fn refresh_gauges(&self) {
        self.metrics
            .registered_providers
            .set(self.registered.lock().len() as i64);
        self.metrics
            .active_subscriptions
            .set(self.subscriptions.len() as i64);
    }

    /// Re-create every registration on `client` and move every subscription
    /// onto it.
    async fn replay(&self, client: Arc<dyn CoordinationClient>) {
        let session = client.session_id();
        self.metrics.replays_total.inc();
        info!(%session, "replaying registrations and subscriptions");

        let registrations = {
            let _guard = self.register_lock.lock().await;
            let pending: Vec<(String, String)> = self
                .registered
                .lock()
                .values()
                .map(|r| (r.root.clone(), r.node.clone()))
                .collect();
            for (root, node) in &pending {
                if let Err(e) = self.replay_registration(client.as_ref(), root, node).await {
                    error!(
                        path = %join_path(root, node),
                        error = %e,
                        "registration replay failed, closing registry"
                    );
                    self.metrics.replay_failures.inc();
                    self.give_up().await;
                    return;
                }
            }
            pending.len()
        };

        let recovered = self.subscriptions.recover_all(|url, old| {
            Arc::new(ConfigurationListener::new(
                url.clone(),
                old.path().to_string(),
                old.sender(),
                old.observed(),
                Arc::clone(&self.metrics),
            ))
        });
        let subscriptions = recovered.len();
        for (url, old, new) in recovered {
            debug!(%url, old = old.id(), new = new.id(), "listener replaced");
            self.start_watch(Arc::clone(&client), new);
        }

        self.state.set(SessionState::Connected);
        info!(%session, registrations, subscriptions, "replay finished");
    }

    async fn replay_registration(
        &self,
        client: &dyn CoordinationClient,
        root: &str,
        node: &str,
    ) -> Result<()> {
        let policy = &self.config.reconnect;
        let mut last = None;
        for attempt in 1..=policy.max_attempts {
            let delay = policy.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    () = self.cancel.cancelled() => return Err(RegistryError::Closed),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            match create_ephemeral_node(client, root, node, &self.metrics).await {
                Ok(path) => {
                    debug!(%path, attempt, "registration replayed");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt, error = %e, "registration replay attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| RegistryError::ConnectionBroken("no replay attempts".into())))
    }

    /// Reconnecting or replaying failed: close out everything the session
    /// carried.  Later calls fail with `ConnectionBroken`.
    async fn give_up(&self) {
        self.state.set(SessionState::Closed);
        self.supervisor_cancel.cancel();
        let listeners = self.subscriptions.close_all();
        if let Some(client) = self.session.take() {
            client.close().await;
        }
        self.refresh_gauges();
        error!(listeners, "registry unavailable, coordination session lost for good");
    }
}

async fn run_recovery(inner: Arc<Inner>, mut transitions: mpsc::UnboundedReceiver<Transition>) {
    loop {
        let transition = tokio::select! {
            () = inner.cancel.cancelled() => break,
            transition = transitions.recv() => transition,
        };
        match transition {
            Some(Transition::Reconnected(client)) => {
                // Replay may be mid-flight when `close` runs; stop with it.
                tokio::select! {
                    () = inner.cancel.cancelled() => break,
                    () = inner.replay(client) => {}
                }
            }
            Some(Transition::Closed) => {
                inner.give_up().await;
                break;
            }
            None => break,
        }
    }
    debug!("recovery task stopped");
}

/// Ensure `root`, create the ephemeral `root/node`, and on a conflict delete
/// the existing node and try exactly once more.
async fn create_ephemeral_node(
    client: &dyn CoordinationClient,
    root: &str,
    node: &str,
    metrics: &Metrics,
) -> Result<String> {
    client.create(root).await?;
    match client.create_ephemeral(root, node).await {
        Ok(path) => return Ok(path),
        Err(CoordinationError::NodeExists { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    let path = join_path(root, node);
    metrics.registration_conflicts.inc();
    warn!(%path, "node already exists, deleting it and retrying once");
    match client.delete(&path).await {
        Ok(()) | Err(CoordinationError::NoNode { .. }) => {}
        Err(e) => return Err(e.into()),
    }

    match client.create_ephemeral(root, node).await {
        Ok(path) => Ok(path),
        Err(CoordinationError::NodeExists { path }) => {
            Err(RegistryError::RegistrationConflict { path })
        }
        Err(e) => Err(e.into()),
    }
}
