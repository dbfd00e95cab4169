//! Session supervisor.
//!
//! Owns the lifecycle of the coordination session.  A transient disconnect is
//! given up to one session timeout to heal on its own; an expiry (or a
//! disconnect that outlives the timeout) makes the supervisor build a fresh
//! client with bounded backoff, swap it into the shared [`SessionHandle`], and
//! hand it to the registry for replay.  When the retry budget runs out the
//! state becomes `Closed` and the supervisor exits.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::session::{SessionHandle, SessionState, StatePublisher};
use crate::config::ReconnectConfig;
use crate::coordination::{Connector, CoordinationClient, SessionEvent};

/// Messages from the supervisor to the registry's recovery task.
pub enum Transition {
    /// A new session is installed; registrations and subscriptions must be
    /// replayed on it.
    Reconnected(Arc<dyn CoordinationClient>),
    /// Reconnecting failed for good.
    Closed,
}

/// Why the supervisor stopped watching a session.
enum Loss {
    Expired,
    TimedOut,
    EventsClosed,
}

pub struct SessionSupervisor {
    connector: Arc<dyn Connector>,
    handle: Arc<SessionHandle>,
    state: StatePublisher,
    reconnect: ReconnectConfig,
    session_timeout: Duration,
    transitions: mpsc::UnboundedSender<Transition>,
    cancel: CancellationToken,
}

impl SessionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        handle: Arc<SessionHandle>,
        state: StatePublisher,
        reconnect: ReconnectConfig,
        session_timeout: Duration,
        transitions: mpsc::UnboundedSender<Transition>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            handle,
            state,
            reconnect,
            session_timeout,
            transitions,
            cancel,
        }
    }

    /// Supervise `client`, whose event receiver was taken before any
    /// operation could run against it.
    pub async fn run(
        self,
        mut client: Arc<dyn CoordinationClient>,
        mut events: broadcast::Receiver<SessionEvent>,
    ) {
        loop {
            let session = client.session_id();
            let loss = tokio::select! {
                () = self.cancel.cancelled() => break,
                loss = self.watch_session(&mut events) => loss,
            };
            match loss {
                Loss::Expired => warn!(%session, "coordination session expired"),
                Loss::TimedOut => warn!(
                    %session,
                    timeout_ms = self.session_timeout.as_millis() as u64,
                    "session not restored within timeout, treating as expired"
                ),
                Loss::EventsClosed => warn!(%session, "session event stream closed"),
            }
            self.state.set(SessionState::Expired);

            let Some(fresh) = self.connect_with_backoff().await else {
                if !self.cancel.is_cancelled() {
                    self.state.set(SessionState::Closed);
                    let _ = self.transitions.send(Transition::Closed);
                }
                break;
            };

            // Subscribe before the client is visible so no event is missed.
            events = fresh.session_events();
            if let Some(stale) = self.handle.replace(Arc::clone(&fresh)) {
                stale.close().await;
            }
            info!(
                old_session = %session,
                session = %fresh.session_id(),
                "coordination session replaced"
            );
            client = fresh;
            if self
                .transitions
                .send(Transition::Reconnected(Arc::clone(&client)))
                .is_err()
            {
                debug!("registry gone, supervisor exiting");
                break;
            }
        }
        debug!("session supervisor stopped");
    }

    /// Follow session events until the session is lost.
    async fn watch_session(&self, events: &mut broadcast::Receiver<SessionEvent>) -> Loss {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Connected) => {
                    self.state.set(SessionState::Connected);
                }
                Ok(SessionEvent::Disconnected) | Ok(SessionEvent::Reconnecting) => {
                    warn!("coordination connection lost, waiting for it to recover");
                    self.state.set(SessionState::Disconnected);
                    if let Some(loss) = self.await_recovery(events).await {
                        return loss;
                    }
                }
                Ok(SessionEvent::Expired) => return Loss::Expired,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "session events lagged");
                }
                Err(RecvError::Closed) => return Loss::EventsClosed,
            }
        }
    }

    /// Wait up to one session timeout for a disconnected session to come
    /// back.  `None` means it recovered.
    async fn await_recovery(&self, events: &mut broadcast::Receiver<SessionEvent>) -> Option<Loss> {
        let deadline = tokio::time::sleep(self.session_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => return Some(Loss::TimedOut),
                event = events.recv() => match event {
                    Ok(SessionEvent::Connected) => {
                        info!("coordination connection recovered");
                        self.state.set(SessionState::Connected);
                        return None;
                    }
                    Ok(SessionEvent::Disconnected) | Ok(SessionEvent::Reconnecting) => {
                        self.state.set(SessionState::Reconnecting);
                    }
                    Ok(SessionEvent::Expired) => return Some(Loss::Expired),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return Some(Loss::EventsClosed),
                },
            }
        }
    }

    async fn connect_with_backoff(&self) -> Option<Arc<dyn CoordinationClient>> {
        self.state.set(SessionState::Reconnecting);
        let attempts = self.reconnect.max_attempts;
        for attempt in 1..=attempts {
            let delay = self.reconnect.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    () = self.cancel.cancelled() => return None,
                    () = tokio::time::sleep(delay) => {}
                }
            }
            let result = tokio::select! {
                () = self.cancel.cancelled() => return None,
                result = self.connector.connect() => result,
            };
            match result {
                Ok(client) => {
                    info!(attempt, session = %client.session_id(), "coordination session established");
                    return Some(client);
                }
                Err(e) => {
                    warn!(attempt, max_attempts = attempts, error = %e, "reconnect attempt failed");
                }
            }
        }
        error!(attempts, "reconnect budget exhausted, registry closing");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::MemoryTree;
    use crate::metrics::MetricsRegistry;

    struct Harness {
        tree: Arc<MemoryTree>,
        handle: Arc<SessionHandle>,
        state: StatePublisher,
        rx: mpsc::UnboundedReceiver<Transition>,
        cancel: CancellationToken,
        first: String,
    }

    fn start(session_timeout: Duration) -> Harness {
        let tree = MemoryTree::new();
        let client: Arc<dyn CoordinationClient> = tree.open_session();
        let first = client.session_id();
        let handle = Arc::new(SessionHandle::new(Arc::clone(&client)));
        let state = StatePublisher::new(SessionState::Connected, MetricsRegistry::new().metrics);
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let reconnect = ReconnectConfig {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
            multiplier: 2.0,
        };
        let supervisor = SessionSupervisor::new(
            Arc::new(tree.connector()),
            Arc::clone(&handle),
            state.clone(),
            reconnect,
            session_timeout,
            tx,
            cancel.clone(),
        );
        let events = client.session_events();
        tokio::spawn(supervisor.run(client, events));
        Harness {
            tree,
            handle,
            state,
            rx,
            cancel,
            first,
        }
    }

    #[tokio::test]
    async fn expiry_installs_a_new_session() {
        let mut h = start(Duration::from_secs(5));
        h.tree.expire(&h.first);

        let Some(Transition::Reconnected(client)) = h.rx.recv().await else {
            panic!("expected a reconnect");
        };
        assert_ne!(client.session_id(), h.first);
        assert!(h.handle.is_current(&client));
        assert_eq!(h.state.get(), SessionState::Reconnecting);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn transient_disconnect_heals_without_replay() {
        let mut h = start(Duration::from_secs(5));
        let mut state = h.state.subscribe();
        h.tree.disconnect(&h.first);
        state
            .wait_for(|s| *s == SessionState::Disconnected)
            .await
            .unwrap();
        h.tree.reconnect(&h.first);
        state.wait_for(|s| *s == SessionState::Connected).await.unwrap();

        assert!(h.rx.try_recv().is_err());
        assert_eq!(h.handle.current().unwrap().session_id(), h.first);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn long_disconnect_counts_as_expiry() {
        let mut h = start(Duration::from_millis(50));
        h.tree.disconnect(&h.first);
        assert!(matches!(h.rx.recv().await, Some(Transition::Reconnected(_))));
        assert_eq!(h.tree.stats().sessions_opened, 2);
        h.cancel.cancel();
    }

    #[tokio::test]
    async fn exhausted_budget_closes() {
        let mut h = start(Duration::from_secs(5));
        h.tree.refuse_connections(true);
        h.tree.expire(&h.first);

        assert!(matches!(h.rx.recv().await, Some(Transition::Closed)));
        assert_eq!(h.state.get(), SessionState::Closed);
        // Supervisor has exited and dropped its sender.
        assert!(h.rx.recv().await.is_none());
    }
}
