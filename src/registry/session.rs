//! Shared access to the current coordination client.
//!
//! The client can be replaced by the supervisor after a session expiry.  All
//! readers go through [`SessionHandle::current`], which clones the `Arc` under
//! the same lock the supervisor swaps it under, so nobody observes a
//! half-replaced client.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::coordination::CoordinationClient;
use crate::error::{RegistryError, Result};
use crate::metrics::Metrics;

/// Lifecycle of the registry's coordination session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Connected,
    Disconnected,
    Reconnecting,
    Expired,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Expired => "expired",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Publishes [`SessionState`] changes and counts them.
///
/// `Closed` is terminal: once published, later updates are ignored.
#[derive(Clone)]
pub struct StatePublisher {
    tx: Arc<watch::Sender<SessionState>>,
    metrics: Arc<Metrics>,
}

impl StatePublisher {
    pub fn new(initial: SessionState, metrics: Arc<Metrics>) -> Self {
        let (tx, _) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            metrics,
        }
    }

    pub fn get(&self) -> SessionState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.tx.subscribe()
    }

    /// Publish `state`; returns whether anything changed.
    pub fn set(&self, state: SessionState) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == SessionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            self.metrics.record_transition(state);
        }
        changed
    }
}

#[derive(Default)]
pub struct SessionHandle {
    client: Mutex<Option<Arc<dyn CoordinationClient>>>,
}

impl SessionHandle {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self {
            client: Mutex::new(Some(client)),
        }
    }

    /// The live client, or `ConnectionBroken` if there is none.
    pub fn current(&self) -> Result<Arc<dyn CoordinationClient>> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| RegistryError::ConnectionBroken("no coordination session".into()))
    }

    /// Atomically install `client`, returning the previous one.
    pub fn replace(&self, client: Arc<dyn CoordinationClient>) -> Option<Arc<dyn CoordinationClient>> {
        self.client.lock().replace(client)
    }

    /// Remove the client; later `current` calls fail.
    pub fn take(&self) -> Option<Arc<dyn CoordinationClient>> {
        self.client.lock().take()
    }

    /// Whether `client` is still the installed one.
    pub fn is_current(&self, client: &Arc<dyn CoordinationClient>) -> bool {
        self.client
            .lock()
            .as_ref()
            .is_some_and(|c| Arc::ptr_eq(c, client))
    }
}
