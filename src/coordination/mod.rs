//! Coordination-service adapter layer.
//!
//! The registry talks to a hierarchical, session-based tree store through the
//! [`CoordinationClient`] trait: persistent and ephemeral nodes, one-shot child
//! watches, and a stream of [`SessionEvent`]s.  A [`Connector`] builds a fresh
//! session on demand so the supervisor can replace an expired one.
//!
//! Two backends are provided: [`memory`] (in-process tree, used by tests and
//! embedders) and [`keydb`] (KeyDB / Redis via `fred`).

pub mod keydb;
pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("node already exists: {path}")]
    NodeExists { path: String },

    #[error("no such node: {path}")]
    NoNode { path: String },

    #[error("connection lost: {0}")]
    ConnectionLoss(String),

    #[error("session expired")]
    SessionExpired,

    #[error("client closed")]
    Closed,

    #[error("backend error: {0}")]
    Backend(String),
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Session-state notifications emitted by a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Reconnecting,
    /// Session identity lost: ephemeral nodes are gone and watches are dead.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    ChildrenChanged,
    NodeDeleted,
    /// The owning session ended before anything changed.
    SessionClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub path: String,
    pub kind: WatchEventKind,
}

/// A one-shot watch: resolves at most once, then must be re-armed.
///
/// A `RecvError` means the client dropped the watch without firing it.
pub type Watch = oneshot::Receiver<WatchEvent>;

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Session-oriented tree-store client.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Identifier of the underlying session.
    fn session_id(&self) -> String;

    /// Create a persistent node and any missing ancestors.  Succeeds if the
    /// node already exists.
    async fn create(&self, path: &str) -> Result<(), CoordinationError>;

    /// Create an ephemeral node `root/node` owned by this session and return
    /// its full path.  Fails with [`CoordinationError::NodeExists`] if taken.
    async fn create_ephemeral(&self, root: &str, node: &str) -> Result<String, CoordinationError>;

    async fn delete(&self, path: &str) -> Result<(), CoordinationError>;

    async fn get_children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// List the children of `path` and arm a one-shot watch on that list.
    async fn watch_children(&self, path: &str)
        -> Result<(Vec<String>, Watch), CoordinationError>;

    /// Subscribe to session-state events.
    fn session_events(&self) -> broadcast::Receiver<SessionEvent>;

    /// End the session.  Ephemeral nodes are released and pending watches
    /// resolve with [`WatchEventKind::SessionClosed`].
    async fn close(&self);
}

/// Builds new coordination sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn CoordinationClient>, CoordinationError>;
}

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// Join a parent path and a child name.
pub fn join_path(root: &str, node: &str) -> String {
    if root == "/" {
        format!("/{node}")
    } else {
        format!("{}/{node}", root.trim_end_matches('/'))
    }
}

/// Parent of `path` and the last segment, or `None` for the root.
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let trimmed = path.trim_end_matches('/');
    let idx = trimmed.rfind('/')?;
    let name = &trimmed[idx + 1..];
    if name.is_empty() {
        return None;
    }
    let parent = if idx == 0 { "/" } else { &trimmed[..idx] };
    Some((parent, name))
}

/// Every ancestor of `path` (excluding `/`) followed by `path` itself.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        out.push(current.clone());
    }
    out
}

pub(crate) fn validate_path(path: &str) -> Result<(), CoordinationError> {
    if !path.starts_with('/') || path.contains("//") {
        return Err(CoordinationError::Backend(format!("invalid path: {path:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_and_split_are_inverse() {
        let full = join_path("/dubbo/com.foo.Service/providers", "abc");
        assert_eq!(full, "/dubbo/com.foo.Service/providers/abc");
        assert_eq!(
            split_path(&full),
            Some(("/dubbo/com.foo.Service/providers", "abc"))
        );
        assert_eq!(split_path("/dubbo"), Some(("/", "dubbo")));
        assert_eq!(split_path("/"), None);
        assert_eq!(join_path("/", "dubbo"), "/dubbo");
    }

    #[test]
    fn ancestors_walk_from_the_top() {
        assert_eq!(
            ancestors("/dubbo/svc/providers"),
            vec!["/dubbo", "/dubbo/svc", "/dubbo/svc/providers"]
        );
    }

    #[test]
    fn validate_rejects_relative_paths() {
        assert!(validate_path("dubbo/x").is_err());
        assert!(validate_path("/dubbo//x").is_err());
        assert!(validate_path("/dubbo/x").is_ok());
    }
}
