//! Change listener: keeps one child watch alive for a subscription.
//!
//! Watches are single-shot, so after every notification the listener lists
//! the children again (which re-arms the watch), diffs the listing against
//! what it last reported, and hands the classified change to its
//! [`ConfigurationListener`].  There is no "updated" event at the tree level;
//! an update shows up as one removal plus one addition.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use super::listener::ConfigurationListener;
use super::table::Listener;
use crate::coordination::{CoordinationClient, CoordinationError, WatchEventKind};

/// Entries that appeared and disappeared between two listings.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChildrenDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl ChildrenDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub fn diff_children(previous: &BTreeSet<String>, current: &BTreeSet<String>) -> ChildrenDiff {
    ChildrenDiff {
        added: current.difference(previous).cloned().collect(),
        removed: previous.difference(current).cloned().collect(),
    }
}

pub struct ChangeListener {
    client: Arc<dyn CoordinationClient>,
    listener: Arc<ConfigurationListener>,
    retry: Duration,
}

impl ChangeListener {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        listener: Arc<ConfigurationListener>,
        retry: Duration,
    ) -> Self {
        Self {
            client,
            listener,
            retry,
        }
    }

    /// Watch until the listener is closed or the session goes away.
    pub async fn run(self) {
        let path = self.listener.path().to_string();
        let session = self.client.session_id();
        debug!(%path, %session, listener = self.listener.id(), "change listener started");

        loop {
            if self.listener.is_closed() {
                break;
            }
            let armed = tokio::select! {
                () = self.listener.cancelled() => break,
                armed = self.client.watch_children(&path) => armed,
            };

            match armed {
                Ok((children, watch)) => {
                    let current: BTreeSet<String> = children.into_iter().collect();
                    let diff = diff_children(&self.listener.observed(), &current);
                    if !diff.is_empty() {
                        let sent = self.listener.process(&diff, current);
                        debug!(
                            %path,
                            added = diff.added.len(),
                            removed = diff.removed.len(),
                            sent,
                            "children changed"
                        );
                    }

                    let fired = tokio::select! {
                        () = self.listener.cancelled() => break,
                        fired = watch => fired,
                    };
                    match fired {
                        Ok(event) if event.kind == WatchEventKind::SessionClosed => {
                            debug!(%path, %session, "watch ended with its session");
                            break;
                        }
                        Ok(_) => continue,
                        Err(_) => {
                            debug!(%path, %session, "watch dropped by client");
                            break;
                        }
                    }
                }
                Err(CoordinationError::NoNode { .. }) => {
                    // Nobody has registered under this category yet.
                    if let Err(e) = self.client.create(&path).await {
                        warn!(%path, error = %e, "cannot create watched path");
                        if !self.pause().await {
                            break;
                        }
                    }
                }
                Err(CoordinationError::SessionExpired) | Err(CoordinationError::Closed) => {
                    debug!(%path, %session, "session gone, change listener exiting");
                    break;
                }
                Err(e) => {
                    warn!(%path, error = %e, "arming watch failed, retrying");
                    if !self.pause().await {
                        break;
                    }
                }
            }
        }
        debug!(%path, listener = self.listener.id(), "change listener stopped");
    }

    /// Sleep for the retry delay; `false` if the listener closed meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            () = self.listener.cancelled() => false,
            () = tokio::time::sleep(self.retry) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classifies_added_and_removed() {
        let diff = diff_children(&set(&["a", "b"]), &set(&["b", "c"]));
        assert_eq!(diff.added, vec!["c"]);
        assert_eq!(diff.removed, vec!["a"]);
    }

    #[test]
    fn identical_sets_produce_nothing() {
        assert!(diff_children(&set(&["a"]), &set(&["a"])).is_empty());
        assert!(diff_children(&set(&[]), &set(&[])).is_empty());
    }

    #[test]
    fn first_listing_is_all_additions() {
        let diff = diff_children(&set(&[]), &set(&["x", "y"]));
        assert_eq!(diff.added, vec!["x", "y"]);
        assert!(diff.removed.is_empty());
    }
}
