//! Configuration listener and the subscriber-facing notification stream.
//!
//! A [`ConfigurationListener`] turns classified child-name changes into typed
//! [`ServiceEvent`]s for one subscribed consumer URL.  Its closed flag and its
//! delivery share one lock, so once [`Listener::close`] returns no further
//! event from this listener can reach a subscriber, even if a watch callback
//! was already in flight.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::change::ChildrenDiff;
use super::table::Listener;
use crate::error::RegistryError;
use crate::metrics::{EventKindLabel, Metrics};
use crate::url::ServiceUrl;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Added,
    Removed,
}

/// A typed change delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEvent {
    pub kind: EventKind,
    pub url: ServiceUrl,
}

impl ServiceEvent {
    pub fn added(url: ServiceUrl) -> Self {
        Self {
            kind: EventKind::Added,
            url,
        }
    }

    pub fn removed(url: ServiceUrl) -> Self {
        Self {
            kind: EventKind::Removed,
            url,
        }
    }
}

// ---------------------------------------------------------------------------
// ConfigurationListener
// ---------------------------------------------------------------------------

struct Delivery {
    /// Child names seen by the last delivery.
    observed: BTreeSet<String>,
    closed: bool,
}

pub struct ConfigurationListener {
    id: u64,
    subscriber: ServiceUrl,
    path: String,
    events: broadcast::Sender<ServiceEvent>,
    delivery: Mutex<Delivery>,
    closed: AtomicBool,
    cancel: CancellationToken,
    metrics: Arc<Metrics>,
}

impl ConfigurationListener {
    /// Build a listener for `subscriber` watching `path`.
    ///
    /// `events` is the subscriber channel; it outlives any single listener so
    /// streams survive a session replay.  `seed` is the child set a previous
    /// listener already reported.
    pub fn new(
        subscriber: ServiceUrl,
        path: String,
        events: broadcast::Sender<ServiceEvent>,
        seed: BTreeSet<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id: NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed),
            subscriber,
            path,
            events,
            delivery: Mutex::new(Delivery {
                observed: seed,
                closed: false,
            }),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            metrics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn subscriber(&self) -> &ServiceUrl {
        &self.subscriber
    }

    /// Category path being watched.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn sender(&self) -> broadcast::Sender<ServiceEvent> {
        self.events.clone()
    }

    /// Child names reported so far.
    pub fn observed(&self) -> BTreeSet<String> {
        self.delivery.lock().observed.clone()
    }

    /// Resolves once the listener is closed.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Attach a new reader: the providers currently known plus a receiver for
    /// everything after them.
    pub fn attach(&self) -> (Vec<ServiceUrl>, broadcast::Receiver<ServiceEvent>) {
        let delivery = self.delivery.lock();
        let known = delivery
            .observed
            .iter()
            .filter_map(|name| ServiceUrl::decode(name).ok())
            .filter(|url| url.matches(&self.subscriber))
            .collect();
        (known, self.events.subscribe())
    }

    /// Decode and deliver a classified change.
    ///
    /// `current` becomes the new observed set.  Returns the number of events
    /// sent; a closed listener discards everything and returns 0.
    pub fn process(&self, diff: &ChildrenDiff, current: BTreeSet<String>) -> usize {
        let mut delivery = self.delivery.lock();
        if delivery.closed {
            debug!(listener = self.id, path = %self.path, "discarding change for closed listener");
            return 0;
        }
        delivery.observed = current;

        let removed = diff.removed.iter().map(|n| (EventKind::Removed, n));
        let added = diff.added.iter().map(|n| (EventKind::Added, n));
        let mut sent = 0;
        for (kind, name) in removed.chain(added) {
            let url = match decode_entry(name) {
                Ok(url) => url,
                Err(e) => {
                    warn!(path = %self.path, error = %e, "skipping malformed registry entry");
                    self.metrics.decode_failures.inc();
                    continue;
                }
            };
            if !url.matches(&self.subscriber) {
                debug!(%url, subscriber = %self.subscriber, "entry does not match subscriber");
                continue;
            }
            self.metrics
                .notifications_total
                .get_or_create(&EventKindLabel::from(kind))
                .inc();
            // No receivers is fine: the subscriber may only read `known`.
            let _ = self.events.send(ServiceEvent { kind, url });
            sent += 1;
        }
        sent
    }
}

impl Listener for ConfigurationListener {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        // Taking the delivery lock waits out any in-flight `process`.
        self.delivery.lock().closed = true;
        self.closed.store(true, Ordering::Release);
        self.cancel.cancel();
    }
}

fn decode_entry(name: &str) -> Result<ServiceUrl, RegistryError> {
    ServiceUrl::decode(name).map_err(|e| RegistryError::Decode {
        entry: name.to_string(),
        reason: e.to_string(),
    })
}

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// Handle returned by `Registry::subscribe`.
///
/// Calls for the same consumer URL share one listener; each handle gets its
/// own receiver.  The stream ends after `unsubscribe` or registry shutdown.
pub struct Subscription {
    url: ServiceUrl,
    listener_id: u64,
    known: Vec<ServiceUrl>,
    rx: broadcast::Receiver<ServiceEvent>,
}

impl Subscription {
    pub(crate) fn new(url: ServiceUrl, listener: &ConfigurationListener) -> Self {
        let (known, rx) = listener.attach();
        Self {
            url,
            listener_id: listener.id(),
            known,
            rx,
        }
    }

    pub fn url(&self) -> &ServiceUrl {
        &self.url
    }

    /// Identity of the listener this handle was attached to.
    pub fn listener_id(&self) -> u64 {
        self.listener_id
    }

    /// Providers already known when this handle was attached.
    pub fn known(&self) -> &[ServiceUrl] {
        &self.known
    }

    /// Next event, or `None` once the subscription is gone.
    pub async fn recv(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(url = %self.url, skipped, "subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<ServiceEvent> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(url = %self.url, skipped, "subscriber lagged, events dropped");
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ServiceEvent> {
        BroadcastStream::new(self.rx).filter_map(|event| event.ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsRegistry;

    fn provider(host: &str) -> ServiceUrl {
        ServiceUrl::parse(&format!("dubbo://{host}:20880/com.foo.Service?version=1.0")).unwrap()
    }

    fn listener() -> ConfigurationListener {
        let consumer = ServiceUrl::parse("consumer://10.0.0.9/com.foo.Service").unwrap();
        let (tx, _) = broadcast::channel(16);
        ConfigurationListener::new(
            consumer,
            "/dubbo/com.foo.Service/providers".into(),
            tx,
            BTreeSet::new(),
            MetricsRegistry::new().metrics,
        )
    }

    fn diff(added: &[String], removed: &[String]) -> ChildrenDiff {
        ChildrenDiff {
            added: added.to_vec(),
            removed: removed.to_vec(),
        }
    }

    #[test]
    fn delivers_typed_events() {
        let l = listener();
        let (_, mut rx) = l.attach();
        let a = provider("10.0.0.1").encode();
        let current: BTreeSet<String> = [a.clone()].into();
        assert_eq!(l.process(&diff(&[a.clone()], &[]), current.clone()), 1);
        assert_eq!(rx.try_recv().unwrap(), ServiceEvent::added(provider("10.0.0.1")));
        assert_eq!(l.observed(), current);
    }

    #[test]
    fn malformed_entry_does_not_abort_batch() {
        let l = listener();
        let (_, mut rx) = l.attach();
        let good = provider("10.0.0.2").encode();
        let batch = vec!["%FF%FE".to_string(), good.clone()];
        assert_eq!(l.process(&diff(&batch, &[]), batch.iter().cloned().collect()), 1);
        assert_eq!(rx.try_recv().unwrap().url, provider("10.0.0.2"));
        assert!(rx.try_recv().is_err());
        assert_eq!(l.metrics.decode_failures.get(), 1);
    }

    #[test]
    fn non_matching_providers_are_filtered() {
        let l = listener();
        let (_, mut rx) = l.attach();
        let other = ServiceUrl::parse("dubbo://10.0.0.3:20880/com.foo.Other").unwrap().encode();
        assert_eq!(l.process(&diff(&[other.clone()], &[]), [other].into()), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn closed_listener_discards() {
        let l = listener();
        let (_, mut rx) = l.attach();
        l.close();
        assert!(l.is_closed());
        let a = provider("10.0.0.1").encode();
        assert_eq!(l.process(&diff(&[a.clone()], &[]), [a].into()), 0);
        assert!(rx.try_recv().is_err());
        assert!(l.observed().is_empty());
    }

    #[test]
    fn attach_reports_known_providers() {
        let l = listener();
        let a = provider("10.0.0.1").encode();
        l.process(&diff(&[a.clone()], &[]), [a].into());
        let (known, _) = l.attach();
        assert_eq!(known, vec![provider("10.0.0.1")]);
    }

    #[test]
    fn removals_are_delivered_before_additions() {
        let l = listener();
        let (_, mut rx) = l.attach();
        let old = provider("10.0.0.1").encode();
        let new = provider("10.0.0.2").encode();
        l.process(&diff(&[new.clone()], &[old]), [new].into());
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Removed);
        assert_eq!(rx.try_recv().unwrap().kind, EventKind::Added);
    }
}
