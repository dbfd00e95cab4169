use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

use crate::registry::listener::EventKind;
use crate::registry::session::SessionState;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Outcome {
    Created,
    Duplicate,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
    pub outcome: Outcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum Kind {
    Added,
    Removed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct EventKindLabel {
    pub kind: Kind,
}

impl From<EventKind> for EventKindLabel {
    fn from(kind: EventKind) -> Self {
        let kind = match kind {
            EventKind::Added => Kind::Added,
            EventKind::Removed => Kind::Removed,
        };
        Self { kind }
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StateLabels {
    pub state: String,
}

impl From<SessionState> for StateLabels {
    fn from(state: SessionState) -> Self {
        Self {
            state: state.as_str().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the registry client.
pub struct Metrics {
    // -- provider side --
    pub registrations_total: Family<OutcomeLabels, Counter>,
    pub registration_conflicts: Counter,
    pub registered_providers: Gauge,

    // -- consumer side --
    pub notifications_total: Family<EventKindLabel, Counter>,
    pub decode_failures: Counter,
    pub active_subscriptions: Gauge,

    // -- session --
    pub session_transitions: Family<StateLabels, Counter>,
    pub replays_total: Counter,
    pub replay_failures: Counter,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let registrations_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "svcreg_registrations",
            "Provider registration attempts by outcome",
            registrations_total.clone(),
        );

        let registration_conflicts = Counter::default();
        registry.register(
            "svcreg_registration_conflicts",
            "Ephemeral creates that hit an existing node",
            registration_conflicts.clone(),
        );

        let registered_providers: Gauge = Gauge::default();
        registry.register(
            "svcreg_registered_providers",
            "Provider paths currently bookkept by this client",
            registered_providers.clone(),
        );

        let notifications_total = Family::<EventKindLabel, Counter>::default();
        registry.register(
            "svcreg_notifications",
            "Notifications delivered to subscribers by kind",
            notifications_total.clone(),
        );

        let decode_failures = Counter::default();
        registry.register(
            "svcreg_decode_failures",
            "Registry entries that could not be decoded",
            decode_failures.clone(),
        );

        let active_subscriptions: Gauge = Gauge::default();
        registry.register(
            "svcreg_active_subscriptions",
            "Subscriptions with a live listener",
            active_subscriptions.clone(),
        );

        let session_transitions = Family::<StateLabels, Counter>::default();
        registry.register(
            "svcreg_session_transitions",
            "Coordination session state transitions",
            session_transitions.clone(),
        );

        let replays_total = Counter::default();
        registry.register(
            "svcreg_replays",
            "Registration and subscription replays after session loss",
            replays_total.clone(),
        );

        let replay_failures = Counter::default();
        registry.register(
            "svcreg_replay_failures",
            "Replays that exhausted their retry budget",
            replay_failures.clone(),
        );

        Self {
            registrations_total,
            registration_conflicts,
            registered_providers,
            notifications_total,
            decode_failures,
            active_subscriptions,
            session_transitions,
            replays_total,
            replay_failures,
        }
    }

    pub fn record_registration(&self, outcome: Outcome) {
        self.registrations_total
            .get_or_create(&OutcomeLabels { outcome })
            .inc();
    }

    pub fn record_transition(&self, state: SessionState) {
        self.session_transitions
            .get_or_create(&StateLabels::from(state))
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry.
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all registry-client metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// Render the OpenMetrics text exposition.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
