use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::metrics::MetricsRegistry;
use crate::registry::Registry;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    /// Session state of the registry (`connected`, `expired`, ...).
    pub state: String,
    pub registered: usize,
    pub subscriptions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keydb: Option<CheckResult>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Ok,
    Degraded,
    Unavailable,
}

#[derive(Debug, Serialize)]
pub struct CheckResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl CheckResult {
    fn healthy() -> Self {
        Self {
            ok: true,
            detail: None,
        }
    }

    fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: Some(detail.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state expected by the handlers
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub metrics: MetricsRegistry,
    /// Pinged on every health check when the KeyDB backend is in use.
    pub keydb: Option<fred::clients::Pool>,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn check_keydb(pool: &fred::clients::Pool) -> CheckResult {
    match fred::interfaces::ClientLike::ping::<String>(pool, None).await {
        Ok(_) => CheckResult::healthy(),
        Err(e) => CheckResult::unhealthy(format!("PING failed: {e}")),
    }
}

fn aggregate_status(available: bool, keydb: Option<&CheckResult>) -> HealthStatus {
    if !available {
        HealthStatus::Unavailable
    } else if keydb.is_some_and(|c| !c.ok) {
        HealthStatus::Degraded
    } else {
        HealthStatus::Ok
    }
}

// ---------------------------------------------------------------------------
// Axum handlers
// ---------------------------------------------------------------------------

/// `GET /healthz`.  Returns 200 while the registry is available, 503 otherwise.
pub async fn health_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let keydb = match &state.keydb {
        Some(pool) => Some(check_keydb(pool).await),
        None => None,
    };
    let registry = &state.registry;
    let status = aggregate_status(registry.is_available(), keydb.as_ref());
    let body = HealthResponse {
        status,
        state: registry.state().to_string(),
        registered: registry.registered_urls().len(),
        subscriptions: registry.subscribed_urls().len(),
        keydb,
    };

    let http_status = match status {
        HealthStatus::Ok | HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(body))
}

/// `GET /metrics` in the OpenMetrics text format.
pub async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                "application/openmetrics-text; version=1.0.0; charset=utf-8",
            )],
            body,
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {e}"),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::coordination::memory::MemoryTree;
    use crate::url::ServiceUrl;

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_follows_registry_availability() {
        let tree = MemoryTree::new();
        let metrics = MetricsRegistry::new();
        let registry = Arc::new(
            Registry::connect_with_metrics(
                RegistryConfig::default(),
                Arc::new(tree.connector()),
                Arc::clone(&metrics.metrics),
            )
            .await
            .unwrap(),
        );
        let url = ServiceUrl::parse("dubbo://10.0.0.1:20880/com.foo.Service").unwrap();
        registry.register(&url).await.unwrap();

        let state = HealthState {
            registry: Arc::clone(&registry),
            metrics,
            keydb: None,
        };

        let response = health_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["state"], "connected");
        assert_eq!(body["registered"], 1);
        assert!(body.get("keydb").is_none());

        let response = metrics_handler(State(state.clone())).await.into_response();
        assert_eq!(response.status(), StatusCode::OK);

        registry.close().await;
        let response = health_handler(State(state)).await.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["state"], "closed");
    }
}
