use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use svc_registry::config::{self, Config};
use svc_registry::coordination::keydb::{KeyDbConnector, KeyDbSettings};
use svc_registry::coordination::redis::create_keydb_pool;
use svc_registry::health::{self, HealthState};
use svc_registry::metadata::{MetadataServiceExporter, StaticMetadataService};
use svc_registry::metrics::MetricsRegistry;
use svc_registry::{EventKind, Registry, ServiceUrl};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "svc-registry", about = "RPC service-registry client")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/svc-registry/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(config: Arc<Config>, state: HealthState) -> Result<()> {
    let app = health::router(state);

    let listen_addr: std::net::SocketAddr = config
        .http_listen
        .parse()
        .context("invalid http_listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Startup registrations and subscriptions
// ---------------------------------------------------------------------------

async fn register_providers(registry: &Registry, config: &Config) -> Result<()> {
    for raw in &config.providers {
        let url = ServiceUrl::parse(raw).with_context(|| format!("invalid provider url: {raw}"))?;
        let result = match registry.register(&url).await {
            Err(e) if e.is_session_loss() => {
                tracing::warn!(
                    provider = %url,
                    error = %e,
                    "session lost during registration, retrying"
                );
                registry.wait_connected().await?;
                registry.register(&url).await
            }
            result => result,
        };
        result.with_context(|| format!("failed to register provider {url}"))?;
        tracing::info!(provider = %url, service = %url.service_key(), "provider registered");
    }
    Ok(())
}

/// Subscribe every configured consumer and log what it sees until shutdown.
async fn watch_subscriptions(
    registry: Arc<Registry>,
    config: Arc<Config>,
    shutdown: CancellationToken,
) -> Result<()> {
    let mut tasks = Vec::new();
    for raw in &config.subscriptions {
        let url = ServiceUrl::parse(raw).with_context(|| format!("invalid consumer url: {raw}"))?;
        let subscription = registry
            .subscribe(&url)
            .await
            .with_context(|| format!("failed to subscribe {url}"))?;
        for provider in subscription.known() {
            tracing::info!(consumer = %url, %provider, "provider known");
        }

        let shutdown = shutdown.clone();
        tasks.push(tokio::spawn(async move {
            let mut events = subscription.into_stream();
            loop {
                let event = tokio::select! {
                    () = shutdown.cancelled() => break,
                    event = events.next() => event,
                };
                let Some(event) = event else { break };
                match event.kind {
                    EventKind::Added => {
                        tracing::info!(consumer = %url, provider = %event.url, "provider added")
                    }
                    EventKind::Removed => {
                        tracing::info!(consumer = %url, provider = %event.url, "provider removed")
                    }
                }
            }
            tracing::debug!(consumer = %url, "subscription stream ended");
        }));
    }
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = Arc::new(config::load_config(&cli.config)?);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting svc-registry");

    // ---- Infrastructure clients ----
    let keydb = create_keydb_pool(&config.keydb).await?;
    let settings = KeyDbSettings::new(&config.keydb, config.registry.session_timeout());
    let connector = Arc::new(KeyDbConnector::new(keydb.clone(), settings));

    // ---- Metrics ----
    let metrics = MetricsRegistry::new();

    // ---- Registry ----
    let registry = Arc::new(
        Registry::connect_with_metrics(
            config.registry.clone(),
            connector,
            Arc::clone(&metrics.metrics),
        )
        .await
        .context("failed to start registry")?,
    );

    // ---- Metadata service ----
    let exporter = match &config.metadata {
        Some(metadata) => {
            let exporter = MetadataServiceExporter::new(
                Arc::clone(&registry),
                metadata.clone(),
                Arc::new(StaticMetadataService::new(metadata.version.clone())),
            );
            exporter
                .export()
                .await
                .context("failed to export metadata service")?;
            Some(exporter)
        }
        None => None,
    };

    register_providers(&registry, &config).await?;

    // ---- Spawn services ----
    let shutdown = CancellationToken::new();
    let subscriptions_handle = tokio::spawn({
        let registry = Arc::clone(&registry);
        let config = Arc::clone(&config);
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = watch_subscriptions(registry, config, shutdown).await {
                tracing::error!(error = %e, "subscriptions failed");
            }
        }
    });

    let state = HealthState {
        registry: Arc::clone(&registry),
        metrics,
        keydb: Some(keydb),
    };
    if let Err(e) = run_http_server(Arc::clone(&config), state).await {
        tracing::error!(error = %e, "HTTP server failed");
    }

    // ---- Shutdown ----
    shutdown.cancel();
    let _ = subscriptions_handle.await;
    if let Some(exporter) = exporter {
        if let Err(e) = exporter.unexport().await {
            tracing::warn!(error = %e, "failed to unexport metadata service");
        }
    }
    registry.close().await;

    tracing::info!("svc-registry shut down cleanly");
    Ok(())
}
