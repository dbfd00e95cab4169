//! KeyDB / Redis connection pool for the registry tree.
//!
//! Builds a [`fred::clients::Pool`] from [`crate::config::KeyDbConfig`].  TLS
//! goes through fred's `rustls` connector and the password is read from the
//! environment variable named by `auth_token_env`.

use anyhow::{Context, Result};
use fred::clients::Pool;
use fred::interfaces::ClientLike;
use fred::types::config::{Config as FredConfig, ReconnectPolicy, ServerConfig, TlsConnector};
use fred::types::Builder;

use crate::config::KeyDbConfig;

const DEFAULT_PORT: u16 = 6379;

/// Create and connect a pool, verifying it with a PING.
pub async fn create_keydb_pool(config: &KeyDbConfig) -> Result<Pool> {
    let endpoint = config
        .endpoint
        .trim_start_matches("rediss://")
        .trim_start_matches("redis://");
    let (host, port) = parse_host_port(endpoint)?;

    let mut fred_config = FredConfig {
        server: ServerConfig::new_centralized(host, port),
        ..FredConfig::default()
    };
    if config.tls {
        fred_config.tls = Some(TlsConnector::default_rustls()?.into());
    }
    fred_config.password = std::env::var(&config.auth_token_env).ok();

    let mut builder = Builder::from_config(fred_config);
    // Transport-level reconnects only; session loss is detected by the
    // heartbeat in `keydb`.
    builder.set_policy(ReconnectPolicy::new_exponential(0, 100, 30_000, 2));

    let pool = builder
        .build_pool(config.pool_size)
        .context("failed to build KeyDB connection pool")?;
    pool.init().await.context("failed to connect to KeyDB")?;

    let _: String = pool
        .ping(None)
        .await
        .context("KeyDB PING failed after connect")?;

    tracing::info!(
        host = host,
        port = port,
        tls = config.tls,
        pool_size = config.pool_size,
        prefix = %config.key_prefix,
        "registry KeyDB pool ready"
    );
    Ok(pool)
}

/// Parse `host:port`, defaulting the port to 6379.
pub fn parse_host_port(endpoint: &str) -> Result<(&str, u16)> {
    let endpoint = endpoint.split('/').next().unwrap_or(endpoint);
    match endpoint.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse()
                .with_context(|| format!("invalid port in endpoint: {endpoint}"))?;
            Ok((host, port))
        }
        None => Ok((endpoint, DEFAULT_PORT)),
    }
}
