use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub keydb: KeyDbConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    /// Socket address for the health / metrics listener (e.g. `0.0.0.0:9090`).
    #[serde(default = "default_http_listen")]
    pub http_listen: String,
    /// Provider URLs registered at startup.
    #[serde(default)]
    pub providers: Vec<String>,
    /// Consumer URLs subscribed at startup.
    #[serde(default)]
    pub subscriptions: Vec<String>,
    /// Export the metadata service when present.
    #[serde(default)]
    pub metadata: Option<MetadataConfig>,
}

fn default_http_listen() -> String {
    "0.0.0.0:9090".to_string()
}

// ---------------------------------------------------------------------------
// Registry behaviour
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    /// First segment of every registry path: `/<namespace>/<service>/<category>`.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Coordination session timeout in milliseconds.
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    /// Notifications buffered per subscription before slow readers lag.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Delay before a change listener retries a failed listing.
    #[serde(default = "default_watch_retry_ms")]
    pub watch_retry_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            session_timeout_ms: default_session_timeout_ms(),
            reconnect: ReconnectConfig::default(),
            event_buffer: default_event_buffer(),
            watch_retry_ms: default_watch_retry_ms(),
        }
    }
}

impl RegistryConfig {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn watch_retry(&self) -> Duration {
        Duration::from_millis(self.watch_retry_ms)
    }
}

fn default_namespace() -> String {
    "dubbo".to_string()
}

fn default_session_timeout_ms() -> u64 {
    15_000
}

fn default_event_buffer() -> usize {
    1024
}

fn default_watch_retry_ms() -> u64 {
    1_000
}

/// Bounded exponential backoff used for reconnects and replay retries.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl ReconnectConfig {
    /// Delay before retry `attempt` (1-based); the first attempt is immediate.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let base = self.initial_backoff_ms as f64 * self.multiplier.powi((attempt - 2) as i32);
        Duration::from_millis(base.min(self.max_backoff_ms as f64) as u64)
    }
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    100
}

fn default_max_backoff_ms() -> u64 {
    10_000
}

fn default_multiplier() -> f64 {
    2.0
}

// ---------------------------------------------------------------------------
// KeyDB / Redis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct KeyDbConfig {
    /// Connection string (e.g. `rediss://keydb.local:6380`).
    pub endpoint: String,
    /// Enable TLS for the KeyDB connection.
    #[serde(default = "bool_true")]
    pub tls: bool,
    /// Name of the environment variable that holds the KeyDB auth token.
    #[serde(default = "default_keydb_auth_env")]
    pub auth_token_env: String,
    /// Prefix of every key the registry tree writes.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Interval of the fallback poll that catches ephemeral-node expiry.
    #[serde(default = "default_watch_poll_ms")]
    pub watch_poll_ms: u64,
}

fn bool_true() -> bool {
    true
}

fn default_keydb_auth_env() -> String {
    "KEYDB_AUTH_TOKEN".to_string()
}

fn default_key_prefix() -> String {
    "svcreg".to_string()
}

fn default_pool_size() -> usize {
    4
}

fn default_watch_poll_ms() -> u64 {
    2_000
}

// ---------------------------------------------------------------------------
// Metadata service export
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct MetadataConfig {
    /// Application name, used as the exported service group.
    pub application: String,
    /// Address advertised for the metadata service.
    pub host: String,
    #[serde(default = "default_metadata_port")]
    pub port: u16,
    #[serde(default = "default_metadata_version")]
    pub version: String,
}

fn default_metadata_port() -> u16 {
    20_000
}

fn default_metadata_version() -> String {
    "1.0.0".to_string()
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&contents)
        .with_context(|| format!("failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
fn validate_config(config: &Config) -> Result<()> {
    let registry = &config.registry;
    anyhow::ensure!(
        !registry.namespace.is_empty() && !registry.namespace.contains('/'),
        "namespace must be a single non-empty path segment"
    );
    anyhow::ensure!(
        registry.session_timeout_ms >= 1_000,
        "session_timeout_ms must be at least 1000"
    );
    anyhow::ensure!(
        registry.reconnect.max_attempts >= 1,
        "reconnect.max_attempts must be at least 1"
    );
    anyhow::ensure!(
        registry.reconnect.multiplier >= 1.0,
        "reconnect.multiplier must be >= 1.0"
    );
    anyhow::ensure!(registry.event_buffer > 0, "event_buffer must be positive");
    anyhow::ensure!(config.keydb.pool_size > 0, "keydb.pool_size must be positive");
    for url in config.providers.iter().chain(&config.subscriptions) {
        crate::url::ServiceUrl::parse(url)
            .with_context(|| format!("invalid service url in config: {url}"))?;
    }
    Ok(())
}
