//! Metadata-service export.
//!
//! The metadata service is registered like any other provider: its URL is
//! built from the application config and handed to [`Registry::register`].
//! The registry does not care what the service serves.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::MetadataConfig;
use crate::error::Result;
use crate::registry::Registry;
use crate::url::{ServiceUrl, GROUP_KEY, VERSION_KEY};

pub const METADATA_SERVICE_NAME: &str = "org.apache.dubbo.metadata.MetadataService";
pub const DEFAULT_PROTOCOL: &str = "dubbo";

pub trait MetadataService: Send + Sync {
    fn version(&self) -> &str;

    fn service_name(&self) -> &str {
        METADATA_SERVICE_NAME
    }
}

/// A metadata service that only advertises a version.
pub struct StaticMetadataService {
    version: String,
}

impl StaticMetadataService {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl MetadataService for StaticMetadataService {
    fn version(&self) -> &str {
        &self.version
    }
}

pub struct MetadataServiceExporter {
    registry: Arc<Registry>,
    config: MetadataConfig,
    service: Arc<dyn MetadataService>,
    exported: Mutex<Option<ServiceUrl>>,
}

impl MetadataServiceExporter {
    pub fn new(
        registry: Arc<Registry>,
        config: MetadataConfig,
        service: Arc<dyn MetadataService>,
    ) -> Self {
        Self {
            registry,
            config,
            service,
            exported: Mutex::new(None),
        }
    }

    /// URL the metadata service is registered under.
    pub fn service_url(&self) -> ServiceUrl {
        ServiceUrl::new(
            DEFAULT_PROTOCOL,
            &self.config.host,
            self.config.port,
            self.service.service_name(),
        )
        .with_param(GROUP_KEY, &self.config.application)
        .with_param(VERSION_KEY, self.service.version())
    }

    /// Register the metadata service.  Exporting twice is a no-op.
    pub async fn export(&self) -> Result<()> {
        let mut exported = self.exported.lock().await;
        if let Some(url) = exported.as_ref() {
            warn!(%url, "metadata service already exported");
            return Ok(());
        }
        let url = self.service_url();
        self.registry.register(&url).await?;
        info!(%url, "metadata service exported");
        *exported = Some(url);
        Ok(())
    }

    pub async fn unexport(&self) -> Result<()> {
        let mut exported = self.exported.lock().await;
        if let Some(url) = exported.take() {
            self.registry.unregister(&url).await?;
            info!(%url, "metadata service unexported");
        }
        Ok(())
    }

    pub async fn is_exported(&self) -> bool {
        self.exported.lock().await.is_some()
    }

    pub async fn exported_urls(&self) -> Vec<ServiceUrl> {
        self.exported.lock().await.iter().cloned().collect()
    }
}
