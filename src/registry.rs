//! The registry seam an instance drives, and the distribution handler that
//! fills it by default.

use crate::config::Configuration;
use crate::error::Result;
use crate::server::{self, HandlerSettings};
use crate::storage::{DriverFactory, Storage, StorageDriver};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use serde_yaml::Value;
use std::fmt;
use std::sync::Arc;
use tower::ServiceExt;

/// An HTTP-serving registry with a storage back-end behind it.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Answers one request. Registry-level failures are HTTP responses.
    async fn serve_http(&self, request: Request<Body>) -> Response<Body>;

    async fn health(&self) -> Result<()>;

    /// Releases back-end resources. Called at most once.
    async fn shutdown(&self) -> Result<()>;
}

/// Creates a [`Registry`] from a resolved configuration.
#[async_trait]
pub trait RegistryFactory: Send + Sync {
    /// `storage_type` is the configured back-end name; `user_agent` is passed
    /// to storage drivers for their outbound requests.
    async fn create(
        &self,
        config: &Configuration,
        storage_type: &str,
        user_agent: &str,
    ) -> Result<Arc<dyn Registry>>;
}

/// The distribution API router over one storage back-end.
pub struct DistributionRegistry {
    storage: Arc<dyn Storage>,
    router: Router,
}

impl DistributionRegistry {
    pub fn new(storage: Arc<dyn Storage>, settings: HandlerSettings) -> Self {
        let router = server::router(Arc::clone(&storage), settings);
        Self { storage, router }
    }
}

#[async_trait]
impl Registry for DistributionRegistry {
    async fn serve_http(&self, request: Request<Body>) -> Response<Body> {
        match self.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(never) => match never {},
        }
    }

    async fn health(&self) -> Result<()> {
        self.storage.health().await
    }

    async fn shutdown(&self) -> Result<()> {
        self.storage.close().await
    }
}

/// Builds [`DistributionRegistry`]s with storage from a [`DriverFactory`].
#[derive(Debug, Default, Clone)]
pub struct DistributionFactory {
    drivers: DriverFactory,
}

impl DistributionFactory {
    pub fn new(drivers: DriverFactory) -> Self {
        Self { drivers }
    }

    pub fn drivers(&self) -> &DriverFactory {
        &self.drivers
    }

    pub fn register_driver(
        &mut self,
        name: impl Into<String>,
        driver: impl StorageDriver + 'static,
    ) {
        self.drivers.register(name, driver);
    }
}

#[async_trait]
impl RegistryFactory for DistributionFactory {
    async fn create(
        &self,
        config: &Configuration,
        storage_type: &str,
        user_agent: &str,
    ) -> Result<Arc<dyn Registry>> {
        let mut parameters = config.storage.parameters().cloned().unwrap_or_default();
        parameters.insert("useragent".to_string(), Value::String(user_agent.to_string()));

        let storage = self.drivers.create(storage_type, &parameters).await?;
        let settings = HandlerSettings::from_config(config)?;
        Ok(Arc::new(DistributionRegistry::new(storage, settings)))
    }
}

impl fmt::Debug for DistributionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributionRegistry").finish_non_exhaustive()
    }
}
