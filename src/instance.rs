//! Building and driving in-process registry instances.

use crate::config::Configuration;
use crate::error::{RegistryError, Result};
use crate::logging::LoggingContext;
use crate::registry::{DistributionFactory, Registry, RegistryFactory};
use crate::storage::{self, DriverFactory, StorageDriver};
use axum::body::Body;
use axum::http::{Request, Response};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Builds [`InstanceHandle`]s from resolved configurations.
///
/// By default instances run the distribution handler over a storage driver
/// from the builder's [`DriverFactory`]. Hosts that link a cloud back-end
/// register its driver here; hosts with their own registry implementation
/// install a [`RegistryFactory`], which then owns storage creation.
#[derive(Default)]
pub struct InstanceBuilder {
    drivers: DriverFactory,
    factory: Option<Arc<dyn RegistryFactory>>,
}

impl fmt::Debug for InstanceBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceBuilder")
            .field("drivers", &self.drivers)
            .field("custom_factory", &self.factory.is_some())
            .finish()
    }
}

impl InstanceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_drivers(drivers: DriverFactory) -> Self {
        Self {
            drivers,
            factory: None,
        }
    }

    pub fn with_driver(
        mut self,
        name: impl Into<String>,
        driver: impl StorageDriver + 'static,
    ) -> Self {
        self.drivers.register(name, driver);
        self
    }

    pub fn with_factory(mut self, factory: impl RegistryFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Constructs one registry instance. A failure here never yields a handle.
    pub async fn build(&self, mut config: Configuration) -> Result<InstanceHandle> {
        let id = uuid::Uuid::new_v4().to_string();
        let logging = LoggingContext::from_config(&config.log, &id)?;

        let storage_type = config
            .storage
            .storage_type()
            .ok_or(RegistryError::MissingStorage)?
            .to_string();

        if config.http.secret.is_empty() {
            logging.in_scope(|| {
                warn!(
                    "No HTTP secret provided - generated random secret. This may cause problems \
                     with uploads if multiple registries are behind a load-balancer."
                )
            });
            config.configure_secret()?;
        }

        let user_agent = storage::user_agent();
        let registry = match &self.factory {
            Some(factory) => {
                logging
                    .scope(factory.create(&config, &storage_type, &user_agent))
                    .await?
            }
            None => {
                let factory = DistributionFactory::new(self.drivers.clone());
                logging
                    .scope(factory.create(&config, &storage_type, &user_agent))
                    .await?
            }
        };

        logging.in_scope(|| {
            info!(storage = %storage_type, "registry instance ready");
        });

        Ok(InstanceHandle {
            id,
            config,
            storage_type,
            user_agent,
            registry,
            logging,
            shut_down: AtomicBool::new(false),
        })
    }
}

/// Builds an instance with the default drivers.
pub async fn build(config: Configuration) -> Result<InstanceHandle> {
    InstanceBuilder::new().build(config).await
}

/// One live registry instance.
///
/// `serve_one_exchange` and `health` may be called concurrently. After
/// `shutdown` every exchange fails with [`RegistryError::ShutDown`].
pub struct InstanceHandle {
    id: String,
    config: Configuration,
    storage_type: String,
    user_agent: String,
    registry: Arc<dyn Registry>,
    logging: LoggingContext,
    shut_down: AtomicBool,
}

impl fmt::Debug for InstanceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceHandle")
            .field("id", &self.id)
            .field("storage_type", &self.storage_type)
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl InstanceHandle {
    /// Serves a single HTTP exchange without any socket in between.
    ///
    /// Exchanges already running when `shutdown` starts run to completion.
    pub async fn serve_one_exchange(&self, request: Request<Body>) -> Result<Response<Body>> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        debug!(method = %request.method(), uri = %request.uri(), "serving exchange");
        Ok(self.logging.scope(self.registry.serve_http(request)).await)
    }

    /// Checks the registry's back-end, bounded by `timeout`.
    pub async fn health(&self, timeout: Duration) -> Result<()> {
        if self.is_shut_down() {
            return Err(RegistryError::ShutDown);
        }
        self.bounded("health", timeout, self.registry.health()).await
    }

    /// Releases back-end resources. Calls after the first are no-ops.
    pub async fn shutdown(&self, timeout: Duration) -> Result<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.logging
            .in_scope(|| info!(storage = %self.storage_type, "shutting down registry instance"));
        self.bounded("shutdown", timeout, self.registry.shutdown()).await
    }

    async fn bounded<F>(&self, operation: &'static str, timeout: Duration, fut: F) -> Result<()>
    where
        F: Future<Output = Result<()>>,
    {
        tokio::time::timeout(timeout, self.logging.scope(fut))
            .await
            .map_err(|_| RegistryError::DeadlineExceeded { operation, timeout })?
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    pub fn storage_type(&self) -> &str {
        &self.storage_type
    }

    /// User agent handed to the storage driver.
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub fn logging(&self) -> &LoggingContext {
        &self.logging
    }
}
