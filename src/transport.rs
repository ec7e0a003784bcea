//! Named pseudo-transports bound to in-process registry instances.

use crate::config::Configuration;
use crate::error::{RegistryError, Result};
use crate::image::ImageReference;
use crate::instance::{self, InstanceHandle};
use crate::reference::DockerReference;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, info};

/// Prefix of every bridge's transport name.
pub const TRANSPORT_PREFIX: &str = "inproc-";

/// A source of image references, addressed by name.
pub trait ImageTransport: Send + Sync {
    fn name(&self) -> &str;

    /// Parses the part of an image name that follows `<transport>:`.
    fn parse_reference(&self, reference: &str) -> Result<ImageReference>;

    /// Every scope is accepted. A scope that can never match only confuses
    /// the caller; it never rejects a valid one.
    fn validate_policy_configuration_scope(&self, _scope: &str) -> Result<()> {
        Ok(())
    }

    /// Removes the transport from its table. Repeated calls are no-ops.
    fn deregister(&self);
}

type TransportTable = HashMap<String, Arc<dyn ImageTransport>>;

/// Table of live transports, keyed by name.
///
/// Cloning shares the table. Bridges only keep a weak link to it, so dropping
/// the last `TransportRegistry` drops every registered bridge.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    table: Arc<Mutex<TransportTable>>,
}

impl fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("names", &self.names())
            .finish()
    }
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `transport` unless its name is taken. Returns whether it was added.
    pub fn register(&self, transport: Arc<dyn ImageTransport>) -> bool {
        let name = transport.name().to_string();
        let mut table = self.table.lock();
        if table.contains_key(&name) {
            debug!(transport = %name, "transport already registered");
            return false;
        }
        table.insert(name, transport);
        true
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn ImageTransport>> {
        self.table.lock().get(name).cloned()
    }

    pub fn delete(&self, name: &str) -> bool {
        self.table.lock().remove(name).is_some()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.table.lock().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().is_empty()
    }

    /// Parses `<transport>:<reference>` against the registered transports.
    pub fn parse_image_name(&self, image_name: &str) -> Result<ImageReference> {
        let (name, reference) = image_name.split_once(':').ok_or_else(|| {
            RegistryError::malformed(image_name, "expected <transport>:<reference>")
        })?;
        let transport = self.lookup(name).ok_or_else(|| {
            RegistryError::malformed(image_name, format!("unknown transport {name:?}"))
        })?;
        transport.parse_reference(reference)
    }

    fn downgrade(&self) -> Weak<Mutex<TransportTable>> {
        Arc::downgrade(&self.table)
    }
}

struct BridgeInner {
    name: String,
    handle: Arc<InstanceHandle>,
    transports: Weak<Mutex<TransportTable>>,
    registered: AtomicBool,
}

/// A transport whose references are served by one in-process instance.
///
/// The bridge does not own the instance's lifecycle: whoever built the
/// handle shuts it down.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.inner.name)
            .field("registered", &self.is_registered())
            .finish()
    }
}

impl Bridge {
    /// Creates a bridge named `<prefix><backend>-<token>` and registers it.
    pub fn new(
        handle: Arc<InstanceHandle>,
        backend: &str,
        transports: &TransportRegistry,
    ) -> Self {
        let token = uuid::Uuid::new_v4().simple().to_string();
        Self::named(format!("{TRANSPORT_PREFIX}{backend}-{token}"), handle, transports)
    }

    /// Registers a bridge under `name`. When the name is already taken the
    /// existing entry stays and this bridge counts as registered through it.
    fn named(name: String, handle: Arc<InstanceHandle>, transports: &TransportRegistry) -> Self {
        let bridge = Self {
            inner: Arc::new(BridgeInner {
                name,
                handle,
                transports: transports.downgrade(),
                registered: AtomicBool::new(true),
            }),
        };

        if transports.register(Arc::new(bridge.clone())) {
            info!(transport = %bridge.inner.name, "registered transport");
        } else {
            debug!(transport = %bridge.inner.name, "transport name taken, keeping existing entry");
        }
        bridge
    }

    /// Resolves `document` with `overlay`, builds an instance and registers a
    /// bridge for it.
    pub async fn from_config<I, S>(
        document: &str,
        overlay: I,
        transports: &TransportRegistry,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let config = Configuration::resolve(document, overlay)?;
        let handle = instance::build(config).await?;
        let backend = handle.storage_type().to_string();
        Ok(Self::new(Arc::new(handle), &backend, transports))
    }

    pub fn handle(&self) -> &Arc<InstanceHandle> {
        &self.inner.handle
    }

    pub fn is_registered(&self) -> bool {
        self.inner.registered.load(Ordering::SeqCst)
            && self
                .inner
                .transports
                .upgrade()
                .is_some_and(|table| table.lock().contains_key(&self.inner.name))
    }

    pub(crate) fn ensure_registered(&self) -> Result<()> {
        if self.is_registered() {
            Ok(())
        } else {
            Err(RegistryError::Deregistered(self.inner.name.clone()))
        }
    }
}

impl ImageTransport for Bridge {
    fn name(&self) -> &str {
        &self.inner.name
    }

    /// Accepts `//<repository>[:<tag>|@<digest>]`. An omitted tag becomes
    /// `latest`.
    fn parse_reference(&self, reference: &str) -> Result<ImageReference> {
        let Some(rest) = reference.strip_prefix("//") else {
            return Err(RegistryError::malformed(
                reference,
                "image reference does not start with //",
            ));
        };
        let docker = DockerReference::parse_normalized(rest)?.with_default_tag();
        ImageReference::new(self.clone(), docker)
    }

    fn deregister(&self) {
        if !self.inner.registered.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(table) = self.inner.transports.upgrade() {
            table.lock().remove(&self.inner.name);
        }
        info!(transport = %self.inner.name, "deregistered transport");
    }
}
