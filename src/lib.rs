//! In-process container registry bridge.
//!
//! Resolve a configuration, build a registry instance from it and register a
//! [`Bridge`] transport whose image references are served by that instance
//! without opening a socket.
//!
//! ```no_run
//! use registry_bridge::{Bridge, ImageTransport, TransportRegistry};
//! use std::time::Duration;
//!
//! # async fn example() -> registry_bridge::Result<()> {
//! let transports = TransportRegistry::new();
//! let bridge = Bridge::from_config(
//!     "",
//!     ["REGISTRY_STORAGE=inmemory"],
//!     &transports,
//! )
//! .await?;
//!
//! let reference = bridge.parse_reference("//busybox")?;
//! let destination = reference.new_image_destination().await?;
//! destination.put_blob(b"layer").await?;
//!
//! bridge.deregister();
//! bridge.handle().shutdown(Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod errcode;
pub mod error;
pub mod image;
pub mod instance;
pub mod logging;
pub mod overlay;
pub mod reference;
pub mod registry;
pub mod server;
pub mod storage;
pub mod transport;

pub use config::Configuration;
pub use error::{is_code, normalize, ErrorKind, RegistryError, Result};
pub use image::{Image, ImageDestination, ImageReference, ImageSource};
pub use instance::{build, InstanceBuilder, InstanceHandle};
pub use overlay::Overlay;
pub use reference::{Digest, DockerReference};
pub use registry::{DistributionFactory, DistributionRegistry, Registry, RegistryFactory};
pub use storage::{DriverFactory, Storage, StorageDriver};
pub use transport::{Bridge, ImageTransport, TransportRegistry};
