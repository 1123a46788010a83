//! warden-host: plugin orchestration runtime
//!
//! Loads, starts, monitors and upgrades plugins behind a
//! [`SystemCoordinator`]. Loading and execution go through the [`Loader`]
//! boundary ([`WasmLoader`] by default); resource usage feeds the
//! [`HealthMonitor`]; version changes can be staged with the
//! [`RolloutManager`].

pub mod background;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod events;
pub mod health;
pub mod installer;
pub mod lifecycle;
pub mod loader;
pub mod locks;
pub mod persistence;
pub mod registry;
pub mod resolver;
pub mod rollout;
pub mod runtime;
pub mod testing;
pub mod version;
pub mod watcher;

pub use config::{HealthConfig, RolloutConfig, RuntimeConfig, APP_NAME};
pub use coordinator::{ScanReport, SystemCoordinator};
pub use error::{CoordinatorError, ErrorKind};
pub use events::{EventBus, EventBusConfig, EventFilter};
pub use health::{HealthMonitor, ResourceSampler, ResourceThresholds};
pub use installer::{DirectoryInstaller, InstallError, Installer};
pub use lifecycle::{LifecycleError, LifecycleHandler};
pub use loader::{Loader, LoaderError, WasmLoader, WasmLoaderConfig};
pub use persistence::{FilePersistence, MemoryPersistence, NullPersistence, PersistenceStore};
pub use registry::{PluginRegistry, RegistryError};
pub use rollout::{RolloutError, RolloutManager, RolloutRequest};
pub use runtime::{Runtime, RuntimeBuilder, RuntimeError};
pub use watcher::{PluginWatcher, WatcherConfig, WatcherError};
pub use warden_api as api;
