//! Runtime assembly
//!
//! [`RuntimeBuilder`] wires the event bus, registry, persistence, loader,
//! sampler, installer and configuration into a [`Runtime`]. Anything not
//! supplied gets the production implementation: [`WasmLoader`] as loader and
//! sampler, [`DirectoryInstaller`] under `install_root`, [`FilePersistence`]
//! at `state_file`.

use crate::background::BackgroundTask;
use crate::config::RuntimeConfig;
use crate::coordinator::SystemCoordinator;
use crate::events::{EventBus, EventBusConfig};
use crate::health::{HealthMonitor, ResourceSampler};
use crate::installer::{DirectoryInstaller, Installer};
use crate::lifecycle::LifecycleHandler;
use crate::loader::{Loader, LoaderError, WasmLoader, WasmLoaderConfig};
use crate::locks::PluginLocks;
use crate::persistence::{FilePersistence, NullPersistence, PersistenceError, PersistenceStore};
use crate::registry::PluginRegistry;
use crate::rollout::{NoopTrafficRouter, RolloutManager, TrafficRouter};
use crate::watcher::{PluginWatcher, WatcherConfig, WatcherError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while assembling a runtime
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Failed to create loader: {0}")]
    Loader(#[from] LoaderError),

    #[error("Failed to open plugin state: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("A custom loader needs a resource sampler")]
    MissingSampler,

    #[error(transparent)]
    Watcher(#[from] WatcherError),
}

/// Builder for [`Runtime`]
#[derive(Default)]
pub struct RuntimeBuilder {
    config: RuntimeConfig,
    loader: Option<Arc<dyn Loader>>,
    sampler: Option<Arc<dyn ResourceSampler>>,
    installer: Option<Arc<dyn Installer>>,
    persistence: Option<Arc<dyn PersistenceStore>>,
    router: Option<Arc<dyn TrafficRouter>>,
    wasm: WasmLoaderConfig,
}

impl RuntimeBuilder {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn loader(mut self, loader: Arc<dyn Loader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn sampler(mut self, sampler: Arc<dyn ResourceSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn installer(mut self, installer: Arc<dyn Installer>) -> Self {
        self.installer = Some(installer);
        self
    }

    pub fn persistence(mut self, persistence: Arc<dyn PersistenceStore>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    pub fn router(mut self, router: Arc<dyn TrafficRouter>) -> Self {
        self.router = Some(router);
        self
    }

    /// Settings for the default wasm loader
    pub fn wasm_config(mut self, config: WasmLoaderConfig) -> Self {
        self.wasm = config;
        self
    }

    /// Assemble the runtime. Must run inside a tokio runtime.
    pub fn build(self) -> Result<Runtime, RuntimeError> {
        let config = self.config;
        let events = EventBus::with_config(EventBusConfig {
            workers: config.event_workers,
            queue_capacity: config.event_queue_capacity,
        });

        let persistence: Arc<dyn PersistenceStore> = match (self.persistence, &config.state_file) {
            (Some(store), _) => store,
            (None, Some(path)) => Arc::new(FilePersistence::new(path)?),
            (None, None) => Arc::new(NullPersistence),
        };
        let registry = PluginRegistry::with_persistence(events.clone(), persistence);

        let (loader, sampler): (Arc<dyn Loader>, Arc<dyn ResourceSampler>) =
            match (self.loader, self.sampler) {
                (Some(loader), Some(sampler)) => (loader, sampler),
                (Some(_), None) => return Err(RuntimeError::MissingSampler),
                (None, sampler) => {
                    let wasm = Arc::new(WasmLoader::new(self.wasm)?);
                    let sampler = sampler.unwrap_or_else(|| wasm.clone() as Arc<dyn ResourceSampler>);
                    (wasm as Arc<dyn Loader>, sampler)
                }
            };
        let installer = self
            .installer
            .unwrap_or_else(|| Arc::new(DirectoryInstaller::new(&config.install_root)));
        let router = self.router.unwrap_or_else(|| Arc::new(NoopTrafficRouter));

        let locks = PluginLocks::new();
        let lifecycle = LifecycleHandler::new(
            registry.clone(),
            loader,
            events.clone(),
            config.operation_timeout,
        );
        let coordinator =
            SystemCoordinator::new(lifecycle.clone(), installer, events.clone(), locks.clone());
        let monitor = HealthMonitor::new(
            lifecycle,
            sampler,
            events.clone(),
            locks,
            config.health.clone(),
            config.probe_timeout,
        );
        let rollouts = RolloutManager::with_router(
            Arc::new(coordinator.clone()),
            Arc::new(monitor.clone()),
            router,
            events.clone(),
            config.rollout.clone(),
        );

        tracing::info!(
            install_root = %config.install_root.display(),
            plugin_dirs = ?config.plugin_dirs,
            persistent = config.state_file.is_some(),
            "Runtime assembled"
        );
        Ok(Runtime {
            config,
            events,
            registry,
            coordinator,
            monitor,
            rollouts,
            background: Vec::new(),
        })
    }
}

/// A wired plugin runtime
pub struct Runtime {
    config: RuntimeConfig,
    pub events: EventBus,
    pub registry: PluginRegistry,
    pub coordinator: SystemCoordinator,
    pub monitor: HealthMonitor,
    pub rollouts: RolloutManager,
    background: Vec<BackgroundTask>,
}

impl Runtime {
    pub fn builder(config: RuntimeConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Start the health sweep and the rollout scheduler. Calling it again
    /// does nothing.
    pub fn spawn_background(&mut self) {
        if !self.background.is_empty() {
            return;
        }
        self.background.push(self.monitor.spawn());
        self.background.push(self.rollouts.spawn());
    }

    /// Watch the configured plugin directories
    pub async fn watch(&self, config: WatcherConfig) -> Result<PluginWatcher, RuntimeError> {
        Ok(PluginWatcher::new(self.coordinator.clone(), &self.config.plugin_dirs, config).await?)
    }

    /// Stop background tasks, then run the coordinator's two-phase shutdown.
    ///
    /// Returns the ids unloaded.
    pub async fn shutdown(mut self, grace: Duration) -> Vec<String> {
        for task in self.background.drain(..) {
            let name = task.name();
            task.shutdown().await;
            tracing::debug!(task = name, "Background task stopped");
        }
        self.coordinator.shutdown(grace).await
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("background", &self.background)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FixedSampler, MemoryInstaller, ScriptedLoader};
    use warden_api::{PluginDescriptor, PluginState};

    #[tokio::test]
    async fn test_custom_loader_requires_sampler() {
        let result = RuntimeBuilder::new(RuntimeConfig::development())
            .loader(Arc::new(ScriptedLoader::new()))
            .build();
        assert!(matches!(result, Err(RuntimeError::MissingSampler)));
    }

    #[tokio::test]
    async fn test_build_and_shutdown() {
        let installer = Arc::new(MemoryInstaller::new());
        installer.add_package(
            "/pkgs/core",
            PluginDescriptor::new("core", "1.0.0", "core.wasm").system().trusted(),
        );

        let mut runtime = Runtime::builder(RuntimeConfig::development())
            .loader(Arc::new(ScriptedLoader::new()))
            .sampler(Arc::new(FixedSampler::new()))
            .installer(installer)
            .build()
            .unwrap();
        runtime.spawn_background();
        runtime.spawn_background();

        let id = runtime
            .coordinator
            .load_plugin(std::path::Path::new("/pkgs/core"))
            .await
            .unwrap();
        assert_eq!(runtime.registry.state(&id).await, Some(PluginState::Started));

        let registry = runtime.registry.clone();
        let unloaded = runtime.shutdown(Duration::ZERO).await;
        assert_eq!(unloaded, vec!["core".to_string()]);
        assert_eq!(registry.state("core").await, Some(PluginState::Unloaded));
    }
}
