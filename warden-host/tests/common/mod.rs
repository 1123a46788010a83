//! Shared harness for integration tests

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use warden_host::api::{EventEnvelope, PluginDescriptor};
use warden_host::testing::{FixedSampler, MemoryInstaller, ScriptedLoader};
use warden_host::{
    EventFilter, HealthConfig, MemoryPersistence, PersistenceStore, RolloutConfig, Runtime,
    RuntimeConfig,
};

pub struct Harness {
    pub runtime: Runtime,
    pub loader: Arc<ScriptedLoader>,
    pub sampler: Arc<FixedSampler>,
    pub installer: Arc<MemoryInstaller>,
    pub persistence: Arc<MemoryPersistence>,
}

pub fn config() -> RuntimeConfig {
    RuntimeConfig::development()
        .with_operation_timeout(Duration::from_millis(200))
        .with_probe_timeout(Duration::from_millis(100))
        .with_health(HealthConfig::default().with_interval(Duration::from_secs(3600)))
        .with_rollout(RolloutConfig::default().with_tick_interval(Duration::from_secs(3600)))
}

pub fn harness() -> Harness {
    harness_with(config(), MemoryPersistence::new())
}

pub fn harness_with(config: RuntimeConfig, persistence: MemoryPersistence) -> Harness {
    let loader = Arc::new(ScriptedLoader::new());
    let sampler = Arc::new(FixedSampler::new());
    let installer = Arc::new(MemoryInstaller::new());
    let persistence = Arc::new(persistence);

    let runtime = Runtime::builder(config)
        .loader(loader.clone())
        .sampler(sampler.clone())
        .installer(installer.clone())
        .persistence(persistence.clone() as Arc<dyn PersistenceStore>)
        .build()
        .expect("Failed to build runtime");

    Harness {
        runtime,
        loader,
        sampler,
        installer,
        persistence,
    }
}

impl Harness {
    /// Make a package for `descriptor` available and return its path
    pub fn package(&self, descriptor: PluginDescriptor) -> PathBuf {
        let path = PathBuf::from(format!(
            "/pkgs/{}-{}",
            descriptor.plugin_id, descriptor.version
        ));
        self.installer.add_package(&path, descriptor);
        path
    }

    /// Record every event matching `filter`
    pub fn record(&self, filter: EventFilter) -> Arc<Mutex<Vec<EventEnvelope>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        self.runtime
            .events
            .subscribe_sync(filter, 0, move |event: &mut EventEnvelope| {
                sink.lock().unwrap().push(event.clone());
                Ok(())
            });
        seen
    }
}

pub fn plugin(id: &str) -> PluginDescriptor {
    PluginDescriptor::new(id, "1.0.0", format!("{id}.wasm"))
}
