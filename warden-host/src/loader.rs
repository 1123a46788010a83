//! Module loader boundary and the wasmtime implementation
//!
//! [`Loader`] is the capability the lifecycle handler drives: load a unit of
//! code, run its init/start/stop hooks, release it. [`WasmLoader`] backs it
//! with wasmtime: each plugin gets its own store with a fuel budget per call,
//! and no host imports are linked.

use crate::health::{ResourceSampler, SampleError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use warden_api::{PluginDescriptor, ResourceSample};
use wasmtime::*;

/// Errors that can occur in a loader
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Failed to read module {path}: {source}")]
    ReadModule {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Module compilation failed: {0}")]
    ModuleCompilation(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("{function} returned error code {code}")]
    Returned { function: &'static str, code: i32 },

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    #[error("Plugin not loaded: {0}")]
    NotLoaded(String),

    #[error("Plugin already loaded: {0}")]
    AlreadyLoaded(String),

    #[error("{0}")]
    Failed(String),
}

/// What a successful load produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadOutcome {
    pub symbol_count: usize,
    pub resource_count: usize,
}

/// Loads and drives units of plugin code.
///
/// `start`, `stop` and `unload` return `false` when the plugin declined the
/// action without an error.
#[async_trait]
pub trait Loader: Send + Sync {
    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        module_path: &Path,
    ) -> Result<LoadOutcome, LoaderError>;

    async fn initialize(&self, plugin_id: &str) -> Result<(), LoaderError>;

    async fn start(&self, plugin_id: &str) -> Result<bool, LoaderError>;

    async fn stop(&self, plugin_id: &str) -> Result<bool, LoaderError>;

    async fn unload(&self, plugin_id: &str) -> Result<bool, LoaderError>;
}

// ============================================================================
// Wasm loader
// ============================================================================

/// Optional lifecycle exports, each `() -> i32` with `0` meaning success
pub const INIT_EXPORT: &str = "plugin_init";
pub const START_EXPORT: &str = "plugin_start";
pub const STOP_EXPORT: &str = "plugin_stop";

/// Configuration for [`WasmLoader`]
#[derive(Debug, Clone)]
pub struct WasmLoaderConfig {
    /// Fuel limit per exported call (CPU limit)
    pub fuel_limit: u64,

    /// Fuel that counts as 100% CPU between two samples
    pub fuel_budget_per_sample: u64,

    /// Maximum WASM stack size in bytes
    pub max_stack_size: usize,
}

impl Default for WasmLoaderConfig {
    fn default() -> Self {
        Self {
            fuel_limit: 10_000_000,
            fuel_budget_per_sample: 100_000_000,
            max_stack_size: 1024 * 1024, // 1MB
        }
    }
}

/// wasmtime-backed [`Loader`]
pub struct WasmLoader {
    engine: Engine,
    config: WasmLoaderConfig,
    plugins: Mutex<HashMap<String, Arc<Mutex<WasmPlugin>>>>,
}

struct WasmPlugin {
    store: Store<()>,
    instance: Instance,
    memory: Option<Memory>,
    started: bool,
    /// Total fuel burned by exported calls
    fuel_consumed: u64,
    /// `fuel_consumed` at the previous sample
    fuel_mark: u64,
}

impl WasmLoader {
    /// Create a new loader
    pub fn new(config: WasmLoaderConfig) -> Result<Self, LoaderError> {
        let mut engine_config = Config::new();
        engine_config.consume_fuel(true);
        engine_config.max_wasm_stack(config.max_stack_size);
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config).map_err(LoaderError::EngineCreation)?;

        Ok(Self {
            engine,
            config,
            plugins: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        self.plugins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(plugin_id)
    }

    fn plugin(&self, plugin_id: &str) -> Result<Arc<Mutex<WasmPlugin>>, LoaderError> {
        self.plugins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| LoaderError::NotLoaded(plugin_id.to_string()))
    }

    /// Run `f` against a plugin on the blocking pool
    async fn with_plugin<T, F>(&self, plugin_id: &str, f: F) -> Result<T, LoaderError>
    where
        T: Send + 'static,
        F: FnOnce(&mut WasmPlugin) -> Result<T, LoaderError> + Send + 'static,
    {
        let plugin = self.plugin(plugin_id)?;
        tokio::task::spawn_blocking(move || {
            let mut guard = plugin.lock().unwrap_or_else(|e| e.into_inner());
            f(&mut guard)
        })
        .await
        .map_err(|e| LoaderError::Failed(format!("plugin task failed: {e}")))?
    }

    /// Call a lifecycle export if the module has one
    fn call_hook(
        plugin: &mut WasmPlugin,
        function: &'static str,
        fuel_limit: u64,
    ) -> Result<(), LoaderError> {
        let Some(func) = plugin.instance.get_func(&mut plugin.store, function) else {
            return Ok(());
        };
        let typed = func
            .typed::<(), i32>(&plugin.store)
            .map_err(|e| LoaderError::FunctionCall { function, source: e })?;

        plugin
            .store
            .set_fuel(fuel_limit)
            .map_err(LoaderError::EngineCreation)?;
        let result = typed.call(&mut plugin.store, ());
        let remaining = plugin.store.get_fuel().unwrap_or(0);
        plugin.fuel_consumed = plugin
            .fuel_consumed
            .saturating_add(fuel_limit.saturating_sub(remaining));

        let code = result.map_err(|e| {
            if e.downcast_ref::<Trap>() == Some(&Trap::OutOfFuel) {
                LoaderError::FuelExhausted
            } else {
                LoaderError::FunctionCall { function, source: e }
            }
        })?;
        if code != 0 {
            return Err(LoaderError::Returned { function, code });
        }
        Ok(())
    }
}

#[async_trait]
impl Loader for WasmLoader {
    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        module_path: &Path,
    ) -> Result<LoadOutcome, LoaderError> {
        let plugin_id = descriptor.plugin_id.clone();
        if self.is_loaded(&plugin_id) {
            return Err(LoaderError::AlreadyLoaded(plugin_id));
        }

        let path = if module_path.is_dir() {
            module_path.join(&descriptor.main_entry)
        } else {
            module_path.to_path_buf()
        };
        let wasm_bytes = tokio::fs::read(&path)
            .await
            .map_err(|source| LoaderError::ReadModule {
                path: path.clone(),
                source,
            })?;

        let engine = self.engine.clone();
        let fuel_limit = self.config.fuel_limit;
        let (plugin, outcome) = tokio::task::spawn_blocking(move || {
            // 1. Compile module
            let module =
                Module::new(&engine, &wasm_bytes).map_err(LoaderError::ModuleCompilation)?;

            let mut outcome = LoadOutcome::default();
            for export in module.exports() {
                match export.ty() {
                    ExternType::Func(_) => outcome.symbol_count += 1,
                    _ => outcome.resource_count += 1,
                }
            }

            // 2. Create store with fuel limit (no host imports)
            let mut store = Store::new(&engine, ());
            store
                .set_fuel(fuel_limit)
                .map_err(LoaderError::EngineCreation)?;
            let linker = Linker::new(&engine);

            // 3. Instantiate (runs the start section, if any)
            let instance = linker
                .instantiate(&mut store, &module)
                .map_err(LoaderError::Instantiation)?;
            let remaining = store.get_fuel().unwrap_or(0);
            let memory = instance.get_memory(&mut store, "memory");

            Ok::<_, LoaderError>((
                WasmPlugin {
                    store,
                    instance,
                    memory,
                    started: false,
                    fuel_consumed: fuel_limit.saturating_sub(remaining),
                    fuel_mark: 0,
                },
                outcome,
            ))
        })
        .await
        .map_err(|e| LoaderError::Failed(format!("compile task failed: {e}")))??;

        let mut plugins = self.plugins.lock().unwrap_or_else(|e| e.into_inner());
        if plugins.contains_key(&plugin_id) {
            return Err(LoaderError::AlreadyLoaded(plugin_id));
        }
        plugins.insert(plugin_id.clone(), Arc::new(Mutex::new(plugin)));

        tracing::debug!(
            plugin = %plugin_id,
            path = %path.display(),
            symbols = outcome.symbol_count,
            resources = outcome.resource_count,
            "Wasm module instantiated"
        );
        Ok(outcome)
    }

    async fn initialize(&self, plugin_id: &str) -> Result<(), LoaderError> {
        let fuel = self.config.fuel_limit;
        self.with_plugin(plugin_id, move |p| Self::call_hook(p, INIT_EXPORT, fuel))
            .await
    }

    async fn start(&self, plugin_id: &str) -> Result<bool, LoaderError> {
        let fuel = self.config.fuel_limit;
        self.with_plugin(plugin_id, move |p| {
            Self::call_hook(p, START_EXPORT, fuel)?;
            p.started = true;
            Ok(true)
        })
        .await
    }

    async fn stop(&self, plugin_id: &str) -> Result<bool, LoaderError> {
        let fuel = self.config.fuel_limit;
        self.with_plugin(plugin_id, move |p| {
            if p.started {
                Self::call_hook(p, STOP_EXPORT, fuel)?;
                p.started = false;
            }
            Ok(true)
        })
        .await
    }

    async fn unload(&self, plugin_id: &str) -> Result<bool, LoaderError> {
        let removed = self
            .plugins
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(plugin_id);
        Ok(removed.is_some())
    }
}

#[async_trait]
impl ResourceSampler for WasmLoader {
    async fn sample(&self, plugin_id: &str) -> Result<ResourceSample, SampleError> {
        let budget = self.config.fuel_budget_per_sample.max(1);
        self.with_plugin(plugin_id, move |p| {
            let memory_bytes = p.memory.map(|m| m.data_size(&p.store)).unwrap_or(0);
            let burned = p.fuel_consumed.saturating_sub(p.fuel_mark);
            p.fuel_mark = p.fuel_consumed;

            Ok(ResourceSample {
                cpu_percent: (burned as f64 / budget as f64 * 100.0).min(100.0),
                memory_mb: memory_bytes as f64 / (1024.0 * 1024.0),
                thread_count: u32::from(p.started),
                fd_count: 0,
                net_conn_count: 0,
            })
        })
        .await
        .map_err(|e| match e {
            LoaderError::NotLoaded(id) => SampleError::Unknown(id),
            other => SampleError::Failed(other.to_string()),
        })
    }
}

impl std::fmt::Debug for WasmLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmLoader")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
