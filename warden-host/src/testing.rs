//! In-memory doubles for the runtime's collaborator traits
//!
//! Used by this crate's tests and by embedders that want to exercise the
//! coordinator without wasm modules or a filesystem.

use crate::health::{ResourceSampler, SampleError};
use crate::installer::{validate_descriptor, InstallError, InstalledPackage, Installer};
use crate::loader::{LoadOutcome, Loader, LoaderError};
use crate::persistence::{PersistenceError, PersistenceStore};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use warden_api::{PluginDescriptor, PluginRecord, ResourceSample};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Loader
// ============================================================================

/// A call made on a [`ScriptedLoader`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoaderCall {
    Load,
    Initialize,
    Start,
    Stop,
    Unload,
}

impl fmt::Display for LoaderCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Load => "load",
            Self::Initialize => "initialize",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Unload => "unload",
        };
        f.write_str(s)
    }
}

enum Behavior {
    Proceed,
    Fail,
    Hang,
    Refuse,
}

#[derive(Default)]
struct Script {
    calls: Vec<(String, LoaderCall)>,
    failures: HashSet<(String, LoaderCall)>,
    hangs: HashSet<(String, LoaderCall)>,
    refusals: HashSet<(String, LoaderCall)>,
    loaded: HashSet<String>,
}

/// Loader whose behavior is scripted per plugin and call.
///
/// Unscripted calls succeed. Every call is logged, including ones that fail
/// or hang.
pub struct ScriptedLoader {
    script: Mutex<Script>,
    outcome: LoadOutcome,
}

impl Default for ScriptedLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::with_outcome(LoadOutcome {
            symbol_count: 3,
            resource_count: 1,
        })
    }

    pub fn with_outcome(outcome: LoadOutcome) -> Self {
        Self {
            script: Mutex::default(),
            outcome,
        }
    }

    /// Make `call` on `plugin_id` return an error
    pub fn fail_on(&self, plugin_id: &str, call: LoaderCall) {
        lock(&self.script).failures.insert((plugin_id.into(), call));
    }

    /// Make `call` on `plugin_id` never complete
    pub fn hang_on(&self, plugin_id: &str, call: LoaderCall) {
        lock(&self.script).hangs.insert((plugin_id.into(), call));
    }

    /// Make `call` on `plugin_id` return `false`
    pub fn refuse(&self, plugin_id: &str, call: LoaderCall) {
        lock(&self.script).refusals.insert((plugin_id.into(), call));
    }

    /// Drop every scripted behavior for `plugin_id`
    pub fn heal(&self, plugin_id: &str) {
        let mut script = lock(&self.script);
        script.failures.retain(|(id, _)| id != plugin_id);
        script.hangs.retain(|(id, _)| id != plugin_id);
        script.refusals.retain(|(id, _)| id != plugin_id);
    }

    pub fn calls_for(&self, plugin_id: &str) -> Vec<LoaderCall> {
        lock(&self.script)
            .calls
            .iter()
            .filter(|(id, _)| id == plugin_id)
            .map(|(_, call)| *call)
            .collect()
    }

    pub fn is_loaded(&self, plugin_id: &str) -> bool {
        lock(&self.script).loaded.contains(plugin_id)
    }

    fn begin(&self, plugin_id: &str, call: LoaderCall) -> Behavior {
        let mut script = lock(&self.script);
        script.calls.push((plugin_id.to_string(), call));
        let key = (plugin_id.to_string(), call);
        if script.hangs.contains(&key) {
            Behavior::Hang
        } else if script.failures.contains(&key) {
            Behavior::Fail
        } else if script.refusals.contains(&key) {
            Behavior::Refuse
        } else {
            Behavior::Proceed
        }
    }

    /// Run the scripted part of a call; `Ok(None)` means carry on normally
    async fn script(&self, plugin_id: &str, call: LoaderCall) -> Result<Option<bool>, LoaderError> {
        match self.begin(plugin_id, call) {
            Behavior::Proceed => Ok(None),
            Behavior::Refuse => Ok(Some(false)),
            Behavior::Fail => Err(LoaderError::Failed(format!("scripted {call} failure"))),
            Behavior::Hang => std::future::pending().await,
        }
    }

    fn require_loaded(&self, plugin_id: &str) -> Result<(), LoaderError> {
        if self.is_loaded(plugin_id) {
            Ok(())
        } else {
            Err(LoaderError::NotLoaded(plugin_id.to_string()))
        }
    }

    async fn hook(&self, plugin_id: &str, call: LoaderCall) -> Result<bool, LoaderError> {
        if let Some(answer) = self.script(plugin_id, call).await? {
            return Ok(answer);
        }
        self.require_loaded(plugin_id)?;
        Ok(true)
    }
}

#[async_trait]
impl Loader for ScriptedLoader {
    async fn load(
        &self,
        descriptor: &PluginDescriptor,
        _module_path: &Path,
    ) -> Result<LoadOutcome, LoaderError> {
        let id = descriptor.plugin_id.as_str();
        if self.script(id, LoaderCall::Load).await? == Some(false) {
            return Err(LoaderError::Failed(format!("{id} refused to load")));
        }
        if !lock(&self.script).loaded.insert(id.to_string()) {
            return Err(LoaderError::AlreadyLoaded(id.to_string()));
        }
        Ok(self.outcome)
    }

    async fn initialize(&self, plugin_id: &str) -> Result<(), LoaderError> {
        if !self.hook(plugin_id, LoaderCall::Initialize).await? {
            return Err(LoaderError::Failed(format!("{plugin_id} refused to initialize")));
        }
        Ok(())
    }

    async fn start(&self, plugin_id: &str) -> Result<bool, LoaderError> {
        self.hook(plugin_id, LoaderCall::Start).await
    }

    async fn stop(&self, plugin_id: &str) -> Result<bool, LoaderError> {
        self.hook(plugin_id, LoaderCall::Stop).await
    }

    async fn unload(&self, plugin_id: &str) -> Result<bool, LoaderError> {
        if let Some(answer) = self.script(plugin_id, LoaderCall::Unload).await? {
            return Ok(answer);
        }
        Ok(lock(&self.script).loaded.remove(plugin_id))
    }
}

impl fmt::Debug for ScriptedLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let script = lock(&self.script);
        f.debug_struct("ScriptedLoader")
            .field("calls", &script.calls.len())
            .field("loaded", &script.loaded)
            .finish()
    }
}

// ============================================================================
// Installer
// ============================================================================

#[derive(Default)]
struct Packages {
    available: HashMap<PathBuf, PluginDescriptor>,
    installed: HashMap<String, InstalledPackage>,
    failing_upgrades: HashSet<String>,
}

/// Installer over an in-memory set of packages keyed by path
#[derive(Default)]
pub struct MemoryInstaller {
    packages: Mutex<Packages>,
}

impl MemoryInstaller {
    const ROOT: &'static str = "/memory/installed";

    pub fn new() -> Self {
        Self::default()
    }

    /// Make a package available at `path`
    pub fn add_package(&self, path: impl Into<PathBuf>, descriptor: PluginDescriptor) {
        lock(&self.packages)
            .available
            .insert(path.into(), descriptor);
    }

    /// Make every upgrade of `plugin_id` fail
    pub fn fail_upgrades(&self, plugin_id: &str) {
        lock(&self.packages)
            .failing_upgrades
            .insert(plugin_id.to_string());
    }

    pub fn installed(&self, plugin_id: &str) -> Option<InstalledPackage> {
        lock(&self.packages).installed.get(plugin_id).cloned()
    }

    fn read(&self, package: &Path) -> Result<PluginDescriptor, InstallError> {
        let descriptor = lock(&self.packages)
            .available
            .get(package)
            .cloned()
            .ok_or_else(|| InstallError::PackageNotFound(package.to_path_buf()))?;
        validate_descriptor(&descriptor)?;
        Ok(descriptor)
    }

    fn placed(descriptor: PluginDescriptor) -> InstalledPackage {
        let module_path = Path::new(Self::ROOT).join(&descriptor.plugin_id);
        InstalledPackage {
            descriptor,
            module_path,
        }
    }
}

#[async_trait]
impl Installer for MemoryInstaller {
    async fn validate(&self, package: &Path) -> Result<PluginDescriptor, InstallError> {
        self.read(package)
    }

    async fn install(&self, package: &Path) -> Result<InstalledPackage, InstallError> {
        let installed = Self::placed(self.read(package)?);
        lock(&self.packages)
            .installed
            .insert(installed.descriptor.plugin_id.clone(), installed.clone());
        Ok(installed)
    }

    async fn uninstall(&self, plugin_id: &str) -> Result<(), InstallError> {
        lock(&self.packages)
            .installed
            .remove(plugin_id)
            .map(|_| ())
            .ok_or_else(|| InstallError::NotInstalled(plugin_id.to_string()))
    }

    async fn upgrade(
        &self,
        plugin_id: &str,
        package: &Path,
    ) -> Result<InstalledPackage, InstallError> {
        let descriptor = self.read(package)?;
        let mut packages = lock(&self.packages);
        if !packages.installed.contains_key(plugin_id) {
            return Err(InstallError::NotInstalled(plugin_id.to_string()));
        }
        if descriptor.plugin_id != plugin_id {
            return Err(InstallError::IdentityMismatch {
                expected: plugin_id.to_string(),
                found: descriptor.plugin_id,
            });
        }
        if packages.failing_upgrades.contains(plugin_id) {
            return Err(InstallError::Task(format!("scripted upgrade failure for {plugin_id}")));
        }
        let installed = Self::placed(descriptor);
        packages
            .installed
            .insert(plugin_id.to_string(), installed.clone());
        Ok(installed)
    }
}

impl fmt::Debug for MemoryInstaller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let packages = lock(&self.packages);
        f.debug_struct("MemoryInstaller")
            .field("available", &packages.available.len())
            .field("installed", &packages.installed.len())
            .finish()
    }
}

// ============================================================================
// Sampler
// ============================================================================

#[derive(Default)]
struct Samples {
    values: HashMap<String, ResourceSample>,
    hanging: HashSet<String>,
    failing: HashSet<String>,
}

/// Sampler that returns the last sample `set` for a plugin, or an idle one
#[derive(Default)]
pub struct FixedSampler {
    samples: Mutex<Samples>,
}

impl FixedSampler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, plugin_id: &str, sample: ResourceSample) {
        let mut samples = lock(&self.samples);
        samples.hanging.remove(plugin_id);
        samples.failing.remove(plugin_id);
        samples.values.insert(plugin_id.to_string(), sample);
    }

    /// Make samples for `plugin_id` never complete
    pub fn hang(&self, plugin_id: &str) {
        lock(&self.samples).hanging.insert(plugin_id.to_string());
    }

    /// Make samples for `plugin_id` fail
    pub fn fail(&self, plugin_id: &str) {
        lock(&self.samples).failing.insert(plugin_id.to_string());
    }
}

#[async_trait]
impl ResourceSampler for FixedSampler {
    async fn sample(&self, plugin_id: &str) -> Result<ResourceSample, SampleError> {
        let result = {
            let samples = lock(&self.samples);
            if samples.hanging.contains(plugin_id) {
                None
            } else if samples.failing.contains(plugin_id) {
                Some(Err(SampleError::Failed(format!("probe error for {plugin_id}"))))
            } else {
                Some(Ok(samples.values.get(plugin_id).copied().unwrap_or_default()))
            }
        };
        match result {
            Some(result) => result,
            None => std::future::pending().await,
        }
    }
}

// ============================================================================
// Persistence
// ============================================================================

/// Store that rejects every operation
#[derive(Debug, Default, Clone, Copy)]
pub struct FailingPersistence;

impl PersistenceStore for FailingPersistence {
    fn save_plugin_record(&self, record: &PluginRecord) -> Result<(), PersistenceError> {
        Err(PersistenceError::Unavailable(format!(
            "cannot save {}",
            record.plugin_id()
        )))
    }

    fn load_all_records(&self) -> Result<Vec<PluginRecord>, PersistenceError> {
        Err(PersistenceError::Unavailable("cannot load".into()))
    }

    fn delete_record(&self, plugin_id: &str) -> Result<(), PersistenceError> {
        Err(PersistenceError::Unavailable(format!("cannot delete {plugin_id}")))
    }
}
