//! System coordinator
//!
//! The façade the outside world drives. It combines the installer, the
//! dependency resolver and the lifecycle handler into whole operations
//! (load, enable, disable, reload, upgrade, uninstall, startup scan and
//! shutdown), serializes them per plugin and records an [`OperationStatus`]
//! for each.

use crate::error::CoordinatorError;
use crate::events::EventBus;
use crate::installer::{discover_packages, InstallError, Installer};
use crate::lifecycle::LifecycleHandler;
use crate::locks::PluginLocks;
use crate::registry::{PluginRegistry, RegistryError};
use crate::resolver::{
    check_dependencies, dependents_of, resolve_load_order, DependencyScope, ResolveError,
};
use crate::rollout::RolloutTarget;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use warden_api::{
    kinds, topics, EventEnvelope, EventPayload, OperationStatus, OperationType, PluginDescriptor,
    PluginRecord, PluginState,
};

const SOURCE: &str = "coordinator";

/// Outcome of a [`SystemCoordinator::startup_scan`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Package directories found
    pub discovered: usize,
    /// Plugins loaded, in load order
    pub loaded: Vec<String>,
    /// Loaded plugins that were also started
    pub started: Vec<String>,
    /// Plugins already registered and left alone
    pub skipped: Vec<String>,
    /// Plugin id, or package path when the id is unknown, to failure message
    pub failed: BTreeMap<String, String>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

struct CoordinatorInner {
    lifecycle: LifecycleHandler,
    installer: Arc<dyn Installer>,
    events: EventBus,
    locks: PluginLocks,
    operations: Mutex<HashMap<String, OperationStatus>>,
}

/// Façade over the plugin runtime
#[derive(Clone)]
pub struct SystemCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl SystemCoordinator {
    /// `locks` must be shared with every other component that changes
    /// plugin state, so that operations on one plugin stay totally ordered.
    pub fn new(
        lifecycle: LifecycleHandler,
        installer: Arc<dyn Installer>,
        events: EventBus,
        locks: PluginLocks,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                lifecycle,
                installer,
                events,
                locks,
                operations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        self.inner.lifecycle.registry()
    }

    pub fn lifecycle(&self) -> &LifecycleHandler {
        &self.inner.lifecycle
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Install the package at `path` and load it.
    ///
    /// System plugins from trusted packages are started right away; every
    /// other plugin is left `LOADED` until enabled.
    pub async fn load_plugin(&self, path: &Path) -> Result<String, CoordinatorError> {
        let descriptor = match self.inner.installer.validate(path).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                let e = CoordinatorError::from(e);
                self.untracked_failure(&path.display().to_string(), OperationType::Load, &e);
                return Err(e);
            }
        };

        let plugin_id = descriptor.plugin_id.clone();
        let _guard = self.inner.locks.acquire(&plugin_id).await;
        self.track(&plugin_id, OperationType::Load, async {
            if let Some(state) = self.registry().state(&plugin_id).await {
                if state != PluginState::Unloaded {
                    return Err(RegistryError::AlreadyRegistered(plugin_id.clone()).into());
                }
            }
            self.install_and_load(path).await?;
            if descriptor.is_auto_start() {
                self.bring_up(&plugin_id).await?;
                self.registry().set_enabled(&plugin_id, true).await?;
            }
            Ok(plugin_id.clone())
        })
        .await
    }

    /// Stop and unload a plugin.
    ///
    /// Returns `Ok(false)` when the plugin is unknown or already unloaded;
    /// the no-op is still recorded as a completed operation.
    /// Fails with `DependencyBlocked` while another live plugin requires it.
    pub async fn unload_plugin(&self, plugin_id: &str) -> Result<bool, CoordinatorError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        self.track(plugin_id, OperationType::Unload, async {
            match self.registry().state(plugin_id).await {
                None | Some(PluginState::Unloaded) => return Ok(false),
                Some(_) => {}
            }
            self.ensure_not_required(plugin_id).await?;
            self.inner.lifecycle.unload(plugin_id).await?;
            Ok(true)
        })
        .await
    }

    /// Bring a plugin to `STARTED` from wherever it is and mark it enabled.
    ///
    /// Enabling a running plugin only sets the flag.
    pub async fn enable_plugin(&self, plugin_id: &str) -> Result<(), CoordinatorError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        self.track(plugin_id, OperationType::Enable, async {
            self.bring_up(plugin_id).await?;
            self.registry().set_enabled(plugin_id, true).await?;
            Ok(())
        })
        .await
    }

    /// Stop a plugin and mark it disabled.
    ///
    /// A halted plugin (`ERROR`, `ISOLATED`, `RESOURCE_LIMITED`) is moved to
    /// `STOPPED`.
    pub async fn disable_plugin(&self, plugin_id: &str) -> Result<(), CoordinatorError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        self.track(plugin_id, OperationType::Disable, async {
            let record = self.record(plugin_id).await?;
            match record.state {
                PluginState::Started => self.inner.lifecycle.stop(plugin_id).await?,
                s if s.is_halted() => self.inner.lifecycle.recover(plugin_id).await?,
                _ => {}
            }
            self.registry().set_enabled(plugin_id, false).await?;
            Ok(())
        })
        .await
    }

    /// Unload and load again from the same package, keeping the `enabled`
    /// flag. A disabled plugin stays disabled.
    pub async fn reload_plugin(&self, plugin_id: &str) -> Result<(), CoordinatorError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        self.track(plugin_id, OperationType::Reload, async {
            let record = self.record(plugin_id).await?;
            let package = record
                .source_path
                .clone()
                .unwrap_or_else(|| record.module_path.clone());

            let descriptor = self.inner.installer.validate(&package).await?;
            if descriptor.plugin_id != plugin_id {
                return Err(InstallError::IdentityMismatch {
                    expected: plugin_id.to_string(),
                    found: descriptor.plugin_id,
                }
                .into());
            }
            tracing::info!(
                plugin = %plugin_id,
                package = %package.display(),
                manifest_changed = descriptor.fingerprint() != record.descriptor.fingerprint(),
                "Reloading plugin"
            );

            if record.state != PluginState::Unloaded {
                self.inner.lifecycle.unload(plugin_id).await?;
            }
            self.install_and_load(&package).await?;
            self.reapply_enabled(plugin_id, record.enabled).await
        })
        .await
    }

    /// Replace the installed package with the one at `package` and load the
    /// new version, keeping the `enabled` flag. Returns the new version.
    ///
    /// A failed install leaves the running version untouched.
    pub async fn upgrade_plugin(
        &self,
        plugin_id: &str,
        package: &Path,
    ) -> Result<String, CoordinatorError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        self.track(plugin_id, OperationType::Upgrade, async {
            let record = self.record(plugin_id).await?;
            let installed = self.inner.installer.upgrade(plugin_id, package).await?;
            let version = installed.descriptor.version.clone();

            if record.state != PluginState::Unloaded {
                self.inner.lifecycle.unload(plugin_id).await?;
            }
            self.inner
                .lifecycle
                .load(
                    installed.descriptor,
                    installed.module_path,
                    Some(package.to_path_buf()),
                )
                .await?;
            self.reapply_enabled(plugin_id, record.enabled).await?;

            tracing::info!(
                plugin = %plugin_id,
                from = %record.version(),
                to = %version,
                "Plugin upgraded"
            );
            Ok(version)
        })
        .await
    }

    /// Unload a plugin, remove its installed files and forget it
    pub async fn uninstall_plugin(&self, plugin_id: &str) -> Result<(), CoordinatorError> {
        let guard = self.inner.locks.acquire(plugin_id).await;
        self.track(plugin_id, OperationType::Uninstall, async {
            let record = self.record(plugin_id).await?;
            self.ensure_not_required(plugin_id).await?;
            if record.state != PluginState::Unloaded {
                self.inner.lifecycle.unload(plugin_id).await?;
            }
            match self.inner.installer.uninstall(plugin_id).await {
                Ok(()) => {}
                Err(InstallError::NotInstalled(_)) => {
                    tracing::warn!(plugin = %plugin_id, "No installed files to remove");
                }
                Err(e) => return Err(e.into()),
            }
            self.registry().unregister(plugin_id).await?;
            Ok(())
        })
        .await?;
        drop(guard);
        self.inner.locks.forget(plugin_id);
        Ok(())
    }

    /// Install and load every package found in `dirs`, in dependency order.
    ///
    /// Failures affect only the plugin concerned and its dependents; they are
    /// collected in the report instead of aborting the scan. Each loaded
    /// plugin gets its persisted `enabled` flag back; plugins with no
    /// persisted record follow the system + trusted auto-start rule.
    pub async fn startup_scan(&self, dirs: &[PathBuf]) -> ScanReport {
        let mut report = ScanReport::default();
        let persisted: HashMap<String, bool> = self
            .registry()
            .persisted_records()
            .into_iter()
            .map(|r| (r.plugin_id().to_string(), r.enabled))
            .collect();

        let mut packages: BTreeMap<String, (PathBuf, PluginDescriptor)> = BTreeMap::new();
        for dir in dirs {
            let found = match discover_packages(dir) {
                Ok(found) => found,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to scan plugin directory");
                    report.failed.insert(dir.display().to_string(), e.to_string());
                    continue;
                }
            };
            report.discovered += found.len();

            for package in found {
                match self.inner.installer.validate(&package).await {
                    Ok(descriptor) => {
                        let id = descriptor.plugin_id.clone();
                        if packages.contains_key(&id) {
                            report.failed.insert(
                                package.display().to_string(),
                                format!("duplicate plugin id '{id}'"),
                            );
                        } else if matches!(self.registry().state(&id).await, Some(s) if s != PluginState::Unloaded)
                        {
                            report.skipped.push(id);
                        } else {
                            packages.insert(id, (package, descriptor));
                        }
                    }
                    Err(e) => {
                        report
                            .failed
                            .insert(package.display().to_string(), e.to_string());
                    }
                }
            }
        }

        let available: HashMap<String, String> = self
            .registry()
            .all_plugins()
            .await
            .into_iter()
            .filter(|r| r.state != PluginState::Unloaded)
            .map(|r| (r.plugin_id().to_string(), r.version().to_string()))
            .collect();

        // Cycle members are reported and dropped; the rest is resolved again
        let mut candidates: Vec<PluginDescriptor> =
            packages.values().map(|(_, d)| d.clone()).collect();
        let plan = loop {
            match resolve_load_order(&candidates, &available) {
                Ok(plan) => break plan,
                Err(ResolveError::Cycle { members }) => {
                    tracing::error!(members = ?members, "Dependency cycle in plugin packages");
                    let message = format!("dependency cycle between: {}", members.join(", "));
                    for member in &members {
                        report.failed.insert(member.clone(), message.clone());
                    }
                    candidates.retain(|d| !members.contains(&d.plugin_id));
                }
            }
        };
        for (id, failure) in &plan.failed {
            tracing::warn!(plugin = %id, reason = %failure, "Plugin excluded from startup");
            report.failed.insert(id.clone(), failure.to_string());
        }

        for id in plan.order {
            let Some((package, descriptor)) = packages.get(&id) else {
                continue;
            };
            let enable = persisted
                .get(&id)
                .copied()
                .unwrap_or_else(|| descriptor.is_auto_start());

            let _guard = self.inner.locks.acquire(&id).await;
            let result = self
                .track(&id, OperationType::Load, async {
                    self.install_and_load(package).await?;
                    if enable {
                        self.bring_up(&id).await?;
                        self.registry().set_enabled(&id, true).await?;
                        return Ok(true);
                    }
                    Ok(false)
                })
                .await;

            match result {
                Ok(started) => {
                    if started {
                        report.started.push(id.clone());
                    }
                    report.loaded.push(id);
                }
                Err(e) => {
                    if self.registry().state(&id).await.is_some() {
                        report.loaded.push(id.clone());
                    }
                    report.failed.insert(id, e.to_string());
                }
            }
        }

        tracing::info!(
            discovered = report.discovered,
            loaded = report.loaded.len(),
            started = report.started.len(),
            failed = report.failed.len(),
            "Startup scan finished"
        );
        report
    }

    /// Two-phase shutdown: announce `system/shutdown`, wait out the grace
    /// period, then unload every remaining plugin, dependents first.
    ///
    /// Returns the ids unloaded, in order.
    pub async fn shutdown(&self, grace: Duration) -> Vec<String> {
        tracing::info!(grace = ?grace, "Shutting down plugins");
        self.inner.events.publish(
            EventEnvelope::new(topics::SYSTEM, kinds::SHUTDOWN, SOURCE).payload(
                EventPayload::Shutdown {
                    grace_period_ms: u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                },
            ),
        );
        if !grace.is_zero() {
            tokio::time::sleep(grace).await;
        }

        let live: Vec<PluginDescriptor> = self
            .registry()
            .all_plugins()
            .await
            .into_iter()
            .filter(|r| r.state != PluginState::Unloaded)
            .map(|r| r.descriptor)
            .collect();

        let mut unloaded = Vec::new();
        for id in shutdown_order(&live) {
            let _guard = self.inner.locks.acquire(&id).await;
            match self.inner.lifecycle.unload(&id).await {
                Ok(()) => unloaded.push(id),
                Err(e) => tracing::warn!(plugin = %id, error = %e, "Failed to unload during shutdown"),
            }
        }
        unloaded
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn operation_status(&self, plugin_id: &str) -> Option<OperationStatus> {
        self.operations().get(plugin_id).cloned()
    }

    pub fn operation_statuses(&self) -> Vec<OperationStatus> {
        let mut statuses: Vec<_> = self.operations().values().cloned().collect();
        statuses.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        statuses
    }

    pub async fn plugin(&self, plugin_id: &str) -> Option<PluginRecord> {
        self.registry().get(plugin_id).await
    }

    pub async fn plugins(&self) -> Vec<PluginRecord> {
        self.registry().all_plugins().await
    }

    /// Plugin installed from the package at `path`
    pub async fn plugin_for_source(&self, path: &Path) -> Option<String> {
        self.registry().find_by_source(path).await
    }

    // ========================================================================
    // Internals
    // ========================================================================

    async fn record(&self, plugin_id: &str) -> Result<PluginRecord, CoordinatorError> {
        self.registry()
            .get(plugin_id)
            .await
            .ok_or_else(|| CoordinatorError::NotFound(plugin_id.to_string()))
    }

    async fn install_and_load(&self, package: &Path) -> Result<(), CoordinatorError> {
        let installed = self.inner.installer.install(package).await?;
        self.inner
            .lifecycle
            .load(
                installed.descriptor,
                installed.module_path,
                Some(package.to_path_buf()),
            )
            .await?;
        Ok(())
    }

    /// Run the actions that take the plugin from its current state to
    /// `STARTED`, after checking its dependencies are running.
    async fn bring_up(&self, plugin_id: &str) -> Result<(), CoordinatorError> {
        let record = self.record(plugin_id).await?;
        let state = record.state;
        match state {
            PluginState::Started => return Ok(()),
            PluginState::Created
            | PluginState::Loaded
            | PluginState::Initialized
            | PluginState::Stopped => {}
            _ => {
                return Err(CoordinatorError::InvalidStateForEnable {
                    plugin: plugin_id.to_string(),
                    state,
                })
            }
        }

        let registered = self.registry().all_plugins().await;
        check_dependencies(&record.descriptor, &registered).map_err(|source| {
            CoordinatorError::Dependency {
                plugin: plugin_id.to_string(),
                source,
            }
        })?;

        let lifecycle = &self.inner.lifecycle;
        if state == PluginState::Created {
            lifecycle.load_registered(plugin_id).await?;
        }
        if matches!(state, PluginState::Created | PluginState::Loaded) {
            lifecycle.initialize(plugin_id).await?;
        }
        lifecycle.start(plugin_id).await?;
        Ok(())
    }

    async fn reapply_enabled(&self, plugin_id: &str, enabled: bool) -> Result<(), CoordinatorError> {
        if enabled {
            self.bring_up(plugin_id).await?;
        }
        self.registry().set_enabled(plugin_id, enabled).await?;
        Ok(())
    }

    async fn ensure_not_required(&self, plugin_id: &str) -> Result<(), CoordinatorError> {
        let live: Vec<PluginDescriptor> = self
            .registry()
            .all_plugins()
            .await
            .into_iter()
            .filter(|r| r.state != PluginState::Unloaded && r.plugin_id() != plugin_id)
            .map(|r| r.descriptor)
            .collect();
        let dependents = dependents_of(plugin_id, &live, DependencyScope::Required);
        if dependents.is_empty() {
            Ok(())
        } else {
            Err(CoordinatorError::DependencyBlocked {
                plugin: plugin_id.to_string(),
                dependents: dependents.into_iter().collect(),
            })
        }
    }

    fn operations(&self) -> MutexGuard<'_, HashMap<String, OperationStatus>> {
        self.inner.operations.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `operation` with an [`OperationStatus`] kept for `plugin_id` and
    /// publish its outcome
    async fn track<T>(
        &self,
        plugin_id: &str,
        op: OperationType,
        operation: impl Future<Output = Result<T, CoordinatorError>>,
    ) -> Result<T, CoordinatorError> {
        let mut status = OperationStatus::begin(plugin_id, op);
        self.operations()
            .insert(plugin_id.to_string(), status.clone());

        let result = operation.await;
        match &result {
            Ok(_) => {
                tracing::info!(plugin = %plugin_id, operation = %op, "Operation completed");
                status.succeed(format!("{op} succeeded"));
            }
            Err(e) => {
                tracing::error!(plugin = %plugin_id, operation = %op, kind = %e.kind(), error = %e, "Operation failed");
                status.fail(e.to_string());
            }
        }
        self.finish_operation(status);
        result
    }

    fn untracked_failure(&self, key: &str, op: OperationType, error: &CoordinatorError) {
        tracing::error!(target_path = %key, operation = %op, error = %error, "Operation failed");
        let mut status = OperationStatus::begin(key, op);
        status.fail(error.to_string());
        self.finish_operation(status);
    }

    fn finish_operation(&self, status: OperationStatus) {
        let success = status.success == Some(true);
        let kind = if success {
            kinds::OPERATION_COMPLETED
        } else {
            kinds::OPERATION_FAILED
        };
        let event = EventEnvelope::new(topics::PLUGIN, kind, SOURCE)
            .plugin(status.plugin_id.clone())
            .payload(EventPayload::Operation {
                operation: status.operation_type,
                success,
                message: status.message.clone(),
            });
        self.operations()
            .insert(status.plugin_id.clone(), status);
        self.inner.events.publish(event);
    }
}

/// Order in which to unload `plugins` so that no plugin goes before one
/// that depends on it. Members of a cycle go together, by id.
pub fn shutdown_order(plugins: &[PluginDescriptor]) -> Vec<String> {
    let mut remaining: BTreeMap<&str, &PluginDescriptor> = plugins
        .iter()
        .map(|d| (d.plugin_id.as_str(), d))
        .collect();
    let mut order = Vec::with_capacity(remaining.len());

    while !remaining.is_empty() {
        let leaves: BTreeSet<&str> = remaining
            .keys()
            .copied()
            .filter(|id| {
                dependents_of(id, remaining.values().copied(), DependencyScope::All)
                    .iter()
                    .all(|dependent| dependent == id)
            })
            .collect();
        let batch: Vec<&str> = if leaves.is_empty() {
            remaining.keys().copied().collect()
        } else {
            leaves.into_iter().collect()
        };
        for id in batch {
            remaining.remove(id);
            order.push(id.to_string());
        }
    }
    order
}

#[async_trait]
impl RolloutTarget for SystemCoordinator {
    async fn current_version(&self, plugin_id: &str) -> Option<String> {
        self.registry()
            .get(plugin_id)
            .await
            .filter(|r| r.state != PluginState::Unloaded)
            .map(|r| r.version().to_string())
    }

    async fn promote(
        &self,
        plugin_id: &str,
        version: &str,
        package: &Path,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let installed = self.upgrade_plugin(plugin_id, package).await?;
        if installed != version {
            return Err(format!(
                "package {} holds version {installed}, expected {version}",
                package.display()
            )
            .into());
        }
        Ok(())
    }

    async fn rollback(
        &self,
        plugin_id: &str,
        version: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let record = self.record(plugin_id).await?;
        if record.version() != version {
            return Err(format!(
                "plugin '{plugin_id}' runs {}, cannot roll back to {version}",
                record.version()
            )
            .into());
        }
        if record.enabled && record.state != PluginState::Started {
            self.enable_plugin(plugin_id).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SystemCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemCoordinator")
            .field("locks", &self.inner.locks)
            .finish_non_exhaustive()
    }
}
