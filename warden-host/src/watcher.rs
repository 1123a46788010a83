//! Plugin directory watcher
//!
//! Watches plugin directories for package changes and drives the
//! coordinator: a new package is loaded, a changed one reloaded, a removed
//! one unloaded.

use crate::coordinator::SystemCoordinator;
use crate::installer::MANIFEST_FILE;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// Configuration for the plugin watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Debounce duration for file events
    pub debounce: Duration,
    /// Whether to run a startup scan of the directories before watching
    pub load_existing: bool,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(500),
            load_existing: true,
        }
    }
}

/// Watcher over plugin directories
pub struct PluginWatcher {
    coordinator: SystemCoordinator,
    directories: Vec<PathBuf>,
    _watcher: RecommendedWatcher,
    shutdown_tx: mpsc::Sender<()>,
}

impl PluginWatcher {
    /// Start watching `directories`
    pub async fn new(
        coordinator: SystemCoordinator,
        directories: impl IntoIterator<Item = impl AsRef<Path>>,
        config: WatcherConfig,
    ) -> Result<Self, WatcherError> {
        let directories: Vec<PathBuf> = directories
            .into_iter()
            .map(|p| p.as_ref().to_path_buf())
            .collect();

        if config.load_existing {
            let existing: Vec<PathBuf> = directories.iter().filter(|d| d.is_dir()).cloned().collect();
            let report = coordinator.startup_scan(&existing).await;
            for (id, reason) in &report.failed {
                tracing::warn!(plugin = %id, reason = %reason, "Plugin failed to load at startup");
            }
        }

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            match res {
                Ok(event) => {
                    let _ = event_tx.blocking_send(event);
                }
                Err(e) => tracing::warn!(error = %e, "File watch error"),
            }
        })
        .map_err(WatcherError::WatcherInit)?;

        for dir in &directories {
            if dir.is_dir() {
                watcher
                    .watch(dir, RecursiveMode::Recursive)
                    .map_err(WatcherError::WatcherInit)?;
                tracing::info!(dir = %dir.display(), "Watching directory for plugins");
            } else {
                tracing::warn!(dir = %dir.display(), "Directory does not exist, skipping");
            }
        }

        let roots = directories.clone();
        let worker = coordinator.clone();
        let debounce = config.debounce;
        tokio::spawn(async move {
            let mut pending: Vec<PathBuf> = Vec::new();
            let mut deadline: Option<tokio::time::Instant> = None;

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Plugin watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        for path in event.paths {
                            if let Some(package) = package_root(&roots, &path) {
                                if !pending.contains(&package) {
                                    pending.push(package);
                                }
                                deadline = Some(tokio::time::Instant::now() + debounce);
                            }
                        }
                    }

                    _ = async {
                        match deadline {
                            Some(at) => tokio::time::sleep_until(at).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        for package in pending.drain(..) {
                            handle_package_change(&worker, &package).await;
                        }
                        deadline = None;
                    }
                }
            }
        });

        Ok(Self {
            coordinator,
            directories,
            _watcher: watcher,
            shutdown_tx,
        })
    }

    pub fn coordinator(&self) -> &SystemCoordinator {
        &self.coordinator
    }

    pub fn directories(&self) -> &[PathBuf] {
        &self.directories
    }

    /// Stop watching
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// Package directory (`<root>/<name>`) that `path` belongs to
fn package_root(roots: &[PathBuf], path: &Path) -> Option<PathBuf> {
    roots.iter().find_map(|root| {
        let rest = path.strip_prefix(root).ok()?;
        match rest.components().next()? {
            Component::Normal(name) => {
                let name = name.to_str()?;
                (!name.starts_with('.') && !name.ends_with(".bak")).then(|| root.join(name))
            }
            _ => None,
        }
    })
}

async fn handle_package_change(coordinator: &SystemCoordinator, package: &Path) {
    let known = coordinator.plugin_for_source(package).await;

    if package.join(MANIFEST_FILE).is_file() {
        let result = match &known {
            Some(id) => coordinator.reload_plugin(id).await.map(|()| id.clone()),
            None => coordinator.load_plugin(package).await,
        };
        match result {
            Ok(id) => {
                tracing::info!(plugin = %id, package = %package.display(), "Plugin package applied")
            }
            Err(e) => {
                tracing::warn!(package = %package.display(), error = %e, "Failed to apply plugin package")
            }
        }
    } else if let Some(id) = known {
        match coordinator.unload_plugin(&id).await {
            Ok(true) => {
                tracing::info!(plugin = %id, package = %package.display(), "Plugin unloaded (package removed)")
            }
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(plugin = %id, error = %e, "Failed to unload removed plugin")
            }
        }
    }
}

/// Errors that can occur during watching
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Failed to initialize watcher: {0}")]
    WatcherInit(#[source] notify::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::installer::DirectoryInstaller;
    use crate::lifecycle::LifecycleHandler;
    use crate::locks::PluginLocks;
    use crate::registry::PluginRegistry;
    use crate::testing::ScriptedLoader;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;
    use warden_api::PluginState;

    fn coordinator(install_root: &Path) -> SystemCoordinator {
        let bus = EventBus::new();
        let lifecycle = LifecycleHandler::new(
            PluginRegistry::new(bus.clone()),
            Arc::new(ScriptedLoader::new()),
            bus.clone(),
            Duration::from_secs(1),
        );
        SystemCoordinator::new(
            lifecycle,
            Arc::new(DirectoryInstaller::new(install_root)),
            bus,
            PluginLocks::new(),
        )
    }

    fn write_package(dir: &Path, id: &str) -> PathBuf {
        let pkg = dir.join(id);
        fs::create_dir_all(&pkg).unwrap();
        fs::write(pkg.join("main.wasm"), b"\0asm").unwrap();
        let manifest = serde_json::json!({
            "pluginId": id,
            "version": "1.0.0",
            "mainEntry": "main.wasm",
        });
        fs::write(pkg.join(MANIFEST_FILE), manifest.to_string()).unwrap();
        pkg
    }

    #[test]
    fn test_package_root() {
        let roots = vec![PathBuf::from("/plugins")];
        assert_eq!(
            package_root(&roots, Path::new("/plugins/auth/plugin.json")),
            Some(PathBuf::from("/plugins/auth"))
        );
        assert_eq!(
            package_root(&roots, Path::new("/plugins/auth")),
            Some(PathBuf::from("/plugins/auth"))
        );
        assert_eq!(package_root(&roots, Path::new("/plugins/auth.bak/x")), None);
        assert_eq!(package_root(&roots, Path::new("/other/auth")), None);
        assert_eq!(package_root(&roots, Path::new("/plugins")), None);
    }

    #[tokio::test]
    async fn test_watcher_loads_existing() {
        let plugins = TempDir::new().unwrap();
        let installed = TempDir::new().unwrap();
        write_package(plugins.path(), "hello");

        let coordinator = coordinator(installed.path());
        let _watcher = PluginWatcher::new(
            coordinator.clone(),
            vec![plugins.path()],
            WatcherConfig::default(),
        )
        .await
        .unwrap();

        let record = coordinator.plugin("hello").await.unwrap();
        assert_eq!(record.state, PluginState::Loaded);
    }

    #[tokio::test]
    async fn test_watcher_hot_load_and_unload() {
        let plugins = TempDir::new().unwrap();
        let installed = TempDir::new().unwrap();
        let coordinator = coordinator(installed.path());
        let watcher = PluginWatcher::new(
            coordinator.clone(),
            vec![plugins.path()],
            WatcherConfig {
                debounce: Duration::from_millis(100),
                load_existing: true,
            },
        )
        .await
        .unwrap();
        assert!(coordinator.plugin("hello").await.is_none());

        let pkg = write_package(plugins.path(), "hello");
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            coordinator.plugin("hello").await.map(|r| r.state),
            Some(PluginState::Loaded)
        );

        fs::remove_dir_all(&pkg).unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            coordinator.plugin("hello").await.map(|r| r.state),
            Some(PluginState::Unloaded)
        );

        watcher.shutdown().await;
    }
}
