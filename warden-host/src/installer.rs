//! Plugin packages and installation
//!
//! A package is a directory holding a `plugin.json` descriptor and the module
//! file named by its `mainEntry`. The [`Installer`] collaborator validates
//! packages and places them where the loader can find them;
//! [`DirectoryInstaller`] copies them under an install root.

use crate::version::{parse_requirement, parse_version};
use async_trait::async_trait;
use std::fs;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use warden_api::PluginDescriptor;

/// Descriptor file name inside a package
pub const MANIFEST_FILE: &str = "plugin.json";

const BACKUP_SUFFIX: &str = ".bak";

/// Errors that can occur while validating or installing packages
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Package not found: {0}")]
    PackageNotFound(PathBuf),

    #[error("Package {0} has no {MANIFEST_FILE}")]
    MissingManifest(PathBuf),

    #[error("Invalid manifest {path}: {source}")]
    InvalidManifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Entry '{entry}' not found in package {package}")]
    MissingEntry { package: PathBuf, entry: String },

    #[error("Plugin not installed: {0}")]
    NotInstalled(String),

    #[error("Package is for plugin '{found}', expected '{expected}'")]
    IdentityMismatch { expected: String, found: String },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Installer task failed: {0}")]
    Task(String),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> InstallError + '_ {
    move |source| InstallError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// An installed package
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPackage {
    pub descriptor: PluginDescriptor,
    /// Directory the loader resolves `mainEntry` against
    pub module_path: PathBuf,
}

/// Package validation and placement
#[async_trait]
pub trait Installer: Send + Sync {
    /// Parse and check a package without installing it
    async fn validate(&self, package: &Path) -> Result<PluginDescriptor, InstallError>;

    async fn is_valid(&self, package: &Path) -> bool {
        self.validate(package).await.is_ok()
    }

    async fn install(&self, package: &Path) -> Result<InstalledPackage, InstallError>;

    async fn uninstall(&self, plugin_id: &str) -> Result<(), InstallError>;

    /// Replace an installed plugin with `package`. On failure the previous
    /// installation is left in place.
    async fn upgrade(
        &self,
        plugin_id: &str,
        package: &Path,
    ) -> Result<InstalledPackage, InstallError>;
}

/// Read the descriptor of a package directory
pub fn read_manifest(package: &Path) -> Result<PluginDescriptor, InstallError> {
    if !package.is_dir() {
        return Err(InstallError::PackageNotFound(package.to_path_buf()));
    }
    let path = package.join(MANIFEST_FILE);
    if !path.is_file() {
        return Err(InstallError::MissingManifest(package.to_path_buf()));
    }
    let text = fs::read_to_string(&path).map_err(io_err(&path))?;
    serde_json::from_str(&text).map_err(|source| InstallError::InvalidManifest { path, source })
}

/// Check descriptor fields the manifest schema cannot express
pub fn validate_descriptor(descriptor: &PluginDescriptor) -> Result<(), InstallError> {
    let invalid = |msg: String| Err(InstallError::InvalidDescriptor(msg));

    let id = &descriptor.plugin_id;
    if id.is_empty() {
        return invalid("pluginId is empty".into());
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        || id.starts_with('.')
    {
        return invalid(format!("pluginId '{id}' contains invalid characters"));
    }
    if let Err(e) = parse_version(&descriptor.version) {
        return invalid(e.to_string());
    }

    let entry = Path::new(&descriptor.main_entry);
    if descriptor.main_entry.is_empty()
        || !entry
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
    {
        return invalid(format!(
            "mainEntry '{}' must be a relative path inside the package",
            descriptor.main_entry
        ));
    }

    for dep in &descriptor.dependencies {
        if dep.plugin_id == *id {
            return invalid(format!("plugin '{id}' depends on itself"));
        }
        if let Err(e) = parse_requirement(&dep.version_requirement) {
            return invalid(e.to_string());
        }
    }
    Ok(())
}

/// Read, check and locate the entry of a package
pub fn inspect_package(package: &Path) -> Result<PluginDescriptor, InstallError> {
    let descriptor = read_manifest(package)?;
    validate_descriptor(&descriptor)?;
    if !package.join(&descriptor.main_entry).is_file() {
        return Err(InstallError::MissingEntry {
            package: package.to_path_buf(),
            entry: descriptor.main_entry.clone(),
        });
    }
    Ok(descriptor)
}

/// Package directories directly under `dir`, sorted by path
pub fn discover_packages(dir: &Path) -> Result<Vec<PathBuf>, InstallError> {
    if !dir.is_dir() {
        return Err(InstallError::PackageNotFound(dir.to_path_buf()));
    }
    let mut packages = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err(dir))? {
        let path = entry.map_err(io_err(dir))?.path();
        let is_backup = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.ends_with(BACKUP_SUFFIX))
            .unwrap_or(false);
        if path.is_dir() && !is_backup && path.join(MANIFEST_FILE).is_file() {
            packages.push(path);
        }
    }
    packages.sort();
    Ok(packages)
}

/// Get default plugin directories for the current platform
pub fn default_plugin_dirs(app_name: &str) -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    // User-local plugins
    if let Some(data_dir) = dirs::data_local_dir() {
        dirs.push(data_dir.join(app_name).join("plugins"));
    }

    // Current directory plugins
    dirs.push(PathBuf::from("plugins"));

    dirs
}

/// Installs packages by copying them to `<root>/<pluginId>/`
#[derive(Debug, Clone)]
pub struct DirectoryInstaller {
    root: PathBuf,
}

impl DirectoryInstaller {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn install_dir(&self, plugin_id: &str) -> PathBuf {
        self.root.join(plugin_id)
    }

    fn backup_dir(&self, plugin_id: &str) -> PathBuf {
        self.root.join(format!("{plugin_id}{BACKUP_SUFFIX}"))
    }

    fn install_blocking(&self, package: &Path) -> Result<InstalledPackage, InstallError> {
        let descriptor = inspect_package(package)?;
        let dest = self.install_dir(&descriptor.plugin_id);

        if !same_dir(package, &dest) {
            fs::create_dir_all(&self.root).map_err(io_err(&self.root))?;
            if dest.exists() {
                fs::remove_dir_all(&dest).map_err(io_err(&dest))?;
            }
            if let Err(e) = copy_dir(package, &dest) {
                let _ = fs::remove_dir_all(&dest);
                return Err(e);
            }
        }

        tracing::info!(
            plugin = %descriptor.plugin_id,
            package = %package.display(),
            dest = %dest.display(),
            "Package installed"
        );
        Ok(InstalledPackage {
            descriptor,
            module_path: dest,
        })
    }

    fn upgrade_blocking(
        &self,
        plugin_id: &str,
        package: &Path,
    ) -> Result<InstalledPackage, InstallError> {
        let descriptor = inspect_package(package)?;
        if descriptor.plugin_id != plugin_id {
            return Err(InstallError::IdentityMismatch {
                expected: plugin_id.to_string(),
                found: descriptor.plugin_id,
            });
        }

        let current = self.install_dir(plugin_id);
        if !current.is_dir() {
            return Err(InstallError::NotInstalled(plugin_id.to_string()));
        }
        let backup = self.backup_dir(plugin_id);
        if backup.exists() {
            fs::remove_dir_all(&backup).map_err(io_err(&backup))?;
        }
        fs::rename(&current, &backup).map_err(io_err(&current))?;

        if let Err(e) = copy_dir(package, &current) {
            tracing::warn!(plugin = %plugin_id, error = %e, "Upgrade failed, restoring backup");
            let _ = fs::remove_dir_all(&current);
            fs::rename(&backup, &current).map_err(io_err(&backup))?;
            return Err(e);
        }
        if let Err(e) = fs::remove_dir_all(&backup) {
            tracing::warn!(plugin = %plugin_id, error = %e, "Failed to remove upgrade backup");
        }

        tracing::info!(
            plugin = %plugin_id,
            version = %descriptor.version,
            "Package upgraded"
        );
        Ok(InstalledPackage {
            descriptor,
            module_path: current,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, InstallError>
    where
        T: Send + 'static,
        F: FnOnce(DirectoryInstaller) -> Result<T, InstallError> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || f(this))
            .await
            .map_err(|e| InstallError::Task(e.to_string()))?
    }
}

#[async_trait]
impl Installer for DirectoryInstaller {
    async fn validate(&self, package: &Path) -> Result<PluginDescriptor, InstallError> {
        let package = package.to_path_buf();
        self.blocking(move |_| inspect_package(&package)).await
    }

    async fn install(&self, package: &Path) -> Result<InstalledPackage, InstallError> {
        let package = package.to_path_buf();
        self.blocking(move |this| this.install_blocking(&package))
            .await
    }

    async fn uninstall(&self, plugin_id: &str) -> Result<(), InstallError> {
        let plugin_id = plugin_id.to_string();
        self.blocking(move |this| {
            let dir = this.install_dir(&plugin_id);
            if !dir.is_dir() {
                return Err(InstallError::NotInstalled(plugin_id));
            }
            fs::remove_dir_all(&dir).map_err(io_err(&dir))?;
            tracing::info!(plugin = %plugin_id, "Package uninstalled");
            Ok(())
        })
        .await
    }

    async fn upgrade(
        &self,
        plugin_id: &str,
        package: &Path,
    ) -> Result<InstalledPackage, InstallError> {
        let plugin_id = plugin_id.to_string();
        let package = package.to_path_buf();
        self.blocking(move |this| this.upgrade_blocking(&plugin_id, &package))
            .await
    }
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), InstallError> {
    fs::create_dir_all(to).map_err(io_err(to))?;
    for entry in fs::read_dir(from).map_err(io_err(from))? {
        let entry = entry.map_err(io_err(from))?;
        let src = entry.path();
        let dst = to.join(entry.file_name());
        if src.is_dir() {
            copy_dir(&src, &dst)?;
        } else {
            fs::copy(&src, &dst).map_err(io_err(&src))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_package(dir: &Path, id: &str, version: &str) -> PathBuf {
        let pkg = dir.join(format!("{id}-{version}"));
        fs::create_dir_all(&pkg).unwrap();
        let manifest = serde_json::json!({
            "pluginId": id,
            "version": version,
            "mainEntry": "main.wasm",
        });
        fs::write(pkg.join(MANIFEST_FILE), manifest.to_string()).unwrap();
        fs::write(pkg.join("main.wasm"), format!("(module) ;; {version}")).unwrap();
        pkg
    }

    #[tokio::test]
    async fn test_install_copies_package() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let pkg = write_package(src.path(), "alpha", "1.0.0");

        let installer = DirectoryInstaller::new(root.path());
        assert!(installer.is_valid(&pkg).await);
        let installed = installer.install(&pkg).await.unwrap();

        assert_eq!(installed.descriptor.plugin_id, "alpha");
        assert_eq!(installed.module_path, root.path().join("alpha"));
        assert!(installed.module_path.join("main.wasm").is_file());
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_packages() {
        let src = TempDir::new().unwrap();
        let installer = DirectoryInstaller::new(src.path().join("root"));

        assert!(matches!(
            installer.validate(&src.path().join("missing")).await,
            Err(InstallError::PackageNotFound(_))
        ));

        let pkg = write_package(src.path(), "beta", "1.0.0");
        fs::remove_file(pkg.join("main.wasm")).unwrap();
        assert!(matches!(
            installer.validate(&pkg).await,
            Err(InstallError::MissingEntry { .. })
        ));

        fs::write(pkg.join(MANIFEST_FILE), "{ nope").unwrap();
        assert!(matches!(
            installer.validate(&pkg).await,
            Err(InstallError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn test_descriptor_rules() {
        let ok = PluginDescriptor::new("net.http-client", "1.2", "lib/main.wasm");
        assert!(validate_descriptor(&ok).is_ok());

        for bad in [
            PluginDescriptor::new("", "1.0.0", "main.wasm"),
            PluginDescriptor::new("a/b", "1.0.0", "main.wasm"),
            PluginDescriptor::new("a", "latest", "main.wasm"),
            PluginDescriptor::new("a", "1.0.0", "../escape.wasm"),
            PluginDescriptor::new("a", "1.0.0", "main.wasm").depends_on("a", "*"),
            PluginDescriptor::new("a", "1.0.0", "main.wasm").depends_on("b", "=> 1"),
        ] {
            assert!(
                matches!(
                    validate_descriptor(&bad),
                    Err(InstallError::InvalidDescriptor(_))
                ),
                "{bad:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_upgrade_replaces_and_cleans_backup() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let installer = DirectoryInstaller::new(root.path());
        installer
            .install(&write_package(src.path(), "alpha", "1.0.0"))
            .await
            .unwrap();

        let v2 = write_package(src.path(), "alpha", "2.0.0");
        let installed = installer.upgrade("alpha", &v2).await.unwrap();
        assert_eq!(installed.descriptor.version, "2.0.0");
        let on_disk = read_manifest(&root.path().join("alpha")).unwrap();
        assert_eq!(on_disk.version, "2.0.0");
        assert!(!root.path().join("alpha.bak").exists());
    }

    #[tokio::test]
    async fn test_failed_upgrade_keeps_previous_install() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let installer = DirectoryInstaller::new(root.path());
        installer
            .install(&write_package(src.path(), "alpha", "1.0.0"))
            .await
            .unwrap();

        let other = write_package(src.path(), "gamma", "2.0.0");
        assert!(matches!(
            installer.upgrade("alpha", &other).await,
            Err(InstallError::IdentityMismatch { .. })
        ));
        assert!(matches!(
            installer.upgrade("ghost", &other).await,
            Err(InstallError::IdentityMismatch { .. })
        ));

        let on_disk = read_manifest(&root.path().join("alpha")).unwrap();
        assert_eq!(on_disk.version, "1.0.0");
    }

    #[tokio::test]
    async fn test_uninstall() {
        let src = TempDir::new().unwrap();
        let root = TempDir::new().unwrap();
        let installer = DirectoryInstaller::new(root.path());
        installer
            .install(&write_package(src.path(), "alpha", "1.0.0"))
            .await
            .unwrap();

        installer.uninstall("alpha").await.unwrap();
        assert!(!root.path().join("alpha").exists());
        assert!(matches!(
            installer.uninstall("alpha").await,
            Err(InstallError::NotInstalled(_))
        ));
    }

    #[test]
    fn test_discover_packages_skips_noise() {
        let dir = TempDir::new().unwrap();
        write_package(dir.path(), "b", "1.0.0");
        write_package(dir.path(), "a", "1.0.0");
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        fs::create_dir_all(dir.path().join("a.bak")).unwrap();
        fs::write(dir.path().join("a.bak").join(MANIFEST_FILE), "{}").unwrap();
        fs::write(dir.path().join("readme.txt"), "hi").unwrap();

        let found = discover_packages(dir.path()).unwrap();
        assert_eq!(
            found,
            vec![dir.path().join("a-1.0.0"), dir.path().join("b-1.0.0")]
        );
    }

    #[test]
    fn test_default_plugin_dirs() {
        let dirs = default_plugin_dirs("warden");
        assert!(!dirs.is_empty());
        assert!(dirs.iter().any(|d| d.ends_with("plugins")));
    }
}
