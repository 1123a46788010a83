//! Plugin record persistence
//!
//! The registry mirrors every record change into a [`PersistenceStore`].
//! Store failures are logged by the caller and never block a state change.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;
use warden_api::PluginRecord;

/// Error type for persistence operations
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Failed to access plugin state file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse plugin state file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Persistence unavailable: {0}")]
    Unavailable(String),
}

/// Storage for plugin records
pub trait PersistenceStore: Send + Sync {
    /// Insert or overwrite the record for its plugin id
    fn save_plugin_record(&self, record: &PluginRecord) -> Result<(), PersistenceError>;

    /// All stored records, in plugin id order
    fn load_all_records(&self) -> Result<Vec<PluginRecord>, PersistenceError>;

    /// Remove a record; deleting an unknown id is not an error
    fn delete_record(&self, plugin_id: &str) -> Result<(), PersistenceError>;
}

// ============================================================================
// File-based store
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StateFileData {
    version: u32,
    plugins: BTreeMap<String, PluginRecord>,
}

impl StateFileData {
    fn new() -> Self {
        Self {
            version: 1,
            plugins: BTreeMap::new(),
        }
    }
}

/// JSON file of plugin records.
///
/// The production preset keeps it at `<data dir>/warden/plugins.json`
pub struct FilePersistence {
    path: PathBuf,
    data: RwLock<StateFileData>,
}

impl FilePersistence {
    /// Open (or lazily create) the store at `path`
    pub fn new(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();

        let data = if path.exists() {
            let file = File::open(&path)?;
            serde_json::from_reader(BufReader::new(file))?
        } else {
            StateFileData::new()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn save(&self, data: &StateFileData) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Atomic replace: write a sibling file, then rename
        let tmp = self.path.with_extension("json.tmp");
        {
            let writer = BufWriter::new(File::create(&tmp)?);
            serde_json::to_writer_pretty(writer, data)?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl PersistenceStore for FilePersistence {
    fn save_plugin_record(&self, record: &PluginRecord) -> Result<(), PersistenceError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.plugins
            .insert(record.plugin_id().to_string(), record.clone());
        self.save(&data)
    }

    fn load_all_records(&self) -> Result<Vec<PluginRecord>, PersistenceError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.plugins.values().cloned().collect())
    }

    fn delete_record(&self, plugin_id: &str) -> Result<(), PersistenceError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        if data.plugins.remove(plugin_id).is_some() {
            self.save(&data)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for FilePersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilePersistence")
            .field("path", &self.path)
            .finish()
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// In-memory store for tests and ephemeral hosts
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    data: RwLock<BTreeMap<String, PluginRecord>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with records
    pub fn with_records(records: impl IntoIterator<Item = PluginRecord>) -> Self {
        Self {
            data: RwLock::new(
                records
                    .into_iter()
                    .map(|r| (r.plugin_id().to_string(), r))
                    .collect(),
            ),
        }
    }

    pub fn get(&self, plugin_id: &str) -> Option<PluginRecord> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        data.get(plugin_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.data.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PersistenceStore for MemoryPersistence {
    fn save_plugin_record(&self, record: &PluginRecord) -> Result<(), PersistenceError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.insert(record.plugin_id().to_string(), record.clone());
        Ok(())
    }

    fn load_all_records(&self) -> Result<Vec<PluginRecord>, PersistenceError> {
        let data = self.data.read().unwrap_or_else(|e| e.into_inner());
        Ok(data.values().cloned().collect())
    }

    fn delete_record(&self, plugin_id: &str) -> Result<(), PersistenceError> {
        let mut data = self.data.write().unwrap_or_else(|e| e.into_inner());
        data.remove(plugin_id);
        Ok(())
    }
}

/// Store that remembers nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPersistence;

impl PersistenceStore for NullPersistence {
    fn save_plugin_record(&self, _record: &PluginRecord) -> Result<(), PersistenceError> {
        Ok(())
    }

    fn load_all_records(&self) -> Result<Vec<PluginRecord>, PersistenceError> {
        Ok(Vec::new())
    }

    fn delete_record(&self, _plugin_id: &str) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use warden_api::{PluginDescriptor, PluginState};

    fn record(id: &str) -> PluginRecord {
        PluginRecord::new(PluginDescriptor::new(id, "1.0.0", "main.wasm"), "/opt/plugins")
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("state").join("plugins.json");

        {
            let store = FilePersistence::new(&path).unwrap();
            let mut rec = record("alpha");
            rec.enabled = true;
            rec.state = PluginState::Stopped;
            store.save_plugin_record(&rec).unwrap();
            store.save_plugin_record(&record("beta")).unwrap();
            store.delete_record("beta").unwrap();
        }

        let reopened = FilePersistence::new(&path).unwrap();
        let records = reopened.load_all_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].plugin_id(), "alpha");
        assert!(records[0].enabled);
        assert_eq!(records[0].state, PluginState::Stopped);
    }

    #[test]
    fn test_file_store_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("plugins.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FilePersistence::new(&path),
            Err(PersistenceError::Parse(_))
        ));
    }

    #[test]
    fn test_memory_store_overwrites_by_id() {
        let store = MemoryPersistence::new();
        store.save_plugin_record(&record("a")).unwrap();
        let mut updated = record("a");
        updated.enabled = true;
        store.save_plugin_record(&updated).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.get("a").unwrap().enabled);

        store.delete_record("missing").unwrap();
        store.delete_record("a").unwrap();
        assert!(store.is_empty());
    }
}
