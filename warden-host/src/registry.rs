//! Plugin registry
//!
//! Thread-safe store of [`PluginRecord`]s. The registry is the only owner of
//! live records: every read returns a snapshot, and every mutation goes
//! through a registry method under its internal lock. State changes are
//! validated against the lifecycle transition table, mirrored to the
//! persistence store and announced as `plugin/state_change` events.
//!
//! Store writes run on the blocking pool after the lock is released. Each
//! write carries the revision it was taken at, so a slower older write
//! never overwrites a newer one for the same plugin.

use crate::events::EventBus;
use crate::persistence::{NullPersistence, PersistenceStore};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::RwLock;
use warden_api::{kinds, topics, EventEnvelope, EventPayload, PluginRecord, PluginState};

const SOURCE: &str = "registry";

/// A state change that is not an edge of the lifecycle table
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Illegal transition for plugin '{plugin}': {from} -> {to}")]
pub struct TransitionError {
    pub plugin: String,
    pub from: PluginState,
    pub to: PluginState,
}

/// Errors that can occur during registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Plugin already registered: {0}")]
    AlreadyRegistered(String),

    #[error(transparent)]
    IllegalTransition(#[from] TransitionError),

    #[error("Plugin '{plugin}' is {actual}, expected {expected}")]
    StateMismatch {
        plugin: String,
        expected: PluginState,
        actual: PluginState,
    },
}

/// A thread-safe registry of plugin records
#[derive(Clone)]
pub struct PluginRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    events: EventBus,
    persistence: Arc<dyn PersistenceStore>,
    /// Last revision written to the store, per plugin id
    written: Arc<Mutex<HashMap<String, Arc<Mutex<u64>>>>>,
}

struct RegistryInner {
    /// Records indexed by plugin id
    plugins: HashMap<String, PluginRecord>,
    /// Map from package path to plugin id for reload tracking
    path_to_plugin: HashMap<PathBuf, String>,
    /// Bumped on every mutation
    revision: u64,
}

enum RecordWrite {
    Save(PluginRecord),
    Delete,
}

impl PluginRegistry {
    /// Create an empty registry that persists nothing
    pub fn new(events: EventBus) -> Self {
        Self::with_persistence(events, Arc::new(NullPersistence))
    }

    /// Create an empty registry mirroring records into `persistence`
    pub fn with_persistence(events: EventBus, persistence: Arc<dyn PersistenceStore>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                plugins: HashMap::new(),
                path_to_plugin: HashMap::new(),
                revision: 0,
            })),
            events,
            persistence,
            written: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Register a new record. Duplicate ids are rejected; use [`replace`](Self::replace).
    pub async fn register(&self, record: PluginRecord) -> Result<(), RegistryError> {
        let plugin_id = record.plugin_id().to_string();
        let revision = {
            let mut inner = self.inner.write().await;
            if inner.plugins.contains_key(&plugin_id) {
                return Err(RegistryError::AlreadyRegistered(plugin_id));
            }
            inner.insert(record.clone())
        };
        self.persist(&plugin_id, revision, RecordWrite::Save(record))
            .await;

        tracing::info!(plugin = %plugin_id, "Plugin registered");
        Ok(())
    }

    /// Register `record`, replacing any record with the same id.
    ///
    /// Returns the replaced record.
    pub async fn replace(&self, record: PluginRecord) -> Option<PluginRecord> {
        let plugin_id = record.plugin_id().to_string();
        let (previous, revision) = {
            let mut inner = self.inner.write().await;
            let previous = inner.remove(&plugin_id);
            (previous, inner.insert(record.clone()))
        };
        self.persist(&plugin_id, revision, RecordWrite::Save(record))
            .await;

        if let Some(prev) = &previous {
            tracing::info!(
                plugin = %plugin_id,
                previous_version = %prev.version(),
                "Plugin record replaced"
            );
        } else {
            tracing::info!(plugin = %plugin_id, "Plugin registered");
        }
        previous
    }

    /// Remove a record
    pub async fn unregister(&self, plugin_id: &str) -> Result<PluginRecord, RegistryError> {
        let (record, revision) = {
            let mut inner = self.inner.write().await;
            let record = inner
                .remove(plugin_id)
                .ok_or_else(|| RegistryError::NotFound(plugin_id.to_string()))?;
            (record, inner.bump())
        };
        self.persist(plugin_id, revision, RecordWrite::Delete).await;

        tracing::info!(plugin = %plugin_id, "Plugin unregistered");
        Ok(record)
    }

    /// Snapshot of one record
    pub async fn get(&self, plugin_id: &str) -> Option<PluginRecord> {
        let inner = self.inner.read().await;
        inner.plugins.get(plugin_id).cloned()
    }

    pub async fn has(&self, plugin_id: &str) -> bool {
        let inner = self.inner.read().await;
        inner.plugins.contains_key(plugin_id)
    }

    pub async fn state(&self, plugin_id: &str) -> Option<PluginState> {
        let inner = self.inner.read().await;
        inner.plugins.get(plugin_id).map(|r| r.state)
    }

    /// Move a plugin to `new_state` along a legal edge.
    ///
    /// Returns the previous state. An illegal edge leaves the record
    /// untouched. `message` becomes the record's error message for the
    /// halted states and is cleared on `STARTED`.
    pub async fn update_state(
        &self,
        plugin_id: &str,
        new_state: PluginState,
        message: Option<String>,
    ) -> Result<PluginState, RegistryError> {
        self.transition(plugin_id, None, new_state, message).await
    }

    /// Like [`update_state`](Self::update_state), but only if the current
    /// state is `expected`.
    pub async fn compare_and_set_state(
        &self,
        plugin_id: &str,
        expected: PluginState,
        new_state: PluginState,
        message: Option<String>,
    ) -> Result<PluginState, RegistryError> {
        self.transition(plugin_id, Some(expected), new_state, message)
            .await
    }

    async fn transition(
        &self,
        plugin_id: &str,
        expected: Option<PluginState>,
        new_state: PluginState,
        message: Option<String>,
    ) -> Result<PluginState, RegistryError> {
        let (old_state, version, snapshot, revision) = {
            let mut inner = self.inner.write().await;
            let revision = inner.bump();
            let record = inner
                .plugins
                .get_mut(plugin_id)
                .ok_or_else(|| RegistryError::NotFound(plugin_id.to_string()))?;

            let old_state = record.state;
            if let Some(expected) = expected {
                if old_state != expected {
                    return Err(RegistryError::StateMismatch {
                        plugin: plugin_id.to_string(),
                        expected,
                        actual: old_state,
                    });
                }
            }
            if !old_state.can_transition_to(new_state) {
                return Err(TransitionError {
                    plugin: plugin_id.to_string(),
                    from: old_state,
                    to: new_state,
                }
                .into());
            }

            record.state = new_state;
            record.last_state_change_time = Utc::now();
            match new_state {
                PluginState::Error | PluginState::Isolated | PluginState::ResourceLimited => {
                    record.error_message = message.clone();
                }
                PluginState::Started => record.error_message = None,
                _ => {
                    if message.is_some() {
                        record.error_message = message.clone();
                    }
                }
            }
            let version = record.version().to_string();
            (old_state, version, record.clone(), revision)
        };
        self.persist(plugin_id, revision, RecordWrite::Save(snapshot))
            .await;

        tracing::info!(
            plugin = %plugin_id,
            from = %old_state,
            to = %new_state,
            "Plugin state changed"
        );

        self.events.publish(
            EventEnvelope::new(topics::PLUGIN, kinds::STATE_CHANGE, SOURCE)
                .plugin(plugin_id)
                .version(version)
                .payload(EventPayload::StateChange {
                    from: old_state,
                    to: new_state,
                    message,
                }),
        );
        Ok(old_state)
    }

    /// Set the `enabled` flag, returning the previous value
    pub async fn set_enabled(&self, plugin_id: &str, enabled: bool) -> Result<bool, RegistryError> {
        self.modify(plugin_id, |record| {
            std::mem::replace(&mut record.enabled, enabled)
        })
        .await
    }

    /// Set or clear the error message without changing state
    pub async fn set_error(
        &self,
        plugin_id: &str,
        message: Option<String>,
    ) -> Result<(), RegistryError> {
        self.modify(plugin_id, |record| record.error_message = message)
            .await
    }

    /// Record what the loader reported for a successful load
    pub async fn set_load_counts(
        &self,
        plugin_id: &str,
        symbols: usize,
        resources: usize,
    ) -> Result<(), RegistryError> {
        self.modify(plugin_id, |record| {
            record.loaded_symbol_count = symbols;
            record.loaded_resource_count = resources;
        })
        .await
    }

    async fn modify<T>(
        &self,
        plugin_id: &str,
        f: impl FnOnce(&mut PluginRecord) -> T,
    ) -> Result<T, RegistryError> {
        let (out, snapshot, revision) = {
            let mut inner = self.inner.write().await;
            let revision = inner.bump();
            let record = inner
                .plugins
                .get_mut(plugin_id)
                .ok_or_else(|| RegistryError::NotFound(plugin_id.to_string()))?;
            let out = f(record);
            (out, record.clone(), revision)
        };
        self.persist(plugin_id, revision, RecordWrite::Save(snapshot))
            .await;
        Ok(out)
    }

    /// Find the plugin installed from `path`
    pub async fn find_by_source(&self, path: impl AsRef<Path>) -> Option<String> {
        let inner = self.inner.read().await;
        inner.path_to_plugin.get(path.as_ref()).cloned()
    }

    /// Snapshot of every record
    pub async fn all_plugins(&self) -> Vec<PluginRecord> {
        let inner = self.inner.read().await;
        let mut records: Vec<_> = inner.plugins.values().cloned().collect();
        records.sort_by(|a, b| a.plugin_id().cmp(b.plugin_id()));
        records
    }

    pub async fn by_enabled(&self, enabled: bool) -> Vec<PluginRecord> {
        self.filtered(|r| r.enabled == enabled).await
    }

    pub async fn by_state(&self, state: PluginState) -> Vec<PluginRecord> {
        self.filtered(|r| r.state == state).await
    }

    async fn filtered(&self, predicate: impl Fn(&PluginRecord) -> bool) -> Vec<PluginRecord> {
        let mut records = self.all_plugins().await;
        records.retain(|r| predicate(r));
        records
    }

    /// Records previously saved to the persistence store
    pub fn persisted_records(&self) -> Vec<PluginRecord> {
        self.persistence.load_all_records().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read persisted plugin records");
            Vec::new()
        })
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.read().await;
        inner.plugins.len()
    }

    pub async fn is_empty(&self) -> bool {
        let inner = self.inner.read().await;
        inner.plugins.is_empty()
    }

    async fn persist(&self, plugin_id: &str, revision: u64, write: RecordWrite) {
        let store = self.persistence.clone();
        let written = self.written.clone();
        let id = plugin_id.to_string();
        let task = tokio::task::spawn_blocking(move || {
            let slot = written
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(id.clone())
                .or_default()
                .clone();
            let mut last = slot.lock().unwrap_or_else(|e| e.into_inner());
            if *last >= revision {
                return Ok(());
            }
            *last = revision;
            match write {
                RecordWrite::Save(record) => store.save_plugin_record(&record),
                RecordWrite::Delete => store.delete_record(&id),
            }
        });

        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::warn!(plugin = %plugin_id, error = %e, "Failed to persist plugin record");
            }
            Err(e) => {
                tracing::warn!(plugin = %plugin_id, error = %e, "Persistence task failed");
            }
        }
    }
}

impl RegistryInner {
    fn bump(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Insert `record`, returning the new revision
    fn insert(&mut self, record: PluginRecord) -> u64 {
        let plugin_id = record.plugin_id().to_string();
        if let Some(source) = &record.source_path {
            self.path_to_plugin.insert(source.clone(), plugin_id.clone());
        }
        self.plugins.insert(plugin_id, record);
        self.bump()
    }

    fn remove(&mut self, plugin_id: &str) -> Option<PluginRecord> {
        let record = self.plugins.remove(plugin_id)?;
        if let Some(source) = &record.source_path {
            if self.path_to_plugin.get(source).map(String::as_str) == Some(plugin_id) {
                self.path_to_plugin.remove(source);
            }
        }
        Some(record)
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventFilter;
    use crate::persistence::{MemoryPersistence, PersistenceError};
    use std::time::{Duration, Instant};
    use warden_api::PluginDescriptor;

    fn record(id: &str) -> PluginRecord {
        PluginRecord::new(PluginDescriptor::new(id, "1.0.0", "main.wasm"), "/opt/p")
    }

    #[tokio::test]
    async fn test_register_get_unregister() {
        let registry = PluginRegistry::new(EventBus::new());
        registry.register(record("a")).await.unwrap();
        assert!(registry.has("a").await);
        assert_eq!(registry.get("a").await.unwrap().state, PluginState::Created);

        assert_eq!(
            registry.register(record("a")).await,
            Err(RegistryError::AlreadyRegistered("a".into()))
        );

        registry.unregister("a").await.unwrap();
        assert!(!registry.has("a").await);
        assert!(matches!(
            registry.unregister("a").await,
            Err(RegistryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_replace_is_explicit() {
        let registry = PluginRegistry::new(EventBus::new());
        assert!(registry.replace(record("a")).await.is_none());

        let mut newer = record("a");
        newer.descriptor.version = "2.0.0".into();
        let previous = registry.replace(newer).await.unwrap();
        assert_eq!(previous.version(), "1.0.0");
        assert_eq!(registry.get("a").await.unwrap().version(), "2.0.0");
    }

    #[tokio::test]
    async fn test_illegal_transition_leaves_state_unchanged() {
        let registry = PluginRegistry::new(EventBus::new());
        registry.register(record("a")).await.unwrap();

        let err = registry
            .update_state("a", PluginState::Started, None)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::IllegalTransition(TransitionError {
                plugin: "a".into(),
                from: PluginState::Created,
                to: PluginState::Started,
            })
        );
        assert_eq!(registry.state("a").await, Some(PluginState::Created));
    }

    #[tokio::test]
    async fn test_every_state_pair_follows_table() {
        use PluginState::*;
        let all = [
            Created,
            Loaded,
            Initialized,
            Started,
            Stopped,
            Error,
            Isolated,
            ResourceLimited,
            Unloaded,
        ];
        for from in all {
            for to in all {
                let registry = PluginRegistry::new(EventBus::new());
                let mut rec = record("p");
                rec.state = from;
                registry.register(rec).await.unwrap();

                let result = registry.update_state("p", to, None).await;
                let now = registry.state("p").await.unwrap();
                if from.can_transition_to(to) {
                    assert_eq!(result, Ok(from), "{from} -> {to}");
                    assert_eq!(now, to);
                } else {
                    assert!(result.is_err(), "{from} -> {to} should be rejected");
                    assert_eq!(now, from);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_state_change_event_carries_old_and_new() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.subscribe_sync(
            EventFilter::topic(topics::PLUGIN).with_type(kinds::STATE_CHANGE),
            0,
            move |event: &mut EventEnvelope| {
                sink.lock().unwrap().push(event.payload.clone());
                Ok(())
            },
        );

        let registry = PluginRegistry::new(bus);
        registry.register(record("a")).await.unwrap();
        registry
            .update_state("a", PluginState::Loaded, None)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            seen.as_slice(),
            &[EventPayload::StateChange {
                from: PluginState::Created,
                to: PluginState::Loaded,
                message: None
            }]
        );
    }

    #[tokio::test]
    async fn test_error_message_rules() {
        let registry = PluginRegistry::new(EventBus::new());
        let mut rec = record("a");
        rec.state = PluginState::Started;
        registry.register(rec).await.unwrap();

        registry
            .update_state("a", PluginState::Isolated, Some("too many errors".into()))
            .await
            .unwrap();
        assert_eq!(
            registry.get("a").await.unwrap().error_message.as_deref(),
            Some("too many errors")
        );

        registry
            .update_state("a", PluginState::Stopped, None)
            .await
            .unwrap();
        assert!(registry.get("a").await.unwrap().error_message.is_some());

        registry
            .update_state("a", PluginState::Started, None)
            .await
            .unwrap();
        assert!(registry.get("a").await.unwrap().error_message.is_none());
    }

    #[tokio::test]
    async fn test_compare_and_set() {
        let registry = PluginRegistry::new(EventBus::new());
        registry.register(record("a")).await.unwrap();
        let err = registry
            .compare_and_set_state("a", PluginState::Loaded, PluginState::Initialized, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::StateMismatch { .. }));

        registry
            .compare_and_set_state("a", PluginState::Created, PluginState::Loaded, None)
            .await
            .unwrap();
        assert_eq!(registry.state("a").await, Some(PluginState::Loaded));
    }

    #[tokio::test]
    async fn test_snapshots_are_detached() {
        let registry = PluginRegistry::new(EventBus::new());
        registry.register(record("a")).await.unwrap();
        registry.register(record("b")).await.unwrap();
        registry.set_enabled("b", true).await.unwrap();

        let mut snapshot = registry.all_plugins().await;
        snapshot[0].state = PluginState::Started;
        assert_eq!(registry.state("a").await, Some(PluginState::Created));

        let enabled = registry.by_enabled(true).await;
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].plugin_id(), "b");
        assert_eq!(registry.by_state(PluginState::Created).await.len(), 2);
    }

    #[tokio::test]
    async fn test_changes_are_persisted() {
        let store = Arc::new(MemoryPersistence::new());
        let registry = PluginRegistry::with_persistence(EventBus::new(), store.clone());

        registry
            .register(record("a").with_source(Some(PathBuf::from("/pkgs/a"))))
            .await
            .unwrap();
        registry.set_enabled("a", true).await.unwrap();
        registry
            .update_state("a", PluginState::Loaded, None)
            .await
            .unwrap();

        let saved = store.get("a").unwrap();
        assert!(saved.enabled);
        assert_eq!(saved.state, PluginState::Loaded);
        assert_eq!(
            registry.find_by_source("/pkgs/a").await.as_deref(),
            Some("a")
        );

        registry.unregister("a").await.unwrap();
        assert!(store.get("a").is_none());
        assert!(registry.find_by_source("/pkgs/a").await.is_none());
    }

    /// Store whose writes for one plugin id take a while
    struct SlowStore {
        slow_id: &'static str,
        delay: Duration,
        inner: MemoryPersistence,
    }

    impl PersistenceStore for SlowStore {
        fn save_plugin_record(&self, record: &PluginRecord) -> Result<(), PersistenceError> {
            if record.plugin_id() == self.slow_id {
                std::thread::sleep(self.delay);
            }
            self.inner.save_plugin_record(record)
        }

        fn load_all_records(&self) -> Result<Vec<PluginRecord>, PersistenceError> {
            self.inner.load_all_records()
        }

        fn delete_record(&self, plugin_id: &str) -> Result<(), PersistenceError> {
            self.inner.delete_record(plugin_id)
        }
    }

    #[tokio::test]
    async fn test_slow_store_does_not_block_other_plugins() {
        let store = Arc::new(SlowStore {
            slow_id: "a",
            delay: Duration::from_millis(500),
            inner: MemoryPersistence::new(),
        });
        let registry = PluginRegistry::with_persistence(EventBus::new(), store.clone());
        registry.register(record("b")).await.unwrap();

        let writer = registry.clone();
        let pending = tokio::spawn(async move { writer.register(record("a")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = Instant::now();
        assert_eq!(registry.state("b").await, Some(PluginState::Created));
        assert_eq!(registry.state("a").await, Some(PluginState::Created));
        registry.set_enabled("b", true).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(250));

        pending.await.unwrap().unwrap();
        assert!(store.inner.get("a").is_some());
        assert!(store.inner.get("b").unwrap().enabled);
    }

    #[tokio::test]
    async fn test_older_write_never_overwrites_newer() {
        let store = Arc::new(MemoryPersistence::new());
        let registry = PluginRegistry::with_persistence(EventBus::new(), store.clone());
        registry.register(record("a")).await.unwrap();
        registry.set_enabled("a", true).await.unwrap();

        // A stale snapshot arriving late is dropped
        registry
            .persist("a", 1, RecordWrite::Save(record("a")))
            .await;
        assert!(store.get("a").unwrap().enabled);
    }
}
