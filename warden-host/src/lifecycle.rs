//! Lifecycle handler
//!
//! Performs load/initialize/start/stop/unload against the [`Loader`] and
//! records the outcome in the registry. Each action is only permitted from
//! specific states; the handler never coerces a plugin into a different
//! action.
//!
//! Every loader call carries a deadline. A timed-out action marks the plugin
//! `ERROR`; any other loader failure leaves the plugin in the state it was in
//! before the action and records the error message.

use crate::events::EventBus;
use crate::loader::{Loader, LoaderError};
use crate::registry::{PluginRegistry, RegistryError};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use warden_api::{
    kinds, topics, EventEnvelope, EventPayload, PluginDescriptor, PluginRecord, PluginState,
};

const SOURCE: &str = "lifecycle";

/// A lifecycle action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LifecycleAction {
    Load,
    Initialize,
    Start,
    Stop,
    Unload,
}

impl LifecycleAction {
    /// Whether the action may run from `state`
    pub fn permitted_from(&self, state: PluginState) -> bool {
        use PluginState::*;
        match self {
            Self::Load => state == Created,
            Self::Initialize => state == Loaded,
            Self::Start => matches!(state, Initialized | Stopped),
            Self::Stop => state == Started,
            Self::Unload => !state.is_terminal(),
        }
    }

    /// State reached when the action succeeds
    pub fn target(&self) -> PluginState {
        match self {
            Self::Load => PluginState::Loaded,
            Self::Initialize => PluginState::Initialized,
            Self::Start => PluginState::Started,
            Self::Stop => PluginState::Stopped,
            Self::Unload => PluginState::Unloaded,
        }
    }

    fn event_kind(&self) -> &'static str {
        match self {
            Self::Load => kinds::LOADED,
            Self::Initialize => kinds::INITIALIZED,
            Self::Start => kinds::STARTED,
            Self::Stop => kinds::STOPPED,
            Self::Unload => kinds::UNLOADED,
        }
    }
}

impl fmt::Display for LifecycleAction {
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

/// Errors from lifecycle actions
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} plugin '{plugin}' in state {state}")]
    IllegalStateTransition {
        plugin: String,
        state: PluginState,
        action: LifecycleAction,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Failed to {action} plugin '{plugin}': {source}")]
    Loader {
        plugin: String,
        action: LifecycleAction,
        #[source]
        source: LoaderError,
    },

    #[error("Plugin '{plugin}' refused to {action}")]
    Refused {
        plugin: String,
        action: LifecycleAction,
    },

    #[error("Plugin '{plugin}' did not {action} within {timeout:?}")]
    Timeout {
        plugin: String,
        action: LifecycleAction,
        timeout: Duration,
    },
}

impl LifecycleError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

/// Drives plugins through their lifecycle
#[derive(Clone)]
pub struct LifecycleHandler {
    registry: PluginRegistry,
    loader: Arc<dyn Loader>,
    events: EventBus,
    timeout: Duration,
}

impl LifecycleHandler {
    pub fn new(
        registry: PluginRegistry,
        loader: Arc<dyn Loader>,
        events: EventBus,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            loader,
            events,
            timeout,
        }
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Create the record for `descriptor` and load it.
    ///
    /// A previous record with the same id is replaced only if it is
    /// `UNLOADED`.
    pub async fn load(
        &self,
        descriptor: PluginDescriptor,
        module_path: PathBuf,
        source: Option<PathBuf>,
    ) -> Result<(), LifecycleError> {
        let plugin_id = descriptor.plugin_id.clone();
        let record = PluginRecord::new(descriptor, module_path).with_source(source);

        match self.registry.state(&plugin_id).await {
            None => self.registry.register(record).await?,
            Some(PluginState::Unloaded) => {
                self.registry.replace(record).await;
            }
            Some(_) => return Err(RegistryError::AlreadyRegistered(plugin_id).into()),
        }

        self.load_registered(&plugin_id).await
    }

    /// Load a plugin whose record is already `CREATED`
    pub async fn load_registered(&self, plugin_id: &str) -> Result<(), LifecycleError> {
        let record = self.permitted(plugin_id, LifecycleAction::Load).await?;
        let outcome = self
            .call(plugin_id, record.state, LifecycleAction::Load, async {
                self.loader
                    .load(&record.descriptor, &record.module_path)
                    .await
            })
            .await?;

        self.registry
            .set_load_counts(plugin_id, outcome.symbol_count, outcome.resource_count)
            .await?;
        self.finish(&record, LifecycleAction::Load).await?;

        tracing::info!(
            plugin = %plugin_id,
            version = %record.version(),
            symbols = outcome.symbol_count,
            resources = outcome.resource_count,
            "Plugin loaded"
        );
        Ok(())
    }

    pub async fn initialize(&self, plugin_id: &str) -> Result<(), LifecycleError> {
        let record = self.permitted(plugin_id, LifecycleAction::Initialize).await?;
        self.call(plugin_id, record.state, LifecycleAction::Initialize, async {
            self.loader.initialize(plugin_id).await
        })
        .await?;
        self.finish(&record, LifecycleAction::Initialize).await?;
        tracing::info!(plugin = %plugin_id, "Plugin initialized");
        Ok(())
    }

    pub async fn start(&self, plugin_id: &str) -> Result<(), LifecycleError> {
        let record = self.permitted(plugin_id, LifecycleAction::Start).await?;
        let started = self
            .call(plugin_id, record.state, LifecycleAction::Start, async {
                self.loader.start(plugin_id).await
            })
            .await?;
        if !started {
            return Err(self.refused(plugin_id, LifecycleAction::Start).await);
        }
        self.finish(&record, LifecycleAction::Start).await?;
        tracing::info!(plugin = %plugin_id, "Plugin started");
        Ok(())
    }

    pub async fn stop(&self, plugin_id: &str) -> Result<(), LifecycleError> {
        let record = self.permitted(plugin_id, LifecycleAction::Stop).await?;
        let stopped = self
            .call(plugin_id, record.state, LifecycleAction::Stop, async {
                self.loader.stop(plugin_id).await
            })
            .await?;
        if !stopped {
            return Err(self.refused(plugin_id, LifecycleAction::Stop).await);
        }
        self.finish(&record, LifecycleAction::Stop).await?;
        tracing::info!(plugin = %plugin_id, "Plugin stopped");
        Ok(())
    }

    /// Release a plugin. Always ends in `UNLOADED`; loader failures are logged.
    pub async fn unload(&self, plugin_id: &str) -> Result<(), LifecycleError> {
        let record = self.permitted(plugin_id, LifecycleAction::Unload).await?;

        if record.state == PluginState::Started {
            self.best_effort(plugin_id, LifecycleAction::Stop, self.loader.stop(plugin_id))
                .await;
        }
        if record.state != PluginState::Created {
            self.best_effort(plugin_id, LifecycleAction::Unload, self.loader.unload(plugin_id))
                .await;
        }

        self.registry
            .update_state(plugin_id, PluginState::Unloaded, None)
            .await?;
        self.announce(&record, LifecycleAction::Unload, EventPayload::Empty);
        tracing::info!(plugin = %plugin_id, "Plugin unloaded");
        Ok(())
    }

    /// Forcibly stop a running plugin and park it in `target`
    /// (`ISOLATED`, `RESOURCE_LIMITED` or `ERROR`).
    pub async fn halt(
        &self,
        plugin_id: &str,
        target: PluginState,
        reason: impl Into<String>,
    ) -> Result<(), LifecycleError> {
        let reason = reason.into();
        let record = self.permitted(plugin_id, LifecycleAction::Stop).await?;
        self.best_effort(plugin_id, LifecycleAction::Stop, self.loader.stop(plugin_id))
            .await;
        self.registry
            .compare_and_set_state(plugin_id, record.state, target, Some(reason.clone()))
            .await?;
        tracing::warn!(plugin = %plugin_id, state = %target, reason = %reason, "Plugin halted");
        Ok(())
    }

    /// Move a halted plugin back to `STOPPED` so it can be started again
    pub async fn recover(&self, plugin_id: &str) -> Result<(), LifecycleError> {
        let record = self.record(plugin_id).await?;
        if !record.state.is_halted() {
            return Err(LifecycleError::IllegalStateTransition {
                plugin: plugin_id.to_string(),
                state: record.state,
                action: LifecycleAction::Stop,
            });
        }
        self.registry
            .compare_and_set_state(plugin_id, record.state, PluginState::Stopped, None)
            .await?;
        tracing::info!(plugin = %plugin_id, from = %record.state, "Plugin recovered");
        Ok(())
    }

    async fn record(&self, plugin_id: &str) -> Result<PluginRecord, LifecycleError> {
        self.registry
            .get(plugin_id)
            .await
            .ok_or_else(|| LifecycleError::NotFound(plugin_id.to_string()))
    }

    async fn permitted(
        &self,
        plugin_id: &str,
        action: LifecycleAction,
    ) -> Result<PluginRecord, LifecycleError> {
        let record = self.record(plugin_id).await?;
        if !action.permitted_from(record.state) {
            return Err(LifecycleError::IllegalStateTransition {
                plugin: plugin_id.to_string(),
                state: record.state,
                action,
            });
        }
        Ok(record)
    }

    /// Run a loader call under the deadline
    async fn call<T>(
        &self,
        plugin_id: &str,
        from: PluginState,
        action: LifecycleAction,
        fut: impl Future<Output = Result<T, LoaderError>>,
    ) -> Result<T, LifecycleError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => {
                tracing::error!(plugin = %plugin_id, action = %action, error = %source, "Lifecycle action failed");
                if let Err(e) = self
                    .registry
                    .set_error(plugin_id, Some(format!("{action} failed: {source}")))
                    .await
                {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Failed to record error");
                }
                Err(LifecycleError::Loader {
                    plugin: plugin_id.to_string(),
                    action,
                    source,
                })
            }
            Err(_) => {
                let message = format!("{action} timed out after {:?}", self.timeout);
                tracing::error!(plugin = %plugin_id, action = %action, timeout = ?self.timeout, "Lifecycle action timed out");
                if let Err(e) = self
                    .registry
                    .compare_and_set_state(plugin_id, from, PluginState::Error, Some(message))
                    .await
                {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Failed to mark plugin ERROR");
                }
                Err(LifecycleError::Timeout {
                    plugin: plugin_id.to_string(),
                    action,
                    timeout: self.timeout,
                })
            }
        }
    }

    async fn best_effort<T>(
        &self,
        plugin_id: &str,
        action: LifecycleAction,
        fut: impl Future<Output = Result<T, LoaderError>>,
    ) {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                tracing::warn!(plugin = %plugin_id, action = %action, error = %e, "Ignoring loader failure")
            }
            Err(_) => {
                tracing::warn!(plugin = %plugin_id, action = %action, "Ignoring loader timeout")
            }
        }
    }

    async fn refused(&self, plugin_id: &str, action: LifecycleAction) -> LifecycleError {
        tracing::warn!(plugin = %plugin_id, action = %action, "Plugin refused lifecycle action");
        if let Err(e) = self
            .registry
            .set_error(plugin_id, Some(format!("plugin refused to {action}")))
            .await
        {
            tracing::warn!(plugin = %plugin_id, error = %e, "Failed to record error");
        }
        LifecycleError::Refused {
            plugin: plugin_id.to_string(),
            action,
        }
    }

    async fn finish(
        &self,
        record: &PluginRecord,
        action: LifecycleAction,
    ) -> Result<(), LifecycleError> {
        self.registry
            .compare_and_set_state(record.plugin_id(), record.state, action.target(), None)
            .await?;

        let payload = match action {
            LifecycleAction::Load => match self.registry.get(record.plugin_id()).await {
                Some(loaded) => EventPayload::Data(BTreeMap::from([
                    (
                        "symbolCount".to_string(),
                        loaded.loaded_symbol_count.into(),
                    ),
                    (
                        "resourceCount".to_string(),
                        loaded.loaded_resource_count.into(),
                    ),
                ])),
                None => EventPayload::Empty,
            },
            _ => EventPayload::Empty,
        };
        self.announce(record, action, payload);
        Ok(())
    }

    fn announce(&self, record: &PluginRecord, action: LifecycleAction, payload: EventPayload) {
        self.events.publish(
            EventEnvelope::new(topics::PLUGIN, action.event_kind(), SOURCE)
                .plugin(record.plugin_id())
                .version(record.version())
                .payload(payload),
        );
    }
}

impl fmt::Debug for LifecycleHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHandler")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{LoaderCall, ScriptedLoader};

    fn handler(loader: Arc<ScriptedLoader>) -> LifecycleHandler {
        let bus = EventBus::new();
        LifecycleHandler::new(
            PluginRegistry::new(bus.clone()),
            loader,
            bus,
            Duration::from_millis(200),
        )
    }

    fn desc(id: &str) -> PluginDescriptor {
        PluginDescriptor::new(id, "1.0.0", "main.wasm")
    }

    async fn state(h: &LifecycleHandler, id: &str) -> PluginState {
        h.registry().state(id).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let loader = Arc::new(ScriptedLoader::new());
        let h = handler(loader.clone());

        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();
        assert_eq!(state(&h, "a").await, PluginState::Loaded);
        h.initialize("a").await.unwrap();
        h.start("a").await.unwrap();
        assert_eq!(state(&h, "a").await, PluginState::Started);
        h.stop("a").await.unwrap();
        h.start("a").await.unwrap();
        h.unload("a").await.unwrap();
        assert_eq!(state(&h, "a").await, PluginState::Unloaded);

        assert_eq!(
            loader.calls_for("a"),
            vec![
                LoaderCall::Load,
                LoaderCall::Initialize,
                LoaderCall::Start,
                LoaderCall::Stop,
                LoaderCall::Start,
                LoaderCall::Stop,
                LoaderCall::Unload,
            ]
        );
    }

    #[tokio::test]
    async fn test_actions_outside_their_states_are_rejected() {
        let h = handler(Arc::new(ScriptedLoader::new()));
        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();

        let err = h.start("a").await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::IllegalStateTransition {
                state: PluginState::Loaded,
                action: LifecycleAction::Start,
                ..
            }
        ));
        assert!(matches!(
            h.stop("a").await,
            Err(LifecycleError::IllegalStateTransition { .. })
        ));
        assert_eq!(state(&h, "a").await, PluginState::Loaded);

        h.unload("a").await.unwrap();
        assert!(matches!(
            h.unload("a").await,
            Err(LifecycleError::IllegalStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_loader_failure_keeps_preceding_state() {
        let loader = Arc::new(ScriptedLoader::new());
        loader.fail_on("a", LoaderCall::Initialize);
        let h = handler(loader);

        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();
        let err = h.initialize("a").await.unwrap_err();
        assert!(matches!(err, LifecycleError::Loader { .. }));

        let record = h.registry().get("a").await.unwrap();
        assert_eq!(record.state, PluginState::Loaded);
        assert!(record.error_message.unwrap().contains("initialize failed"));
    }

    #[tokio::test]
    async fn test_timeout_marks_error() {
        let loader = Arc::new(ScriptedLoader::new());
        loader.hang_on("a", LoaderCall::Start);
        let h = handler(loader);

        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();
        h.initialize("a").await.unwrap();
        let err = h.start("a").await.unwrap_err();
        assert!(err.is_timeout());

        let record = h.registry().get("a").await.unwrap();
        assert_eq!(record.state, PluginState::Error);
        assert!(record.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_refusal() {
        let loader = Arc::new(ScriptedLoader::new());
        loader.refuse("a", LoaderCall::Start);
        let h = handler(loader);

        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();
        h.initialize("a").await.unwrap();
        assert!(matches!(
            h.start("a").await,
            Err(LifecycleError::Refused { .. })
        ));
        assert_eq!(state(&h, "a").await, PluginState::Initialized);
    }

    #[tokio::test]
    async fn test_unload_is_best_effort() {
        let loader = Arc::new(ScriptedLoader::new());
        loader.fail_on("a", LoaderCall::Stop);
        loader.hang_on("a", LoaderCall::Unload);
        let h = handler(loader);

        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();
        h.initialize("a").await.unwrap();
        h.start("a").await.unwrap();
        h.unload("a").await.unwrap();
        assert_eq!(state(&h, "a").await, PluginState::Unloaded);
    }

    #[tokio::test]
    async fn test_halt_and_recover() {
        let h = handler(Arc::new(ScriptedLoader::new()));
        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();
        h.initialize("a").await.unwrap();
        h.start("a").await.unwrap();

        h.halt("a", PluginState::ResourceLimited, "over quota")
            .await
            .unwrap();
        let record = h.registry().get("a").await.unwrap();
        assert_eq!(record.state, PluginState::ResourceLimited);
        assert_eq!(record.error_message.as_deref(), Some("over quota"));

        assert!(h.start("a").await.is_err());
        h.recover("a").await.unwrap();
        h.start("a").await.unwrap();
        assert_eq!(state(&h, "a").await, PluginState::Started);
        assert!(h.recover("a").await.is_err());
    }

    #[tokio::test]
    async fn test_reload_over_unloaded_record() {
        let h = handler(Arc::new(ScriptedLoader::new()));
        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();
        assert!(matches!(
            h.load(desc("a"), "/opt/a".into(), None).await,
            Err(LifecycleError::Registry(RegistryError::AlreadyRegistered(_)))
        ));

        h.unload("a").await.unwrap();
        h.load(desc("a"), "/opt/a".into(), None).await.unwrap();
        assert_eq!(state(&h, "a").await, PluginState::Loaded);
    }
}
