//! Canary rollout manager
//!
//! A rollout moves traffic for one plugin from `currentVersion` to
//! `targetVersion` in fixed percentage batches:
//!
//! ```text
//! INITIALIZED -> IN_PROGRESS -> COMPLETED
//!                  |     ^
//!                  v     |
//!                  PAUSED
//! IN_PROGRESS | PAUSED -> FAILED | CANCELLED
//! ```
//!
//! After each batch the manager waits for the validation window and then
//! inspects the health observations of the target version recorded since the
//! batch began. An unhealthy share above the configured threshold fails the
//! rollout and rolls back to `currentVersion`. Reaching 100% promotes the
//! target version. Every transition is published on `plugin.rollout`.

use crate::background::BackgroundTask;
use crate::config::RolloutConfig;
use crate::events::EventBus;
use crate::locks::PluginLocks;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use warden_api::{kinds, topics, EventEnvelope, EventPayload, RolloutState, RolloutStatus};

const SOURCE: &str = "rollout-manager";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors from rollout operations
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("No rollout for plugin: {0}")]
    NotFound(String),

    #[error("Plugin not found: {0}")]
    UnknownPlugin(String),

    #[error("Rollout already active for plugin: {0}")]
    AlreadyActive(String),

    #[error("Batch size must be between 1 and 100, got {0}")]
    InvalidBatchSize(u8),

    #[error("Plugin '{plugin}' already runs version {version}")]
    SameVersion { plugin: String, version: String },

    #[error("Rollout for '{plugin}' cannot go from {from} to {to}")]
    InvalidTransition {
        plugin: String,
        from: RolloutState,
        to: RolloutState,
    },

    #[error("Rollout target failed for '{plugin}': {source}")]
    Target {
        plugin: String,
        #[source]
        source: BoxError,
    },

    #[error("Traffic routing failed for '{plugin}': {reason}")]
    Routing { plugin: String, reason: String },
}

// ============================================================================
// Collaborators
// ============================================================================

/// Stages traffic between plugin versions
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Send `percentage` of traffic for `plugin_id` to `target_version`
    async fn route(
        &self,
        plugin_id: &str,
        target_version: &str,
        percentage: u8,
    ) -> Result<(), RolloutError>;
}

/// Router for hosts without staged routing; promotion happens at 100%
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTrafficRouter;

#[async_trait]
impl TrafficRouter for NoopTrafficRouter {
    async fn route(
        &self,
        plugin_id: &str,
        target_version: &str,
        percentage: u8,
    ) -> Result<(), RolloutError> {
        tracing::debug!(plugin = %plugin_id, target = %target_version, percentage, "Traffic staged");
        Ok(())
    }
}

/// Swaps plugin versions on behalf of the rollout manager
#[async_trait]
pub trait RolloutTarget: Send + Sync {
    async fn current_version(&self, plugin_id: &str) -> Option<String>;

    /// Make `version` (from `package`) the running version
    async fn promote(&self, plugin_id: &str, version: &str, package: &Path)
        -> Result<(), BoxError>;

    /// Make sure `version` is the running version again
    async fn rollback(&self, plugin_id: &str, version: &str) -> Result<(), BoxError>;
}

/// Health data consulted during validation windows
#[async_trait]
pub trait RolloutHealth: Send + Sync {
    /// Share of unhealthy observations of `version` since `since`, `None`
    /// when nothing was observed
    async fn unhealthy_ratio(
        &self,
        plugin_id: &str,
        version: &str,
        since: DateTime<Utc>,
    ) -> Option<f64>;
}

// ============================================================================
// Manager
// ============================================================================

/// Request to start a rollout
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RolloutRequest {
    pub plugin_id: String,
    pub target_version: String,
    pub package_path: PathBuf,
    pub batch_size_percent: Option<u8>,
    pub validate_window: Option<Duration>,
    pub metadata: BTreeMap<String, String>,
}

impl RolloutRequest {
    pub fn new(
        plugin_id: impl Into<String>,
        target_version: impl Into<String>,
        package_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            target_version: target_version.into(),
            package_path: package_path.into(),
            batch_size_percent: None,
            validate_window: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_batch_size(mut self, percent: u8) -> Self {
        self.batch_size_percent = Some(percent);
        self
    }

    pub fn with_validate_window(mut self, window: Duration) -> Self {
        self.validate_window = Some(window);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
struct Rollout {
    status: RolloutStatus,
    package_path: PathBuf,
    validate_window: Duration,
}

struct ManagerInner {
    target: Arc<dyn RolloutTarget>,
    health: Arc<dyn RolloutHealth>,
    router: Arc<dyn TrafficRouter>,
    events: EventBus,
    config: RolloutConfig,
    locks: PluginLocks,
    rollouts: Mutex<HashMap<String, Rollout>>,
}

/// Drives canary rollouts
#[derive(Clone)]
pub struct RolloutManager {
    inner: Arc<ManagerInner>,
}

impl RolloutManager {
    pub fn new(
        target: Arc<dyn RolloutTarget>,
        health: Arc<dyn RolloutHealth>,
        events: EventBus,
        config: RolloutConfig,
    ) -> Self {
        Self::with_router(target, health, Arc::new(NoopTrafficRouter), events, config)
    }

    pub fn with_router(
        target: Arc<dyn RolloutTarget>,
        health: Arc<dyn RolloutHealth>,
        router: Arc<dyn TrafficRouter>,
        events: EventBus,
        config: RolloutConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                target,
                health,
                router,
                events,
                config,
                locks: PluginLocks::new(),
                rollouts: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn rollouts(&self) -> MutexGuard<'_, HashMap<String, Rollout>> {
        self.inner.rollouts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn load(&self, plugin_id: &str) -> Result<Rollout, RolloutError> {
        self.rollouts()
            .get(plugin_id)
            .cloned()
            .ok_or_else(|| RolloutError::NotFound(plugin_id.to_string()))
    }

    fn store(&self, rollout: &Rollout) {
        self.rollouts()
            .insert(rollout.status.plugin_id.clone(), rollout.clone());
    }

    /// Create a rollout in `INITIALIZED`
    pub async fn start_rollout(&self, request: RolloutRequest) -> Result<RolloutStatus, RolloutError> {
        let plugin_id = request.plugin_id.clone();
        let _guard = self.inner.locks.acquire(&plugin_id).await;

        if let Some(existing) = self.rollouts().get(&plugin_id) {
            if existing.status.state.is_active() {
                return Err(RolloutError::AlreadyActive(plugin_id));
            }
        }

        let batch = request
            .batch_size_percent
            .unwrap_or(self.inner.config.default_batch_size_percent);
        if batch == 0 || batch > 100 {
            return Err(RolloutError::InvalidBatchSize(batch));
        }

        let current_version = self
            .inner
            .target
            .current_version(&plugin_id)
            .await
            .ok_or_else(|| RolloutError::UnknownPlugin(plugin_id.clone()))?;
        if current_version == request.target_version {
            return Err(RolloutError::SameVersion {
                plugin: plugin_id,
                version: current_version,
            });
        }

        let window = request
            .validate_window
            .unwrap_or(self.inner.config.default_validate_window);
        let now = Utc::now();
        let rollout = Rollout {
            status: RolloutStatus {
                plugin_id: plugin_id.clone(),
                current_version,
                target_version: request.target_version,
                batch_size_percent: batch,
                validate_window_minutes: window.as_secs().div_ceil(60),
                current_batch: 0,
                current_percentage: 0,
                state: RolloutState::Initialized,
                created_at: now,
                updated_at: now,
                last_batch_at: None,
                finished_at: None,
                metadata: request.metadata,
            },
            package_path: request.package_path,
            validate_window: window,
        };

        self.store(&rollout);
        tracing::info!(
            plugin = %plugin_id,
            from = %rollout.status.current_version,
            to = %rollout.status.target_version,
            batch,
            "Rollout created"
        );
        self.publish(kinds::ROLLOUT_STARTED, &rollout.status, None);
        Ok(rollout.status)
    }

    /// Move to the next batch.
    ///
    /// From `INITIALIZED` this stages the first batch. From `IN_PROGRESS` the
    /// health of the current batch is validated first; a failed validation
    /// ends the rollout in `FAILED`.
    pub async fn advance(&self, plugin_id: &str) -> Result<RolloutStatus, RolloutError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        self.advance_locked(plugin_id).await
    }

    async fn advance_locked(&self, plugin_id: &str) -> Result<RolloutStatus, RolloutError> {
        let mut rollout = self.load(plugin_id)?;
        let state = rollout.status.state;
        if !matches!(state, RolloutState::Initialized | RolloutState::InProgress) {
            return Err(RolloutError::InvalidTransition {
                plugin: plugin_id.to_string(),
                from: state,
                to: RolloutState::InProgress,
            });
        }

        if state == RolloutState::InProgress {
            if let Some(reason) = self.validation_failure(&rollout).await {
                return Ok(self.fail(rollout, reason).await);
            }
        }

        let status = &mut rollout.status;
        let next = status
            .current_percentage
            .saturating_add(status.batch_size_percent)
            .min(100);
        self.inner
            .router
            .route(plugin_id, &status.target_version, next)
            .await?;

        let now = Utc::now();
        status.state = RolloutState::InProgress;
        status.current_batch += 1;
        status.current_percentage = next;
        status.last_batch_at = Some(now);
        status.updated_at = now;
        tracing::info!(
            plugin = %plugin_id,
            batch = status.current_batch,
            percentage = next,
            "Rollout batch advanced"
        );
        self.store(&rollout);
        self.publish(kinds::BATCH_ADVANCED, &rollout.status, None);

        if next == 100 {
            return Ok(self.complete(rollout).await);
        }
        Ok(rollout.status)
    }

    async fn validation_failure(&self, rollout: &Rollout) -> Option<String> {
        let status = &rollout.status;
        let since = status.last_batch_at.unwrap_or(status.created_at);
        let ratio = self
            .inner
            .health
            .unhealthy_ratio(&status.plugin_id, &status.target_version, since)
            .await?;
        let threshold = self.inner.config.unhealthy_ratio_threshold;
        (ratio > threshold).then(|| {
            format!(
                "unhealthy ratio {:.2} exceeds {:.2} at {}%",
                ratio, threshold, status.current_percentage
            )
        })
    }

    async fn complete(&self, mut rollout: Rollout) -> RolloutStatus {
        let plugin_id = rollout.status.plugin_id.clone();
        let target_version = rollout.status.target_version.clone();
        if let Err(e) = self
            .inner
            .target
            .promote(&plugin_id, &target_version, &rollout.package_path)
            .await
        {
            return self.fail(rollout, format!("promotion failed: {e}")).await;
        }

        let now = Utc::now();
        let status = &mut rollout.status;
        status.current_version = target_version;
        status.state = RolloutState::Completed;
        status.updated_at = now;
        status.finished_at = Some(now);
        self.store(&rollout);

        tracing::info!(plugin = %plugin_id, version = %rollout.status.current_version, "Rollout completed");
        self.publish(kinds::ROLLOUT_COMPLETED, &rollout.status, None);
        rollout.status
    }

    /// End the rollout in `FAILED` and roll back to the current version
    async fn fail(&self, mut rollout: Rollout, reason: String) -> RolloutStatus {
        let plugin_id = rollout.status.plugin_id.clone();
        let now = Utc::now();
        rollout.status.state = RolloutState::Failed;
        rollout.status.updated_at = now;
        rollout.status.finished_at = Some(now);
        self.store(&rollout);

        tracing::warn!(plugin = %plugin_id, reason = %reason, "Rollout failed");
        self.publish(kinds::ROLLOUT_FAILED, &rollout.status, Some(reason));

        if let Err(e) = self
            .inner
            .router
            .route(&plugin_id, &rollout.status.target_version, 0)
            .await
        {
            tracing::warn!(plugin = %plugin_id, error = %e, "Failed to withdraw canary traffic");
        }
        let current = rollout.status.current_version.clone();
        match self.inner.target.rollback(&plugin_id, &current).await {
            Ok(()) => {
                tracing::info!(plugin = %plugin_id, version = %current, "Rolled back");
                self.publish(
                    kinds::ROLLED_BACK,
                    &rollout.status,
                    Some(format!("rolled back to {current}")),
                );
            }
            Err(e) => {
                tracing::error!(plugin = %plugin_id, version = %current, error = %e, "Rollback failed")
            }
        }
        rollout.status
    }

    pub async fn pause(&self, plugin_id: &str) -> Result<RolloutStatus, RolloutError> {
        self.transition(plugin_id, RolloutState::Paused, kinds::ROLLOUT_PAUSED)
            .await
    }

    /// Resume a paused rollout; its validation window restarts
    pub async fn resume(&self, plugin_id: &str) -> Result<RolloutStatus, RolloutError> {
        self.transition(plugin_id, RolloutState::InProgress, kinds::ROLLOUT_RESUMED)
            .await
    }

    /// Abandon the rollout; canary traffic is withdrawn
    pub async fn cancel(&self, plugin_id: &str) -> Result<RolloutStatus, RolloutError> {
        let status = self
            .transition(plugin_id, RolloutState::Cancelled, kinds::ROLLOUT_CANCELLED)
            .await?;
        if let Err(e) = self
            .inner
            .router
            .route(plugin_id, &status.target_version, 0)
            .await
        {
            tracing::warn!(plugin = %plugin_id, error = %e, "Failed to withdraw canary traffic");
        }
        Ok(status)
    }

    async fn transition(
        &self,
        plugin_id: &str,
        to: RolloutState,
        kind: &str,
    ) -> Result<RolloutStatus, RolloutError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        let mut rollout = self.load(plugin_id)?;
        let from = rollout.status.state;
        // Resuming is the only way back into IN_PROGRESS from PAUSED
        let allowed = from != to && from.can_transition_to(to);
        if !allowed || (to == RolloutState::InProgress && from != RolloutState::Paused) {
            return Err(RolloutError::InvalidTransition {
                plugin: plugin_id.to_string(),
                from,
                to,
            });
        }

        let now = Utc::now();
        rollout.status.state = to;
        rollout.status.updated_at = now;
        match to {
            RolloutState::InProgress => rollout.status.last_batch_at = Some(now),
            RolloutState::Cancelled => rollout.status.finished_at = Some(now),
            _ => {}
        }
        self.store(&rollout);

        tracing::info!(plugin = %plugin_id, from = %from, to = %to, "Rollout state changed");
        self.publish(kind, &rollout.status, None);
        Ok(rollout.status)
    }

    /// One scheduler pass.
    ///
    /// Starts `INITIALIZED` rollouts, fails `IN_PROGRESS` rollouts whose
    /// batch is unhealthy and advances those whose validation window has
    /// elapsed. Returns the statuses that changed.
    pub async fn tick(&self) -> Vec<RolloutStatus> {
        let candidates: Vec<Rollout> = self
            .rollouts()
            .values()
            .filter(|r| {
                matches!(
                    r.status.state,
                    RolloutState::Initialized | RolloutState::InProgress
                )
            })
            .cloned()
            .collect();

        let mut changed = Vec::new();
        for candidate in candidates {
            let plugin_id = candidate.status.plugin_id.clone();
            let Some(_guard) = self.inner.locks.try_acquire(&plugin_id) else {
                continue;
            };
            let Ok(rollout) = self.load(&plugin_id) else {
                continue;
            };

            let result = match rollout.status.state {
                RolloutState::Initialized => self.advance_locked(&plugin_id).await,
                RolloutState::InProgress => {
                    if let Some(reason) = self.validation_failure(&rollout).await {
                        Ok(self.fail(rollout, reason).await)
                    } else if window_elapsed(&rollout) {
                        self.advance_locked(&plugin_id).await
                    } else {
                        continue;
                    }
                }
                _ => continue,
            };

            match result {
                Ok(status) => changed.push(status),
                Err(e) => tracing::warn!(plugin = %plugin_id, error = %e, "Rollout tick failed"),
            }
        }
        changed
    }

    /// Run [`tick`](Self::tick) every `config.tick_interval`
    pub fn spawn(&self) -> BackgroundTask {
        let manager = self.clone();
        BackgroundTask::every("rollout-manager", self.inner.config.tick_interval, move || {
            let manager = manager.clone();
            async move {
                manager.tick().await;
            }
        })
    }

    pub fn status(&self, plugin_id: &str) -> Option<RolloutStatus> {
        self.rollouts().get(plugin_id).map(|r| r.status.clone())
    }

    pub fn statuses(&self) -> Vec<RolloutStatus> {
        let mut statuses: Vec<_> = self.rollouts().values().map(|r| r.status.clone()).collect();
        statuses.sort_by(|a, b| a.plugin_id.cmp(&b.plugin_id));
        statuses
    }

    fn publish(&self, kind: &str, status: &RolloutStatus, reason: Option<String>) {
        let version = if kind == kinds::ROLLED_BACK {
            &status.current_version
        } else {
            &status.target_version
        };
        self.inner.events.publish(
            EventEnvelope::new(topics::ROLLOUT, kind, SOURCE)
                .plugin(status.plugin_id.clone())
                .version(version.clone())
                .payload(EventPayload::Rollout {
                    state: status.state,
                    current_version: status.current_version.clone(),
                    target_version: status.target_version.clone(),
                    current_batch: status.current_batch,
                    percentage: status.current_percentage,
                    reason,
                }),
        );
    }
}

fn window_elapsed(rollout: &Rollout) -> bool {
    let Some(last) = rollout.status.last_batch_at else {
        return true;
    };
    (Utc::now() - last)
        .to_std()
        .is_ok_and(|elapsed| elapsed >= rollout.validate_window)
}

impl std::fmt::Debug for RolloutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RolloutManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
