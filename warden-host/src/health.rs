//! Health monitor and resource throttle
//!
//! Every sweep samples each `STARTED` plugin through a [`ResourceSampler`],
//! keeps a short per-metric history for trend detection and counts critical
//! threshold crossings. Accumulated violations escalate the plugin's
//! restriction level:
//!
//! | total violations | level      | effect                                   |
//! |------------------|------------|------------------------------------------|
//! | `mild_after`     | `MILD`     | flagged                                  |
//! | `severe_after`   | `SEVERE`   | flagged, reduced quota requested         |
//! | `suspend_after`  | `SUSPEND`  | stopped and parked in `RESOURCE_LIMITED` |
//!
//! Levels only rise until [`HealthMonitor::reset_resource_restriction`].
//! A probe that does not answer within the probe timeout marks the plugin
//! `ERROR`.

use crate::background::BackgroundTask;
use crate::config::HealthConfig;
use crate::events::EventBus;
use crate::lifecycle::{LifecycleError, LifecycleHandler};
use crate::locks::PluginLocks;
use crate::registry::PluginRegistry;
use crate::rollout::RolloutHealth;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use warden_api::{
    kinds, topics, EventEnvelope, EventPayload, PluginHealthSnapshot, PluginRecord, PluginState,
    ResourceKind, ResourceSample, ResourceViolationRecord, RestrictionLevel, Trend,
};

const SOURCE: &str = "health-monitor";
const MAX_OBSERVATIONS: usize = 512;

// ============================================================================
// Sampler boundary
// ============================================================================

/// Error returned by a resource sampler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SampleError {
    #[error("No resource data for plugin: {0}")]
    Unknown(String),

    #[error("Sampling failed: {0}")]
    Failed(String),
}

/// Source of per-plugin resource usage
#[async_trait]
pub trait ResourceSampler: Send + Sync {
    async fn sample(&self, plugin_id: &str) -> Result<ResourceSample, SampleError>;
}

// ============================================================================
// Thresholds & history
// ============================================================================

/// Warning and critical level for one resource
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub warning: f64,
    pub critical: f64,
}

impl Threshold {
    pub const fn new(warning: f64, critical: f64) -> Self {
        Self { warning, critical }
    }
}

/// Thresholds for every sampled resource
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceThresholds {
    pub cpu_percent: Threshold,
    pub memory_mb: Threshold,
    pub threads: Threshold,
    pub file_descriptors: Threshold,
    pub net_connections: Threshold,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_percent: Threshold::new(70.0, 90.0),
            memory_mb: Threshold::new(256.0, 512.0),
            threads: Threshold::new(100.0, 200.0),
            file_descriptors: Threshold::new(500.0, 1000.0),
            net_connections: Threshold::new(200.0, 500.0),
        }
    }
}

impl ResourceThresholds {
    pub fn get(&self, kind: ResourceKind) -> Threshold {
        match kind {
            ResourceKind::Cpu => self.cpu_percent,
            ResourceKind::Memory => self.memory_mb,
            ResourceKind::Threads => self.threads,
            ResourceKind::FileDescriptors => self.file_descriptors,
            ResourceKind::NetConnections => self.net_connections,
        }
    }

    pub fn with(mut self, kind: ResourceKind, threshold: Threshold) -> Self {
        let slot = match kind {
            ResourceKind::Cpu => &mut self.cpu_percent,
            ResourceKind::Memory => &mut self.memory_mb,
            ResourceKind::Threads => &mut self.threads,
            ResourceKind::FileDescriptors => &mut self.file_descriptors,
            ResourceKind::NetConnections => &mut self.net_connections,
        };
        *slot = threshold;
        self
    }
}

/// Fixed-size ring of recent values
#[derive(Debug, Clone)]
pub struct MetricHistory {
    samples: VecDeque<f64>,
    capacity: usize,
}

impl MetricHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(value);
    }

    pub fn latest(&self) -> Option<f64> {
        self.samples.back().copied()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Direction from the oldest to the newest sample, ignoring changes
    /// under 5%
    pub fn trend(&self) -> Trend {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return Trend::Flat;
        };
        if self.samples.len() < 2 {
            return Trend::Flat;
        }
        let tolerance = first.abs().max(1.0) * 0.05;
        let delta = last - first;
        if delta > tolerance {
            Trend::Increasing
        } else if delta < -tolerance {
            Trend::Decreasing
        } else {
            Trend::Flat
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Errors from health operations
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),
}

/// Result of [`HealthMonitor::reset_resource_restriction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    pub previous: RestrictionLevel,
    /// The plugin was suspended and started again
    pub restarted: bool,
}

struct PluginHealth {
    snapshot: PluginHealthSnapshot,
    cpu: MetricHistory,
    memory: MetricHistory,
    threads: MetricHistory,
    violations: ResourceViolationRecord,
}

impl PluginHealth {
    fn new(record: &PluginRecord, history_len: usize) -> Self {
        Self {
            snapshot: PluginHealthSnapshot::new(record.plugin_id(), record.version(), record.state),
            cpu: MetricHistory::new(history_len),
            memory: MetricHistory::new(history_len),
            threads: MetricHistory::new(history_len),
            violations: ResourceViolationRecord::new(record.plugin_id()),
        }
    }
}

struct Observation {
    at: DateTime<Utc>,
    version: String,
    healthy: bool,
}

#[derive(Default)]
struct MonitorState {
    plugins: HashMap<String, PluginHealth>,
    observations: HashMap<String, VecDeque<Observation>>,
}

impl MonitorState {
    fn entry(&mut self, record: &PluginRecord, history_len: usize) -> &mut PluginHealth {
        let health = self
            .plugins
            .entry(record.plugin_id().to_string())
            .or_insert_with(|| PluginHealth::new(record, history_len));
        health.snapshot.version = record.version().to_string();
        health.snapshot.state = record.state;
        health
    }

    fn observe(&mut self, plugin_id: &str, version: &str, healthy: bool, at: DateTime<Utc>) {
        let log = self.observations.entry(plugin_id.to_string()).or_default();
        if log.len() == MAX_OBSERVATIONS {
            log.pop_front();
        }
        log.push_back(Observation {
            at,
            version: version.to_string(),
            healthy,
        });
    }
}

/// Outcome of evaluating one sample
struct Evaluation {
    violations: Vec<(ResourceKind, f64, f64)>,
    total: u32,
    previous: RestrictionLevel,
    current: RestrictionLevel,
}

struct MonitorInner {
    lifecycle: LifecycleHandler,
    sampler: Arc<dyn ResourceSampler>,
    events: EventBus,
    locks: PluginLocks,
    config: HealthConfig,
    probe_timeout: Duration,
    state: Mutex<MonitorState>,
}

/// Periodic health sampling and restriction escalation
#[derive(Clone)]
pub struct HealthMonitor {
    inner: Arc<MonitorInner>,
}

impl HealthMonitor {
    pub fn new(
        lifecycle: LifecycleHandler,
        sampler: Arc<dyn ResourceSampler>,
        events: EventBus,
        locks: PluginLocks,
        config: HealthConfig,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                lifecycle,
                sampler,
                events,
                locks,
                config,
                probe_timeout,
                state: Mutex::new(MonitorState::default()),
            }),
        }
    }

    pub fn config(&self) -> &HealthConfig {
        &self.inner.config
    }

    fn registry(&self) -> &PluginRegistry {
        self.inner.lifecycle.registry()
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run the sweep every `config.interval`
    pub fn spawn(&self) -> BackgroundTask {
        let monitor = self.clone();
        BackgroundTask::every("health-monitor", self.inner.config.interval, move || {
            let monitor = monitor.clone();
            async move {
                monitor.check_all().await;
            }
        })
    }

    /// Check every `STARTED` plugin once.
    ///
    /// Plugins with an operation in flight are skipped this round.
    pub async fn check_all(&self) -> Vec<PluginHealthSnapshot> {
        let records = self.registry().all_plugins().await;
        {
            let known: HashSet<&str> = records.iter().map(|r| r.plugin_id()).collect();
            let mut state = self.state();
            state.plugins.retain(|id, _| known.contains(id.as_str()));
            state
                .observations
                .retain(|id, _| known.contains(id.as_str()));
        }

        let mut checked = Vec::new();
        for record in records.iter().filter(|r| r.state == PluginState::Started) {
            let Some(_guard) = self.inner.locks.try_acquire(record.plugin_id()) else {
                tracing::debug!(plugin = %record.plugin_id(), "Plugin busy, skipping health check");
                continue;
            };
            match self.check_locked(record.plugin_id()).await {
                Ok(snapshot) => checked.push(snapshot),
                Err(e) => {
                    tracing::warn!(plugin = %record.plugin_id(), error = %e, "Health check failed")
                }
            }
        }
        checked
    }

    /// Check one plugin now
    pub async fn check_plugin(&self, plugin_id: &str) -> Result<PluginHealthSnapshot, HealthError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        self.check_locked(plugin_id).await
    }

    async fn check_locked(&self, plugin_id: &str) -> Result<PluginHealthSnapshot, HealthError> {
        let record = self.record(plugin_id).await?;
        let history_len = self.inner.config.history_len;

        if record.state != PluginState::Started {
            let mut state = self.state();
            let health = state.entry(&record, history_len);
            health.snapshot.checked_at = Utc::now();
            return Ok(health.snapshot.clone());
        }

        let probe =
            tokio::time::timeout(self.inner.probe_timeout, self.inner.sampler.sample(plugin_id))
                .await;

        let sample = match probe {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                tracing::warn!(plugin = %plugin_id, error = %e, "Resource sample failed");
                return Ok(self.mark_unhealthy(&record, e.to_string()));
            }
            Err(_) => {
                let reason = "health probe timed out";
                tracing::error!(plugin = %plugin_id, timeout = ?self.inner.probe_timeout, "Health probe timed out");
                self.mark_unhealthy(&record, reason.to_string());
                if let Err(e) = self
                    .inner
                    .lifecycle
                    .halt(plugin_id, PluginState::Error, reason)
                    .await
                {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Failed to halt unresponsive plugin");
                }
                return self.refresh_and_publish(plugin_id).await;
            }
        };

        let evaluation = self.evaluate(&record, &sample);

        for (kind, value, threshold) in &evaluation.violations {
            tracing::warn!(
                plugin = %plugin_id,
                resource = %kind,
                value,
                threshold,
                total = evaluation.total,
                "Resource violation"
            );
            self.publish(
                kinds::RESOURCE_VIOLATION,
                &record,
                EventPayload::ResourceViolation {
                    resource: *kind,
                    value: *value,
                    threshold: *threshold,
                    total_violations: evaluation.total,
                    restriction: evaluation.current,
                },
            );
        }

        if evaluation.current != evaluation.previous {
            tracing::warn!(
                plugin = %plugin_id,
                from = %evaluation.previous,
                to = %evaluation.current,
                "Resource restriction escalated"
            );
            if evaluation.current == RestrictionLevel::Severe {
                tracing::warn!(plugin = %plugin_id, "Reduced resource quota requested");
            }
            self.publish(
                kinds::RESTRICTION_CHANGED,
                &record,
                EventPayload::Restriction {
                    previous: evaluation.previous,
                    current: evaluation.current,
                },
            );
        }

        if evaluation.current == RestrictionLevel::Suspend {
            let reason = format!("suspended after {} resource violations", evaluation.total);
            self.inner
                .lifecycle
                .halt(plugin_id, PluginState::ResourceLimited, reason)
                .await?;
            self.publish(
                kinds::SUSPENDED,
                &record,
                EventPayload::Restriction {
                    previous: evaluation.previous,
                    current: evaluation.current,
                },
            );
        }

        self.refresh_and_publish(plugin_id).await
    }

    /// Fold a sample into the plugin's history and counters
    fn evaluate(&self, record: &PluginRecord, sample: &ResourceSample) -> Evaluation {
        let config = &self.inner.config;
        let now = Utc::now();
        let mut state = self.state();
        let health = state.entry(record, config.history_len);

        health.cpu.push(sample.cpu_percent);
        health.memory.push(sample.memory_mb);
        health.threads.push(sample.thread_count as f64);

        let mut violations = Vec::new();
        for kind in ResourceKind::ALL {
            let value = sample.value(kind);
            let threshold = config.thresholds.get(kind);
            if value >= threshold.critical {
                health.violations.record(kind);
                violations.push((kind, value, threshold.critical));
            } else if value >= threshold.warning {
                tracing::debug!(plugin = %record.plugin_id(), resource = %kind, value, "Resource above warning level");
            }
        }

        let total = health.violations.total();
        let previous = health.violations.restriction;
        let current = previous.max(escalation_level(total, config));
        health.violations.restriction = current;

        let snapshot = &mut health.snapshot;
        snapshot.last_sample = Some(*sample);
        snapshot.cpu_trend = health.cpu.trend();
        snapshot.memory_trend = health.memory.trend();
        snapshot.thread_trend = health.threads.trend();
        snapshot.restriction = current;
        snapshot.healthy = violations.is_empty() && current < RestrictionLevel::Suspend;
        snapshot.checked_at = now;
        let healthy = snapshot.healthy;

        tracing::debug!(
            plugin = %record.plugin_id(),
            cpu = sample.cpu_percent,
            memory_mb = sample.memory_mb,
            threads = sample.thread_count,
            healthy,
            "Health sample"
        );

        state.observe(record.plugin_id(), record.version(), healthy, now);
        Evaluation {
            violations,
            total,
            previous,
            current,
        }
    }

    fn mark_unhealthy(&self, record: &PluginRecord, reason: String) -> PluginHealthSnapshot {
        let now = Utc::now();
        let mut state = self.state();
        let health = state.entry(record, self.inner.config.history_len);
        health.snapshot.healthy = false;
        health.snapshot.last_error = Some(reason);
        health.snapshot.checked_at = now;
        let snapshot = health.snapshot.clone();
        state.observe(record.plugin_id(), record.version(), false, now);
        snapshot
    }

    /// Re-read the registry state into the snapshot and announce it
    async fn refresh_and_publish(
        &self,
        plugin_id: &str,
    ) -> Result<PluginHealthSnapshot, HealthError> {
        let record = self.record(plugin_id).await?;
        let snapshot = {
            let mut state = self.state();
            state
                .entry(&record, self.inner.config.history_len)
                .snapshot
                .clone()
        };
        self.publish(
            kinds::HEALTH_CHECK,
            &record,
            EventPayload::Health(snapshot.clone()),
        );
        Ok(snapshot)
    }

    /// Clear violation counters and restriction level.
    ///
    /// A plugin parked in `RESOURCE_LIMITED` is moved to `STOPPED` and started
    /// again.
    pub async fn reset_resource_restriction(
        &self,
        plugin_id: &str,
    ) -> Result<ResetOutcome, HealthError> {
        let _guard = self.inner.locks.acquire(plugin_id).await;
        let record = self.record(plugin_id).await?;

        let previous = {
            let mut state = self.state();
            let health = state.entry(&record, self.inner.config.history_len);
            let previous = health.violations.restriction;
            health.violations = ResourceViolationRecord::new(plugin_id);
            health.snapshot.restriction = RestrictionLevel::None;
            previous
        };
        self.publish(
            kinds::RESTRICTION_RESET,
            &record,
            EventPayload::Restriction {
                previous,
                current: RestrictionLevel::None,
            },
        );
        tracing::info!(plugin = %plugin_id, previous = %previous, "Resource restriction reset");

        let mut restarted = false;
        if record.state == PluginState::ResourceLimited {
            self.inner.lifecycle.recover(plugin_id).await?;
            match self.inner.lifecycle.start(plugin_id).await {
                Ok(()) => restarted = true,
                Err(e) => {
                    tracing::warn!(plugin = %plugin_id, error = %e, "Restart after reset failed")
                }
            }
        }

        let record = self.record(plugin_id).await?;
        {
            let mut state = self.state();
            let health = state.entry(&record, self.inner.config.history_len);
            health.snapshot.healthy = true;
        }
        Ok(ResetOutcome {
            previous,
            restarted,
        })
    }

    /// Count an error reported for a plugin.
    ///
    /// Reaching `isolate_after_consecutive_errors` isolates a running plugin.
    pub async fn record_error(
        &self,
        plugin_id: &str,
        message: impl Into<String>,
    ) -> Result<PluginHealthSnapshot, HealthError> {
        let message = message.into();
        let _guard = self.inner.locks.acquire(plugin_id).await;
        let record = self.record(plugin_id).await?;

        let consecutive = {
            let mut state = self.state();
            let health = state.entry(&record, self.inner.config.history_len);
            let snapshot = &mut health.snapshot;
            snapshot.consecutive_errors = snapshot.consecutive_errors.saturating_add(1);
            snapshot.total_errors = snapshot.total_errors.saturating_add(1);
            snapshot.last_error = Some(message.clone());
            snapshot.consecutive_errors
        };
        tracing::debug!(plugin = %plugin_id, consecutive, error = %message, "Plugin error recorded");

        let threshold = self.inner.config.isolate_after_consecutive_errors;
        if threshold > 0 && consecutive >= threshold && record.state == PluginState::Started {
            let reason = format!("isolated after {consecutive} consecutive errors: {message}");
            self.inner
                .lifecycle
                .halt(plugin_id, PluginState::Isolated, reason.clone())
                .await?;
            self.publish(
                kinds::ISOLATED,
                &record,
                EventPayload::StateChange {
                    from: record.state,
                    to: PluginState::Isolated,
                    message: Some(reason),
                },
            );
        }

        let record = self.record(plugin_id).await?;
        let mut state = self.state();
        Ok(state
            .entry(&record, self.inner.config.history_len)
            .snapshot
            .clone())
    }

    /// Reset the consecutive error count
    pub fn record_success(&self, plugin_id: &str) {
        let mut state = self.state();
        if let Some(health) = state.plugins.get_mut(plugin_id) {
            health.snapshot.consecutive_errors = 0;
        }
    }

    /// Ingest a snapshot produced elsewhere (e.g. by a canary instance)
    pub fn report_instance(&self, snapshot: PluginHealthSnapshot) {
        {
            let mut state = self.state();
            state.observe(
                &snapshot.plugin_id,
                &snapshot.version,
                !snapshot.is_unhealthy(),
                snapshot.checked_at,
            );
        }
        self.inner.events.publish(
            EventEnvelope::new(topics::HEALTH, kinds::HEALTH_CHECK, "instance")
                .plugin(snapshot.plugin_id.clone())
                .version(snapshot.version.clone())
                .payload(EventPayload::Health(snapshot)),
        );
    }

    /// Latest snapshot, with the current registry state
    pub async fn snapshot(&self, plugin_id: &str) -> Option<PluginHealthSnapshot> {
        let record = self.registry().get(plugin_id).await?;
        Some(self.snapshot_for(&record))
    }

    /// Snapshots for every registered plugin
    pub async fn snapshots(&self) -> Vec<PluginHealthSnapshot> {
        let records = self.registry().all_plugins().await;
        records.iter().map(|r| self.snapshot_for(r)).collect()
    }

    /// Plugins that are `ERROR`, `ISOLATED` or failed their last check
    pub async fn unhealthy_snapshots(&self) -> Vec<PluginHealthSnapshot> {
        let mut snapshots = self.snapshots().await;
        snapshots.retain(PluginHealthSnapshot::is_unhealthy);
        snapshots
    }

    pub fn restriction(&self, plugin_id: &str) -> RestrictionLevel {
        self.state()
            .plugins
            .get(plugin_id)
            .map(|h| h.violations.restriction)
            .unwrap_or_default()
    }

    pub fn violations(&self, plugin_id: &str) -> Option<ResourceViolationRecord> {
        self.state()
            .plugins
            .get(plugin_id)
            .map(|h| h.violations.clone())
    }

    fn snapshot_for(&self, record: &PluginRecord) -> PluginHealthSnapshot {
        let state = self.state();
        let mut snapshot = state
            .plugins
            .get(record.plugin_id())
            .map(|h| h.snapshot.clone())
            .unwrap_or_else(|| {
                PluginHealthSnapshot::new(record.plugin_id(), record.version(), record.state)
            });
        snapshot.state = record.state;
        snapshot.version = record.version().to_string();
        snapshot
    }

    async fn record(&self, plugin_id: &str) -> Result<PluginRecord, HealthError> {
        self.registry()
            .get(plugin_id)
            .await
            .ok_or_else(|| HealthError::NotFound(plugin_id.to_string()))
    }

    fn publish(&self, kind: &str, record: &PluginRecord, payload: EventPayload) {
        self.inner.events.publish(
            EventEnvelope::new(topics::HEALTH, kind, SOURCE)
                .plugin(record.plugin_id())
                .version(record.version())
                .payload(payload),
        );
    }
}

#[async_trait]
impl RolloutHealth for HealthMonitor {
    async fn unhealthy_ratio(
        &self,
        plugin_id: &str,
        version: &str,
        since: DateTime<Utc>,
    ) -> Option<f64> {
        let state = self.state();
        let log = state.observations.get(plugin_id)?;
        let (total, unhealthy) = log
            .iter()
            .filter(|o| o.at >= since && o.version == version)
            .fold((0usize, 0usize), |(total, bad), o| {
                (total + 1, bad + usize::from(!o.healthy))
            });
        (total > 0).then(|| unhealthy as f64 / total as f64)
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn escalation_level(total: u32, config: &HealthConfig) -> RestrictionLevel {
    if total >= config.suspend_after {
        RestrictionLevel::Suspend
    } else if total >= config.severe_after {
        RestrictionLevel::Severe
    } else if total >= config.mild_after {
        RestrictionLevel::Mild
    } else {
        RestrictionLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let mut history = MetricHistory::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            history.push(v);
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.latest(), Some(4.0));
    }

    #[test]
    fn test_trend_detection() {
        let mut rising = MetricHistory::new(5);
        for v in [100.0, 120.0, 150.0] {
            rising.push(v);
        }
        assert_eq!(rising.trend(), Trend::Increasing);

        let mut steady = MetricHistory::new(5);
        for v in [100.0, 101.0, 102.0] {
            steady.push(v);
        }
        assert_eq!(steady.trend(), Trend::Flat);

        let mut falling = MetricHistory::new(5);
        for v in [50.0, 10.0] {
            falling.push(v);
        }
        assert_eq!(falling.trend(), Trend::Decreasing);

        assert_eq!(MetricHistory::new(5).trend(), Trend::Flat);
    }

    #[test]
    fn test_escalation_ladder() {
        let config = HealthConfig::default();
        assert_eq!(escalation_level(2, &config), RestrictionLevel::None);
        assert_eq!(escalation_level(3, &config), RestrictionLevel::Mild);
        assert_eq!(escalation_level(5, &config), RestrictionLevel::Severe);
        assert_eq!(escalation_level(9, &config), RestrictionLevel::Severe);
        assert_eq!(escalation_level(10, &config), RestrictionLevel::Suspend);
    }

    #[test]
    fn test_threshold_override() {
        let thresholds =
            ResourceThresholds::default().with(ResourceKind::Memory, Threshold::new(8.0, 16.0));
        assert_eq!(thresholds.get(ResourceKind::Memory).critical, 16.0);
        assert_eq!(thresholds.get(ResourceKind::Cpu).critical, 90.0);
    }
}
