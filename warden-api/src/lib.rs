//! warden-api: Shared types for the warden plugin runtime
//!
//! This crate defines the data model exchanged between the orchestration
//! core and its callers: plugin descriptors and records, lifecycle states,
//! event envelopes, operation status, health snapshots and rollout status.
//!
//! Every type is serializable. Field names follow the runtime's external
//! contract so that any transport (JSON, MessagePack) can carry them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

// ============================================================================
// Descriptor
// ============================================================================

/// Kind of plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginType {
    #[default]
    Normal,
    System,
}

/// Trust assigned to a plugin package
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustLevel {
    Trusted,
    #[default]
    Untrusted,
}

/// A single dependency declared by a plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    /// Id of the plugin depended upon
    pub plugin_id: String,

    /// Version range, e.g. `>=1.0.0 <2.0.0`
    #[serde(default = "any_version")]
    pub version_requirement: String,

    /// Optional dependencies order loading but their absence is not an error
    #[serde(default)]
    pub optional: bool,
}

fn any_version() -> String {
    "*".to_string()
}

impl DependencySpec {
    /// Create a required dependency
    pub fn required(plugin_id: impl Into<String>, requirement: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version_requirement: requirement.into(),
            optional: false,
        }
    }

    /// Create an optional dependency
    pub fn optional(plugin_id: impl Into<String>, requirement: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version_requirement: requirement.into(),
            optional: true,
        }
    }
}

/// Parsed package manifest (immutable)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    /// Unique plugin id
    pub plugin_id: String,

    /// Plugin version (semver)
    pub version: String,

    /// Loader-resolvable entry, relative to the module path
    pub main_entry: String,

    #[serde(rename = "type", default)]
    pub plugin_type: PluginType,

    #[serde(default)]
    pub trust: TrustLevel,

    /// Lower loads first
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
}

impl PluginDescriptor {
    /// Create a new descriptor for a normal, untrusted plugin
    pub fn new(
        plugin_id: impl Into<String>,
        version: impl Into<String>,
        main_entry: impl Into<String>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version: version.into(),
            main_entry: main_entry.into(),
            plugin_type: PluginType::Normal,
            trust: TrustLevel::Untrusted,
            priority: 0,
            dependencies: Vec::new(),
        }
    }

    /// Mark as a system plugin
    pub fn system(mut self) -> Self {
        self.plugin_type = PluginType::System;
        self
    }

    /// Mark as trusted
    pub fn trusted(mut self) -> Self {
        self.trust = TrustLevel::Trusted;
        self
    }

    /// Set load priority
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a required dependency
    pub fn depends_on(mut self, plugin_id: impl Into<String>, requirement: impl Into<String>) -> Self {
        self.dependencies
            .push(DependencySpec::required(plugin_id, requirement));
        self
    }

    /// Add an optional dependency
    pub fn optionally_depends_on(
        mut self,
        plugin_id: impl Into<String>,
        requirement: impl Into<String>,
    ) -> Self {
        self.dependencies
            .push(DependencySpec::optional(plugin_id, requirement));
        self
    }

    /// System plugins from trusted packages start as soon as they load
    pub fn is_auto_start(&self) -> bool {
        self.plugin_type == PluginType::System && self.trust == TrustLevel::Trusted
    }

    /// Dependencies that must be present
    pub fn required_dependencies(&self) -> impl Iterator<Item = &DependencySpec> {
        self.dependencies.iter().filter(|d| !d.optional)
    }

    /// Find the declared dependency on `plugin_id`
    pub fn dependency_on(&self, plugin_id: &str) -> Option<&DependencySpec> {
        self.dependencies.iter().find(|d| d.plugin_id == plugin_id)
    }

    /// Compute a content hash of the descriptor
    ///
    /// Used to tell whether a reload or upgrade actually changed the manifest.
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.plugin_id.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.version.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.main_entry.as_bytes());
        hasher.update(&[self.plugin_type as u8, self.trust as u8]);
        hasher.update(&self.priority.to_le_bytes());
        for dep in &self.dependencies {
            hasher.update(dep.plugin_id.as_bytes());
            hasher.update(&[0]);
            hasher.update(dep.version_requirement.as_bytes());
            hasher.update(&[dep.optional as u8]);
        }
        hasher.finalize().to_hex()[..16].to_string()
    }
}

// ============================================================================
// Lifecycle state
// ============================================================================

/// Lifecycle state of a plugin
///
/// ```text
/// CREATED -> LOADED -> INITIALIZED -> STARTED <-> STOPPED
///                                        |
///                                        +-> ERROR | ISOLATED | RESOURCE_LIMITED -> STOPPED
///
/// any non-terminal state -> UNLOADED (terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginState {
    Created,
    Loaded,
    Initialized,
    Started,
    Stopped,
    Error,
    Isolated,
    ResourceLimited,
    Unloaded,
}

impl PluginState {
    /// `UNLOADED` is the only terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unloaded)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Started)
    }

    /// States surfaced as unhealthy regardless of samples
    pub fn is_faulted(&self) -> bool {
        matches!(self, Self::Error | Self::Isolated)
    }

    /// States a plugin is parked in after being forcibly halted
    pub fn is_halted(&self) -> bool {
        matches!(self, Self::Error | Self::Isolated | Self::ResourceLimited)
    }

    /// Get valid transition targets from the current state.
    ///
    /// `ERROR` is reachable from states other than `STARTED` only through a
    /// loader timeout; the halted states recover through `STOPPED`.
    pub fn valid_transitions(&self) -> &'static [PluginState] {
        use PluginState::*;
        match self {
            Created => &[Loaded, Error, Unloaded],
            Loaded => &[Initialized, Error, Unloaded],
            Initialized => &[Started, Error, Unloaded],
            Started => &[Stopped, Error, Isolated, ResourceLimited, Unloaded],
            Stopped => &[Started, Error, Unloaded],
            Error | Isolated | ResourceLimited => &[Stopped, Unloaded],
            Unloaded => &[],
        }
    }

    /// Check if a transition to the target state is valid.
    pub fn can_transition_to(&self, target: PluginState) -> bool {
        self.valid_transitions().contains(&target)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Loaded => "LOADED",
            Self::Initialized => "INITIALIZED",
            Self::Started => "STARTED",
            Self::Stopped => "STOPPED",
            Self::Error => "ERROR",
            Self::Isolated => "ISOLATED",
            Self::ResourceLimited => "RESOURCE_LIMITED",
            Self::Unloaded => "UNLOADED",
        }
    }
}

impl fmt::Display for PluginState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Record
// ============================================================================

/// Mutable runtime record of a plugin, owned by the registry.
///
/// Values of this type handed out by the registry are snapshots; mutating
/// them has no effect on the runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub descriptor: PluginDescriptor,
    pub state: PluginState,
    /// "Should be running", independent of `state`
    pub enabled: bool,
    /// Installed location of the module
    pub module_path: PathBuf,
    /// Package the plugin was installed from (used by reload)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<PathBuf>,
    pub loaded_symbol_count: usize,
    pub loaded_resource_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub last_state_change_time: DateTime<Utc>,
}

impl PluginRecord {
    /// Create a fresh record in the `CREATED` state
    pub fn new(descriptor: PluginDescriptor, module_path: impl Into<PathBuf>) -> Self {
        Self {
            descriptor,
            state: PluginState::Created,
            enabled: false,
            module_path: module_path.into(),
            source_path: None,
            loaded_symbol_count: 0,
            loaded_resource_count: 0,
            error_message: None,
            last_state_change_time: Utc::now(),
        }
    }

    /// Attach the source package path
    pub fn with_source(mut self, source: Option<PathBuf>) -> Self {
        self.source_path = source;
        self
    }

    pub fn plugin_id(&self) -> &str {
        &self.descriptor.plugin_id
    }

    pub fn version(&self) -> &str {
        &self.descriptor.version
    }
}

// ============================================================================
// Operation status
// ============================================================================

/// Operation tracked per plugin by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationType {
    Load,
    Unload,
    Enable,
    Disable,
    Reload,
    Upgrade,
    Uninstall,
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Load => "LOAD",
            Self::Unload => "UNLOAD",
            Self::Enable => "ENABLE",
            Self::Disable => "DISABLE",
            Self::Reload => "RELOAD",
            Self::Upgrade => "UPGRADE",
            Self::Uninstall => "UNINSTALL",
        };
        f.write_str(s)
    }
}

/// Latest operation against a plugin.
///
/// One status per plugin id; a new operation overwrites the previous one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStatus {
    pub plugin_id: String,
    pub operation_type: OperationType,
    pub start_time: DateTime<Utc>,
    /// `None` while the operation is in flight
    pub end_time: Option<DateTime<Utc>>,
    /// `None` = pending
    pub success: Option<bool>,
    pub message: String,
}

impl OperationStatus {
    /// Start tracking a new operation
    pub fn begin(plugin_id: impl Into<String>, operation_type: OperationType) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            operation_type,
            start_time: Utc::now(),
            end_time: None,
            success: None,
            message: String::new(),
        }
    }

    /// Mark the operation as succeeded
    pub fn succeed(&mut self, message: impl Into<String>) {
        self.finish(true, message.into());
    }

    /// Mark the operation as failed
    pub fn fail(&mut self, message: impl Into<String>) {
        self.finish(false, message.into());
    }

    fn finish(&mut self, success: bool, message: String) {
        self.end_time = Some(Utc::now());
        self.success = Some(success);
        self.message = message;
    }

    pub fn is_pending(&self) -> bool {
        self.success.is_none()
    }
}

// ============================================================================
// Resources & health
// ============================================================================

/// One resource usage sample for a plugin
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSample {
    pub cpu_percent: f64,
    #[serde(rename = "memoryMB")]
    pub memory_mb: f64,
    pub thread_count: u32,
    pub fd_count: u32,
    pub net_conn_count: u32,
}

impl ResourceSample {
    /// Read the value for a resource kind
    pub fn value(&self, kind: ResourceKind) -> f64 {
        match kind {
            ResourceKind::Cpu => self.cpu_percent,
            ResourceKind::Memory => self.memory_mb,
            ResourceKind::Threads => self.thread_count as f64,
            ResourceKind::FileDescriptors => self.fd_count as f64,
            ResourceKind::NetConnections => self.net_conn_count as f64,
        }
    }
}

/// Sampled resource kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Threads,
    FileDescriptors,
    NetConnections,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 5] = [
        ResourceKind::Cpu,
        ResourceKind::Memory,
        ResourceKind::Threads,
        ResourceKind::FileDescriptors,
        ResourceKind::NetConnections,
    ];
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cpu => "cpu",
            Self::Memory => "memory",
            Self::Threads => "threads",
            Self::FileDescriptors => "file_descriptors",
            Self::NetConnections => "net_connections",
        };
        f.write_str(s)
    }
}

/// Direction of a metric over the recent sample window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    #[default]
    Flat,
    Decreasing,
}

/// Restriction applied to a plugin for resource abuse.
///
/// Escalates monotonically until explicitly reset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RestrictionLevel {
    #[default]
    None,
    Mild,
    Severe,
    Suspend,
}

impl fmt::Display for RestrictionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "NONE",
            Self::Mild => "MILD",
            Self::Severe => "SEVERE",
            Self::Suspend => "SUSPEND",
        };
        f.write_str(s)
    }
}

/// Per-plugin resource violation counters
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceViolationRecord {
    pub plugin_id: String,
    pub cpu_violations: u32,
    pub memory_violations: u32,
    pub thread_violations: u32,
    pub fd_violations: u32,
    pub net_conn_violations: u32,
    pub restriction: RestrictionLevel,
    pub last_violation: Option<DateTime<Utc>>,
}

impl ResourceViolationRecord {
    pub fn new(plugin_id: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            ..Default::default()
        }
    }

    /// Count one violation of `kind`
    pub fn record(&mut self, kind: ResourceKind) {
        let counter = match kind {
            ResourceKind::Cpu => &mut self.cpu_violations,
            ResourceKind::Memory => &mut self.memory_violations,
            ResourceKind::Threads => &mut self.thread_violations,
            ResourceKind::FileDescriptors => &mut self.fd_violations,
            ResourceKind::NetConnections => &mut self.net_conn_violations,
        };
        *counter = counter.saturating_add(1);
        self.last_violation = Some(Utc::now());
    }

    /// Total violations across all resource kinds
    pub fn total(&self) -> u32 {
        self.cpu_violations
            .saturating_add(self.memory_violations)
            .saturating_add(self.thread_violations)
            .saturating_add(self.fd_violations)
            .saturating_add(self.net_conn_violations)
    }
}

/// Point-in-time health view of one plugin
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHealthSnapshot {
    pub plugin_id: String,
    pub version: String,
    pub state: PluginState,
    pub healthy: bool,
    pub last_sample: Option<ResourceSample>,
    pub cpu_trend: Trend,
    pub memory_trend: Trend,
    pub thread_trend: Trend,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub last_error: Option<String>,
    pub restriction: RestrictionLevel,
    pub checked_at: DateTime<Utc>,
}

impl PluginHealthSnapshot {
    /// Create an empty healthy snapshot
    pub fn new(plugin_id: impl Into<String>, version: impl Into<String>, state: PluginState) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            version: version.into(),
            state,
            healthy: true,
            last_sample: None,
            cpu_trend: Trend::Flat,
            memory_trend: Trend::Flat,
            thread_trend: Trend::Flat,
            consecutive_errors: 0,
            total_errors: 0,
            last_error: None,
            restriction: RestrictionLevel::None,
            checked_at: Utc::now(),
        }
    }

    /// Faulted state or a failed check
    pub fn is_unhealthy(&self) -> bool {
        !self.healthy || self.state.is_faulted()
    }
}

// ============================================================================
// Rollout
// ============================================================================

/// State of a canary rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RolloutState {
    Initialized,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RolloutState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    pub fn can_transition_to(&self, target: RolloutState) -> bool {
        use RolloutState::*;
        matches!(
            (self, target),
            (Initialized, InProgress)
                | (Initialized, Cancelled)
                | (InProgress, InProgress)
                | (InProgress, Paused)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Paused, InProgress)
                | (Paused, Failed)
                | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initialized => "INITIALIZED",
            Self::InProgress => "IN_PROGRESS",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// Progress of a version rollout for one plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStatus {
    pub plugin_id: String,
    pub current_version: String,
    pub target_version: String,
    pub batch_size_percent: u8,
    pub validate_window_minutes: u64,
    pub current_batch: u32,
    pub current_percentage: u8,
    pub state: RolloutState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_batch_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

// ============================================================================
// Events
// ============================================================================

/// Well-known event topics
pub mod topics {
    pub const PLUGIN: &str = "plugin";
    pub const HEALTH: &str = "plugin.health";
    pub const ROLLOUT: &str = "plugin.rollout";
    pub const SYSTEM: &str = "system";
}

/// Well-known event types
pub mod kinds {
    pub const STATE_CHANGE: &str = "state_change";
    pub const LOADED: &str = "loaded";
    pub const INITIALIZED: &str = "initialized";
    pub const STARTED: &str = "started";
    pub const STOPPED: &str = "stopped";
    pub const UNLOADED: &str = "unloaded";
    pub const OPERATION_COMPLETED: &str = "operation_completed";
    pub const OPERATION_FAILED: &str = "operation_failed";

    pub const HEALTH_CHECK: &str = "health_check";
    pub const RESOURCE_VIOLATION: &str = "resource_violation";
    pub const RESTRICTION_CHANGED: &str = "restriction_changed";
    pub const SUSPENDED: &str = "suspended";
    pub const ISOLATED: &str = "isolated";
    pub const RESTRICTION_RESET: &str = "restriction_reset";

    pub const ROLLOUT_STARTED: &str = "rollout_started";
    pub const BATCH_ADVANCED: &str = "batch_advanced";
    pub const ROLLOUT_PAUSED: &str = "rollout_paused";
    pub const ROLLOUT_RESUMED: &str = "rollout_resumed";
    pub const ROLLOUT_COMPLETED: &str = "rollout_completed";
    pub const ROLLOUT_FAILED: &str = "rollout_failed";
    pub const ROLLOUT_CANCELLED: &str = "rollout_cancelled";
    pub const ROLLED_BACK: &str = "rolled_back";

    pub const SHUTDOWN: &str = "shutdown";
}

/// Event payload, keyed by event type
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    #[default]
    Empty,

    /// Registry state transition
    StateChange {
        from: PluginState,
        to: PluginState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Outcome of a coordinator operation
    Operation {
        operation: OperationType,
        success: bool,
        message: String,
    },

    /// Health check result
    Health(PluginHealthSnapshot),

    /// Critical threshold crossed
    ResourceViolation {
        resource: ResourceKind,
        value: f64,
        threshold: f64,
        total_violations: u32,
        restriction: RestrictionLevel,
    },

    /// Restriction level changed
    Restriction {
        previous: RestrictionLevel,
        current: RestrictionLevel,
    },

    /// Rollout progress
    Rollout {
        state: RolloutState,
        current_version: String,
        target_version: String,
        current_batch: u32,
        percentage: u8,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Two-phase shutdown announcement
    Shutdown { grace_period_ms: u64 },

    /// Opaque key/value payload
    Data(BTreeMap<String, serde_json::Value>),
}

/// Envelope carried by the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    /// Coarse category, e.g. `plugin`, `plugin.health`
    pub topic: String,

    /// Fine-grained kind, e.g. `started`
    #[serde(rename = "type")]
    pub event_type: String,

    pub source: String,

    #[serde(default)]
    pub plugin_id: Option<String>,

    #[serde(default)]
    pub version: Option<String>,

    #[serde(default)]
    pub payload: EventPayload,

    #[serde(default)]
    pub cancellable: bool,

    #[serde(default)]
    cancelled: bool,

    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    /// Create a new, non-cancellable envelope
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            source: source.into(),
            plugin_id: None,
            version: None,
            payload: EventPayload::Empty,
            cancellable: false,
            cancelled: false,
            timestamp: Utc::now(),
        }
    }

    /// Attach the plugin the event concerns
    pub fn plugin(mut self, plugin_id: impl Into<String>) -> Self {
        self.plugin_id = Some(plugin_id.into());
        self
    }

    /// Attach the plugin version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set the payload
    pub fn payload(mut self, payload: EventPayload) -> Self {
        self.payload = payload;
        self
    }

    /// Allow listeners to cancel synchronous propagation
    pub fn cancellable(mut self) -> Self {
        self.cancellable = true;
        self
    }

    /// Cancel further synchronous delivery.
    ///
    /// Returns false (and does nothing) when the envelope is not cancellable.
    pub fn cancel(&mut self) -> bool {
        if self.cancellable {
            self.cancelled = true;
        }
        self.cancelled
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Encode as MessagePack for external transports
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec_named(self)
    }

    /// Decode from MessagePack
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}
