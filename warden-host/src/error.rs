//! Coordinator error type and its coarse classification

use crate::installer::InstallError;
use crate::lifecycle::LifecycleError;
use crate::registry::RegistryError;
use crate::resolver::{DependencyFailure, ResolveError};
use std::fmt;
use thiserror::Error;
use warden_api::PluginState;

/// Coarse error category, suitable for exit codes and API status mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad package or descriptor; retrying will not help
    Validation,
    /// Missing, unsatisfied or cyclic dependency, or live dependents
    Dependency,
    /// A loader call failed
    Lifecycle,
    /// A loader call missed its deadline
    Timeout,
    NotFound,
    /// The operation is not valid in the plugin's current state
    InvalidState,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Dependency => "dependency",
            Self::Lifecycle => "lifecycle",
            Self::Timeout => "timeout",
            Self::NotFound => "not_found",
            Self::InvalidState => "invalid_state",
        };
        f.write_str(s)
    }
}

/// Errors returned by [`SystemCoordinator`](crate::SystemCoordinator)
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Plugin not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Install(#[from] InstallError),

    #[error("Plugin '{plugin}' cannot run: {source}")]
    Dependency {
        plugin: String,
        #[source]
        source: DependencyFailure,
    },

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("Plugin '{plugin}' is required by: {}", dependents.join(", "))]
    DependencyBlocked {
        plugin: String,
        dependents: Vec<String>,
    },

    #[error("Cannot enable plugin '{plugin}' in state {state}")]
    InvalidStateForEnable { plugin: String, state: PluginState },

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl CoordinatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Install(InstallError::NotInstalled(_)) => ErrorKind::NotFound,
            Self::Install(_) => ErrorKind::Validation,
            Self::Dependency { .. } | Self::Resolve(_) | Self::DependencyBlocked { .. } => {
                ErrorKind::Dependency
            }
            Self::InvalidStateForEnable { .. } => ErrorKind::InvalidState,
            Self::Lifecycle(e) => match e {
                LifecycleError::NotFound(_) => ErrorKind::NotFound,
                LifecycleError::IllegalStateTransition { .. } => ErrorKind::InvalidState,
                LifecycleError::Registry(e) => registry_kind(e),
                LifecycleError::Timeout { .. } => ErrorKind::Timeout,
                LifecycleError::Loader { .. } | LifecycleError::Refused { .. } => {
                    ErrorKind::Lifecycle
                }
            },
            Self::Registry(e) => registry_kind(e),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

fn registry_kind(error: &RegistryError) -> ErrorKind {
    match error {
        RegistryError::NotFound(_) => ErrorKind::NotFound,
        RegistryError::AlreadyRegistered(_) => ErrorKind::Validation,
        RegistryError::IllegalTransition(_) | RegistryError::StateMismatch { .. } => {
            ErrorKind::InvalidState
        }
    }
}
