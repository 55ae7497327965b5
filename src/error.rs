//! Error types for the Cirrus reconciliation engine.
//!
//! This module provides the error hierarchy for every stage of a run:
//! configuration, declaration (graph building), planning, provider calls,
//! state management, and reconciliation.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for the Cirrus engine.
#[derive(Debug, Error)]
pub enum CirrusError {
    /// Configuration-related errors.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Declaration errors raised while building the dependency graph.
    #[error("Declaration error: {0}")]
    Graph(#[from] GraphError),

    /// Planning errors.
    #[error("Planning error: {0}")]
    Plan(#[from] PlanError),

    /// Provider plugin errors.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// State management errors.
    #[error("State error: {0}")]
    State(#[from] StateError),

    /// Reconciliation errors.
    #[error("Reconciliation error: {0}")]
    Reconcile(#[from] ReconcileError),

    /// IO errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration-related errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The stack file was not found.
    #[error("Stack file not found: {path}")]
    FileNotFound {
        /// Path to the missing file.
        path: PathBuf,
    },

    /// The stack file could not be parsed.
    #[error("Failed to parse stack file: {message}")]
    ParseError {
        /// Description of the parse error.
        message: String,
        /// Optional source location.
        location: Option<String>,
    },

    /// Validation failed.
    #[error("Stack validation failed: {message}")]
    ValidationError {
        /// Description of the validation error.
        message: String,
        /// Field that failed validation.
        field: Option<String>,
    },

    /// Environment variable is missing.
    #[error("Missing environment variable: {name}")]
    MissingEnvVar {
        /// Name of the missing variable.
        name: String,
    },

    /// A `${settings.*}` placeholder names a setting that is not defined.
    #[error("Undefined setting '{name}' referenced by {location}")]
    UndefinedSetting {
        /// Setting name.
        name: String,
        /// Where the placeholder appeared.
        location: String,
    },

    /// A placeholder could not be interpreted.
    #[error("Invalid placeholder '{placeholder}' in {location}")]
    InvalidPlaceholder {
        /// The offending placeholder text.
        placeholder: String,
        /// Where the placeholder appeared.
        location: String,
    },
}

/// Errors raised while assembling declarations into a dependency graph.
///
/// All of these are fatal and are raised before any provider is called.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The declared dependencies form a cycle.
    #[error("Dependency cycle detected: {}", cycle.join(" -> "))]
    Cycle {
        /// Resource names along the cycle, closing back on the first.
        cycle: Vec<String>,
    },

    /// A dependency or output reference names an undeclared resource.
    #[error("Resource '{from}' references unknown resource '{target}'")]
    UnknownReference {
        /// Resource holding the reference.
        from: String,
        /// Name that could not be resolved.
        target: String,
    },

    /// Two declarations share the same logical name.
    #[error("Duplicate resource name: {name}")]
    DuplicateResource {
        /// The duplicated name.
        name: String,
    },
}

/// Planning errors.
#[derive(Debug, Error)]
pub enum PlanError {
    /// A delete and a dependent change cannot be sequenced safely.
    #[error("Plan conflict on '{resource}': {message}")]
    Conflict {
        /// Resource the conflict was detected on.
        resource: String,
        /// Description of the conflict.
        message: String,
    },
}

/// Errors returned by provider plugins.
///
/// Provider errors are local to one resource: the executor records them
/// against that resource and keeps applying independent branches.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// No plugin is registered for the resource type.
    #[error("No provider registered for resource type '{resource_type}'")]
    NoProvider {
        /// Type tag that had no plugin.
        resource_type: String,
    },

    /// The remote object does not exist.
    #[error("{resource_type} '{provider_id}' not found")]
    NotFound {
        /// Type tag of the resource.
        resource_type: String,
        /// Provider handle that was looked up.
        provider_id: String,
    },

    /// The provider rejected or failed the operation.
    #[error("{operation} failed for '{resource}': {message}")]
    OperationFailed {
        /// Operation name (create, read, update, delete).
        operation: String,
        /// Logical resource name.
        resource: String,
        /// Message from the provider.
        message: String,
    },

    /// A referenced output was not produced by its resource.
    #[error("Resource '{resource}' did not produce output '{output}'")]
    MissingOutput {
        /// Referenced resource.
        resource: String,
        /// Output field that was missing.
        output: String,
    },

    /// The plugin asked us to back off.
    #[error("Provider rate limited, retry after {retry_after_secs} seconds")]
    RateLimited {
        /// Seconds to wait before retrying.
        retry_after_secs: u64,
    },

    /// Transport-level failure talking to an out-of-process plugin.
    #[error("Network error communicating with provider: {message}")]
    NetworkError {
        /// Description of the network error.
        message: String,
    },

    /// The plugin returned something we could not interpret.
    #[error("Invalid response from provider: {message}")]
    InvalidResponse {
        /// Description of the response issue.
        message: String,
    },
}

/// State management errors.
#[derive(Debug, Error)]
pub enum StateError {
    /// State is corrupted.
    #[error("State is corrupted: {message}")]
    Corrupted {
        /// Description of the corruption.
        message: String,
    },

    /// State lock acquisition failed.
    #[error("Failed to acquire state lock: {message}")]
    LockFailed {
        /// Description of the lock failure.
        message: String,
    },

    /// State lock is held by another run.
    #[error("State is locked by another run (lock holder: {holder}, since: {since})")]
    LockConflict {
        /// Identifier of the lock holder.
        holder: String,
        /// When the lock was acquired.
        since: String,
    },

    /// A previous run was interrupted between a provider call and its state write.
    #[error(
        "Previous run was interrupted while applying: {}. Inspect these resources, then run `state clear-pending`",
        resources.join(", ")
    )]
    InterruptedRun {
        /// Resources with unacknowledged pending operations.
        resources: Vec<String>,
    },

    /// Storage backend error.
    #[error("State backend error: {message}")]
    BackendError {
        /// Description of the backend error.
        message: String,
    },

    /// Serialization error.
    #[error("State serialization error: {message}")]
    SerializationError {
        /// Description of the serialization error.
        message: String,
    },

    /// State version mismatch.
    #[error("State version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected state version.
        expected: String,
        /// Found state version.
        found: String,
    },
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Reconciliation was aborted.
    #[error("Reconciliation aborted: {reason}")]
    Aborted {
        /// Reason for abort.
        reason: String,
    },

    /// The run finished with failed resources.
    #[error("{failed} resource(s) failed, {skipped} skipped")]
    PartialFailure {
        /// Number of failed resources.
        failed: usize,
        /// Number of skipped resources.
        skipped: usize,
    },
}

/// Result type alias for Cirrus operations.
pub type Result<T> = std::result::Result<T, CirrusError>;

impl CirrusError {
    /// Creates a new internal error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::State(StateError::LockFailed { .. }) => true,
            _ => false,
        }
    }
}

impl ConfigError {
    /// Creates a validation error for a specific field.
    #[must_use]
    pub fn validation(message: impl Into<String>, field: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Creates a validation error without a specific field.
    #[must_use]
    pub fn validation_general(message: impl Into<String>) -> Self {
        Self::ValidationError {
            message: message.into(),
            field: None,
        }
    }
}

impl PlanError {
    /// Creates a conflict error.
    #[must_use]
    pub fn conflict(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Conflict {
            resource: resource.into(),
            message: message.into(),
        }
    }
}

impl ProviderError {
    /// Creates an operation failure.
    #[must_use]
    pub fn failed(
        operation: impl Into<String>,
        resource: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            resource: resource.into(),
            message: message.into(),
        }
    }

    /// Creates a network error.
    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::NetworkError { .. })
    }

    /// Returns the suggested retry delay in seconds, if applicable.
    #[must_use]
    pub const fn retry_delay_secs(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            Self::NetworkError { .. } => Some(1),
            _ => None,
        }
    }

    /// Returns true if this is a not-found error.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl StateError {
    /// Creates a backend error with the given message.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::BackendError {
            message: message.into(),
        }
    }

    /// Creates a serialization error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Creates a corruption error with the given message.
    #[must_use]
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted {
            message: message.into(),
        }
    }
}
