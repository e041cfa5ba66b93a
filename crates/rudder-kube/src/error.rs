//! Error types for rudder-kube

use thiserror::Error;

use crate::release::StoredRelease;

/// Result type for rudder-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur during release lifecycle operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Release has no history in this namespace
    #[error("release '{name}' not found in namespace '{namespace}'")]
    ReleaseNotFound { name: String, namespace: String },

    /// A specific revision is absent
    #[error("revision {version} of release '{name}' not found")]
    RevisionNotFound { name: String, version: u32 },

    /// Install of a name that already has live history
    #[error("release '{name}' already exists in namespace '{namespace}'")]
    ReleaseAlreadyExists { name: String, namespace: String },

    /// Another operation already took this version number
    #[error("revision {version} of release '{name}' already exists (concurrent operation?)")]
    RevisionExists { name: String, version: u32 },

    /// Another operation is in progress
    ///
    /// A head stuck in a pending state is cleared with `LifecycleEngine::recover`.
    #[error("another operation is in progress for release '{name}': {status}")]
    OperationInProgress { name: String, status: String },

    /// A revision changed status under a concurrent operation
    #[error("revision {version} of release '{name}' is {actual}, expected {expected} (concurrent operation?)")]
    StatusConflict {
        name: String,
        version: u32,
        expected: String,
        actual: String,
    },

    /// Rollback target is missing or not older than the head
    #[error("cannot rollback release '{name}' to revision {version}: {reason}")]
    InvalidTarget {
        name: String,
        version: u32,
        reason: String,
    },

    /// Rollback without target and nothing older than the deployed revision
    #[error("release '{name}' has no revision to roll back to")]
    NoPriorRevision { name: String },

    /// Release has no test hooks
    #[error("no tests found for release '{name}'")]
    NoTestsFound { name: String },

    /// Hook did not complete in time
    #[error("hook '{hook_name}' timed out during {event} after {timeout:?}")]
    HookTimeout {
        hook_name: String,
        event: String,
        timeout: std::time::Duration,
    },

    /// Hook execution failed
    #[error("hook '{hook_name}' failed during {event}: {message}")]
    HookFailed {
        hook_name: String,
        event: String,
        message: String,
    },

    /// A live resource the engine expected is absent
    #[error("resource {resource} not found")]
    ResourceNotFound { resource: String },

    /// Resources could not be applied
    #[error("failed to apply resources: {message}")]
    ApplyFailed { message: String },

    /// A resource did not become ready in time, or failed
    #[error("resource {resource} not ready: {message}")]
    NotReady { resource: String, message: String },

    /// Recover was asked for a release whose head isn't pending
    #[error("release '{name}' is not in a pending state (status: {status})")]
    NotPending { name: String, status: String },

    /// Some resources could not be deleted
    #[error("failed to delete {} resource(s): {}", .failures.len(), .failures.join("; "))]
    PartialDelete { failures: Vec<String> },

    /// Template rendering error, surfaced unchanged
    #[error(transparent)]
    Render(#[from] rudder_core::RenderError),

    /// An operation failed after its revision was persisted.
    ///
    /// Carries the revision as committed (status `failed`).
    #[error("{source}")]
    ReleaseFailed {
        release: Box<StoredRelease>,
        #[source]
        source: Box<KubeError>,
    },

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Compression error
    #[error("compression error: {0}")]
    Compression(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<rudder_core::CoreError> for KubeError {
    fn from(e: rudder_core::CoreError) -> Self {
        KubeError::InvalidManifest(e.to_string())
    }
}

impl KubeError {
    /// Wrap an error together with the revision it left behind
    pub fn release_failed(release: StoredRelease, source: KubeError) -> Self {
        KubeError::ReleaseFailed {
            release: Box::new(release),
            source: Box::new(source),
        }
    }

    /// The failed revision, when the error happened after persistence
    pub fn failed_release(&self) -> Option<&StoredRelease> {
        match self {
            KubeError::ReleaseFailed { release, .. } => Some(release),
            _ => None,
        }
    }

    /// The underlying error, unwrapping `ReleaseFailed`
    pub fn root_cause(&self) -> &KubeError {
        match self {
            KubeError::ReleaseFailed { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Release, revision or live resource absent (including Kubernetes 404)
    pub fn is_not_found(&self) -> bool {
        match self.root_cause() {
            KubeError::ReleaseNotFound { .. }
            | KubeError::RevisionNotFound { .. }
            | KubeError::ResourceNotFound { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Duplicate install or a race lost to another operation (including
    /// Kubernetes 409)
    pub fn is_already_exists(&self) -> bool {
        match self.root_cause() {
            KubeError::ReleaseAlreadyExists { .. }
            | KubeError::RevisionExists { .. }
            | KubeError::StatusConflict { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 409,
            _ => false,
        }
    }
}
