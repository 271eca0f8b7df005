//! Error types for the weaver controller

use thiserror::Error;

/// How the controller should react to an error
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// The input is wrong; retrying without a spec change cannot help
    Terminal,
    /// The condition may clear on its own; requeue with backoff
    Transient,
    /// A write raced another writer; refetch and retry immediately
    Conflict,
}

/// Main error type for weaver operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error that does not map onto a more specific variant
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for Base/Application specs
    #[error("validation error: {0}")]
    Validation(String),

    /// A referenced or requested object does not exist (yet)
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
    },

    /// Optimistic concurrency failure: the write was made against a stale version
    #[error("conflict writing {kind} {namespace}/{name}: {message}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
        /// Server-provided detail
        message: String,
    },

    /// Create failed because an object with the same identity already exists
    #[error("{kind} {namespace}/{name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
    },

    /// The object exists but is controlled by something else
    #[error("{kind} {namespace}/{name} is owned by another controller ({owner})")]
    OwnershipConflict {
        /// Resource kind
        kind: String,
        /// Resource namespace
        namespace: String,
        /// Resource name
        name: String,
        /// Description of the current owner
        owner: String,
    },

    /// An object store call or a whole reconcile exceeded its deadline
    #[error("timed out after {after_ms}ms: {operation}")]
    Timeout {
        /// What was being attempted
        operation: String,
        /// Deadline that elapsed, in milliseconds
        after_ms: u64,
    },

    /// Work was abandoned because the controller is shutting down
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a not-found error for the given object
    pub fn not_found(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create a stale-version conflict error for the given object
    pub fn conflict(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Conflict {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create an already-exists error for the given object
    pub fn already_exists(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Create an ownership conflict error for the given object
    pub fn ownership_conflict(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::OwnershipConflict {
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
            owner: owner.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after_ms: after.as_millis() as u64,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Classify the error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::Serialization(_) => ErrorClass::Terminal,
            Self::Conflict { .. } => ErrorClass::Conflict,
            Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::OwnershipConflict { .. }
            | Self::Timeout { .. }
            | Self::Cancelled(_)
            | Self::Internal(_)
            | Self::Kube(_) => ErrorClass::Transient,
        }
    }

    /// Returns true if the error means the object is absent
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the error is a stale-version write conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// Returns true if the error is a create racing an existing object
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Short machine-readable reason, used for status conditions
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Kube(_) => "StoreError",
            Self::Validation(_) => "ValidationFailed",
            Self::NotFound { .. } => "NotFound",
            Self::Conflict { .. } => "Conflict",
            Self::AlreadyExists { .. } => "AlreadyExists",
            Self::OwnershipConflict { .. } => "OwnershipConflict",
            Self::Timeout { .. } => "Timeout",
            Self::Cancelled(_) => "Cancelled",
            Self::Serialization(_) => "SerializationFailed",
            Self::Internal(_) => "InternalError",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
