//! Error types for the ferry import engine
//!
//! Errors are structured with fields to aid debugging in production. Store
//! errors are classified into the handful of conditions the engine treats
//! specially (not found, already exists, forbidden); everything else is
//! wrapped with the object kind, `namespace/name` and owning VM id before it
//! is propagated to the caller.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for ferry operations
#[derive(Debug, Error)]
pub enum Error {
    /// Object does not exist. Expected on lookups and deletes.
    #[error("{kind} {name} not found")]
    NotFound {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        name: String,
    },

    /// Create raced with another actor or reused a name
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        name: String,
    },

    /// Permission problem; surfaced to the operator, never retried
    #[error("forbidden: {kind} {name}: {message}")]
    Forbidden {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        name: String,
        /// Message returned by the API server
        message: String,
    },

    /// Optimistic concurrency failure on update
    #[error("conflict updating {kind} {name}")]
    Conflict {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        name: String,
    },

    /// Network failure talking to something other than the API server
    #[error("network error [{endpoint}]: {message}")]
    Network {
        /// URL or address that failed
        endpoint: String,
        /// Description of what failed
        message: String,
    },

    /// Validation error (malformed name, missing match, missing capability)
    #[error("validation error for vm {vm}: {message}")]
    Validation {
        /// Source VM id the validation concerns
        vm: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path, if any
        field: Option<String>,
    },

    /// Builder cannot produce a fragment right now
    #[error("builder error [{provider}] for vm {vm}: {message}")]
    Builder {
        /// Source provider type
        provider: String,
        /// Source VM id
        vm: String,
        /// Description of what failed
        message: String,
    },

    /// Source inventory lookup failed
    #[error("inventory error for vm {vm}: {message}")]
    Inventory {
        /// Source VM id
        vm: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error [{kind}]: {message}")]
    Serialization {
        /// The resource kind being converted
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Wrapped internal error with object and VM context
    #[error("{kind} {object} (vm {vm}): {message}")]
    Internal {
        /// Resource kind
        kind: String,
        /// `namespace/name` of the object
        object: String,
        /// Owning source VM id
        vm: String,
        /// Underlying failure
        message: String,
    },

    /// Kubernetes API error that did not map to a known class
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },
}

impl Error {
    /// Classify a kube-rs error for an object of `kind` named `name`.
    pub fn from_kube(kind: impl Into<String>, name: impl Into<String>, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(ae) => match ae.code {
                404 => Self::NotFound {
                    kind: kind.into(),
                    name: name.into(),
                },
                409 if ae.reason == "AlreadyExists" => Self::AlreadyExists {
                    kind: kind.into(),
                    name: name.into(),
                },
                409 => Self::Conflict {
                    kind: kind.into(),
                    name: name.into(),
                },
                403 => Self::Forbidden {
                    kind: kind.into(),
                    name: name.into(),
                    message: ae.message.clone(),
                },
                _ => Self::Kube { source: err },
            },
            _ => Self::Kube { source: err },
        }
    }

    /// Create a not-found error
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a forbidden error
    pub fn forbidden(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Forbidden {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error without VM context
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            vm: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a VM
    pub fn validation_for(vm: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            vm: vm.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a VM and field path
    pub fn validation_for_field(
        vm: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            vm: vm.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a builder error
    pub fn builder(
        provider: impl Into<String>,
        vm: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Builder {
            provider: provider.into(),
            vm: vm.into(),
            message: msg.into(),
        }
    }

    /// Create an inventory error
    pub fn inventory(vm: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Inventory {
            vm: vm.into(),
            message: msg.into(),
        }
    }

    /// Create a network error
    pub fn network(endpoint: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Network {
            endpoint: endpoint.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error for a resource kind
    pub fn serialization(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with full context
    pub fn internal(
        kind: impl Into<String>,
        object: impl Into<String>,
        vm: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Internal {
            kind: kind.into(),
            object: object.into(),
            vm: vm.into(),
            message: msg.into(),
        }
    }

    /// Attach object and VM context to an error.
    ///
    /// The expected store conditions (not found, already exists, forbidden)
    /// and errors that already carry context pass through unchanged so
    /// callers can still match on them.
    pub fn wrap(self, kind: &str, object: &str, vm: &str) -> Self {
        match self {
            Self::NotFound { .. }
            | Self::AlreadyExists { .. }
            | Self::Forbidden { .. }
            | Self::Validation { .. }
            | Self::Builder { .. }
            | Self::Inventory { .. }
            | Self::Internal { .. } => self,
            other => Self::internal(kind, object, vm, other.to_string()),
        }
    }

    /// True for the not-found class
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True for the already-exists class
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// True for the forbidden class
    pub fn is_forbidden(&self) -> bool {
        matches!(self, Self::Forbidden { .. })
    }

    /// Check if this error is retryable
    ///
    /// Validation, serialization and permission errors need an operator fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Self::Forbidden { .. } | Self::Validation { .. } | Self::Serialization { .. } => false,
            _ => true,
        }
    }

    /// The VM id this error is associated with, if known
    pub fn vm(&self) -> Option<&str> {
        match self {
            Self::Validation { vm, .. }
            | Self::Builder { vm, .. }
            | Self::Inventory { vm, .. }
            | Self::Internal { vm, .. } => Some(vm),
            _ => None,
        }
    }
}
