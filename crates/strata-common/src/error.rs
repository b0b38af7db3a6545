//! Error types for the Strata credential propagation subsystem
//!
//! Errors are structured with fields to aid debugging in production. Every
//! resolution failure carries the kind, name, and namespace of the object
//! that failed to resolve so an operator can diagnose a broken reference
//! chain without re-running the propagation.

use thiserror::Error;

/// Main error type for Strata operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A referenced object in the identity chain could not be resolved
    #[error("failed to resolve {kind} {namespace}/{name}: {message}")]
    Resolution {
        /// Kind of the object that failed to resolve
        kind: String,
        /// Name of the object
        name: String,
        /// Namespace the object was expected in
        namespace: String,
        /// Description of what failed
        message: String,
    },

    /// Source data was present but malformed or incomplete
    #[error("derivation error [{provider}]: {message}")]
    Derivation {
        /// Provider whose payload derivation failed
        provider: String,
        /// Description of what's wrong with the source data
        message: String,
    },

    /// An apply against the managed cluster failed
    #[error("apply error for {kind}/{name}: {message}")]
    Apply {
        /// Kind of the payload object
        kind: String,
        /// Name of the payload object
        name: String,
        /// Description of what failed
        message: String,
    },

    /// The stored kubeconfig could not be parsed or turned into a client
    #[error("kubeconfig error: {message}")]
    Kubeconfig {
        /// Description of what failed
        message: String,
    },

    /// A provider script failed to load, parse, or run
    #[error("script error: {message}")]
    Script {
        /// Description of the script failure
        message: String,
    },

    /// A provider script exceeded its execution deadline
    #[error("script timed out after {timeout_secs}s")]
    ScriptTimeout {
        /// The deadline that was exceeded, in seconds
        timeout_secs: u64,
    },

    /// A provider registration was rejected
    #[error("provider registry error: {message}")]
    Registry {
        /// Description of what was rejected
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a resolution error for an object in the identity chain
    pub fn resolution(
        kind: impl Into<String>,
        name: impl Into<String>,
        namespace: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Resolution {
            kind: kind.into(),
            name: name.into(),
            namespace: namespace.into(),
            message: msg.into(),
        }
    }

    /// Create a derivation error for a provider
    pub fn derivation(provider: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Derivation {
            provider: provider.into(),
            message: msg.into(),
        }
    }

    /// Create an apply error for a payload object
    pub fn apply_for(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a kubeconfig error
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig {
            message: msg.into(),
        }
    }

    /// Create a script error
    pub fn script(msg: impl Into<String>) -> Self {
        Self::Script {
            message: msg.into(),
        }
    }

    /// Create a script timeout error
    pub fn script_timeout(timeout: std::time::Duration) -> Self {
        Self::ScriptTimeout {
            timeout_secs: timeout.as_secs(),
        }
    }

    /// Create a registry error
    pub fn registry(msg: impl Into<String>) -> Self {
        Self::Registry {
            message: msg.into(),
        }
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Resolution and apply errors retry on the next reconciliation tick:
    /// the missing object may appear, the target cluster may come back.
    /// Derivation, script, and registry errors require a config fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors, not on 4xx
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Resolution { .. } => true,
            Error::Derivation { .. } => false,
            Error::Apply { .. } => true,
            Error::Kubeconfig { .. } => true,
            Error::Script { .. } => false,
            Error::ScriptTimeout { .. } => true,
            Error::Registry { .. } => false,
            Error::Serialization { .. } => false,
        }
    }
}
