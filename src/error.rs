//! Error types for the notebook operator

use thiserror::Error;

/// Result alias used throughout the operator.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for notebook operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for a Notebook spec
    #[error("validation error: {0}")]
    Validation(String),

    /// A name-colliding resource exists but is not managed by this operator
    #[error("refusing to adopt existing {kind} {name:?}: not managed by this operator")]
    AdoptionRefused {
        /// Kind of the colliding resource
        kind: &'static str,
        /// Name of the colliding resource
        name: String,
    },

    /// Certificate generation or verification error
    #[error("certificate error: {0}")]
    Pki(#[from] crate::pki::PkiError),

    /// A dependent resource did not become ready in time
    #[error("readiness error: {0}")]
    Readiness(String),

    /// A polled condition is not yet met; used inside retry loops
    #[error("{0}")]
    Wait(String),

    /// Aggregated sub-reconciler failure for one notebook
    #[error("{0}")]
    Reconcile(String),

    /// CRD registration failed within its startup bound
    #[error("bootstrap error: {0}")]
    Bootstrap(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a readiness error with the given message
    pub fn readiness(msg: impl Into<String>) -> Self {
        Self::Readiness(msg.into())
    }

    /// Create a wait error with the given message
    pub fn wait(msg: impl Into<String>) -> Self {
        Self::Wait(msg.into())
    }

    /// Create an aggregated reconcile error with the given message
    pub fn reconcile(msg: impl Into<String>) -> Self {
        Self::Reconcile(msg.into())
    }

    /// Create a bootstrap error with the given message
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Status code of the underlying API error, if this wraps one.
    fn api_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(response)) => Some(response.code),
            _ => None,
        }
    }

    /// True if the API reported 404.
    pub fn is_not_found(&self) -> bool {
        self.api_code() == Some(404)
    }

    /// True if the API reported 409 for a create.
    pub fn is_already_exists(&self) -> bool {
        self.api_code() == Some(409)
    }

    /// Races that fold to success: a delete finding nothing, or a create
    /// finding the object already present.
    pub fn is_benign(&self) -> bool {
        self.is_not_found() || self.is_already_exists()
    }
}
