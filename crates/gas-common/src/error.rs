//! Error types for the scheduler extender
//!
//! Feasibility failures (a node cannot host a pod) all surface to the
//! orchestrator as the single string `"will not fit"`; the precise cause is
//! observable in logs. Operational failures keep their context so the
//! orchestrator can decide whether to retry.

use thiserror::Error;

/// Main error type for extender operations
#[derive(Debug, Error)]
pub enum Error {
    /// The node has no GPUs usable by this pod
    #[error("will not fit")]
    InfeasibleNode,

    /// A container request cannot be satisfied by any card
    #[error("will not fit")]
    WillNotFit,

    /// A card was selected but the requested tiles are not available on it
    #[error("will not fit")]
    NoTiles,

    /// A resource quantity from the orchestrator was not a non-negative integer
    #[error("invalid quantity for {resource}: {value}")]
    InvalidResource {
        /// The resource name the quantity was given for
        resource: String,
        /// The offending quantity string
        value: String,
    },

    /// The cache could not supply node or pod state; retryable
    #[error("cache unavailable: {message}")]
    CacheUnavailable {
        /// Description of what failed
        message: String,
    },

    /// The pod cannot be bound as-is (bad UID, conflicting state)
    #[error("invalid pod: {message}")]
    InvalidPod {
        /// Description of what's invalid
        message: String,
    },

    /// Applying the assignment annotations to the pod failed; retryable
    #[error("annotation patch failed: {message}")]
    PatchFailed {
        /// Description of what failed
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },
}

impl Error {
    /// Create a cache error with the given message
    pub fn cache(msg: impl Into<String>) -> Self {
        Self::CacheUnavailable {
            message: msg.into(),
        }
    }

    /// Create an invalid-pod error with the given message
    pub fn invalid_pod(msg: impl Into<String>) -> Self {
        Self::InvalidPod {
            message: msg.into(),
        }
    }

    /// Create a patch error with the given message
    pub fn patch(msg: impl Into<String>) -> Self {
        Self::PatchFailed {
            message: msg.into(),
        }
    }

    /// Create an invalid-resource error for a resource name and quantity string
    pub fn invalid_resource(resource: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidResource {
            resource: resource.into(),
            value: value.into(),
        }
    }

    /// True for failures that mean "this node cannot host this pod"
    ///
    /// Feasibility failures populate `FailedNodes` in filter results instead
    /// of becoming top-level errors.
    pub fn is_feasibility(&self) -> bool {
        matches!(
            self,
            Error::InfeasibleNode | Error::WillNotFit | Error::NoTiles
        )
    }

    /// Check if this error is retryable
    ///
    /// Feasibility and validation errors are not retryable without a state
    /// change; cache and patch failures are.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::InfeasibleNode | Error::WillNotFit | Error::NoTiles => false,
            Error::InvalidResource { .. } => false,
            Error::InvalidPod { .. } => false,
            Error::CacheUnavailable { .. } => true,
            Error::PatchFailed { .. } => true,
            Error::Kube { source } => {
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
        }
    }
}
