//! Error types for the PXC operator
//!
//! Errors carry structured context (the backup, restore or cluster involved)
//! so that the single status string written on failure is self-explanatory.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for PXC operator operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid configuration or request (missing secrets, bad storage config, ...)
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// Name of the object with invalid configuration
        resource: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.storageName")
        field: Option<String>,
    },

    /// Object storage error
    #[error("storage error: {message}")]
    Storage {
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A backup, restore, PITR or prepare job reported failure
    #[error("job {job} failed: {message}")]
    Job {
        /// Name of the failed job
        job: String,
        /// Failure message from the job condition
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "restore", "finalizer")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named object
    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error for a named object and field path
    pub fn validation_for_field(
        resource: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a storage error that will not go away on retry (bad credentials, bad bucket)
    pub fn storage_permanent(msg: impl Into<String>) -> Self {
        Self::Storage {
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a job failure error
    pub fn job(job: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Job {
            job: job.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Validation, job and serialization errors need a spec change or a new
    /// attempt. Kubernetes errors are retried unless they are 4xx other
    /// than a 409, which means the object moved under us.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409
            ),
            Error::Validation { .. } => false,
            Error::Storage { retryable, .. } => *retryable,
            Error::Job { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// True when this is a Kubernetes 404
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 404)
    }

    /// True when this is a Kubernetes 409 (conflict or already exists)
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409)
    }

    /// Get the object name if this error is associated with one
    pub fn resource(&self) -> Option<&str> {
        match self {
            Error::Validation { resource, .. } => Some(resource),
            Error::Job { job, .. } => Some(job),
            _ => None,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::serialization(e.to_string())
    }
}
