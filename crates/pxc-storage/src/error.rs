//! Storage errors

/// Errors returned by [`crate::StorageClient`] implementations
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The object doesn't exist
    #[error("object {name} not found")]
    NotFound {
        /// Object name relative to the client prefix
        name: String,
    },

    /// The client could not be configured
    #[error("storage configuration error: {0}")]
    Config(String),

    /// Backend error
    #[error("object store error: {0}")]
    Backend(#[from] object_store::Error),

    /// Key that can't be expressed as an object path
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// Reading the local side of a transfer failed
    #[error("local io: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// True when the object doesn't exist
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. } | Self::Backend(object_store::Error::NotFound { .. })
        )
    }

    /// Map a backend error for `name`, turning backend not-found into [`Self::NotFound`]
    pub(crate) fn from_backend(name: &str, error: object_store::Error) -> Self {
        match error {
            object_store::Error::NotFound { .. } => Self::NotFound {
                name: name.to_string(),
            },
            other => Self::Backend(other),
        }
    }
}
