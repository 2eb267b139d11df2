//! Error types for cache operations.

use thiserror::Error;

/// Errors from disk cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Atomic write could not be finished with a rename.
    #[error("Failed to persist {path}: {source}")]
    Persist {
        /// Destination path of the failed rename.
        path: String,
        /// Underlying rename error.
        #[source]
        source: std::io::Error,
    },

    /// A payload serializer rejected the value.
    #[error("Failed to encode payload for key {key}: {message}")]
    Serialize {
        /// Cache key of the rejected value.
        key: String,
        /// Serializer-provided description.
        message: String,
    },

    /// A payload deserializer rejected the stored bytes.
    ///
    /// The offending file is deleted before this surfaces.
    #[error("Failed to decode cached payload for key {key}: {message}")]
    Deserialize {
        /// Cache key of the rejected file.
        key: String,
        /// Deserializer-provided description.
        message: String,
    },
}
