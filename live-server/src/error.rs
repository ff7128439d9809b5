//! Error types for livedata-server.

use crate::transport::TransportError;

/// Main error type for livedata-server operations.
#[derive(Debug, thiserror::Error)]
pub enum LivedataError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Write fence misuse.
    #[error("write fence error: {0}")]
    Fence(#[from] FenceError),

    /// Crossbar misuse.
    #[error("crossbar error: {0}")]
    Crossbar(#[from] CrossbarError),

    /// Document store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Single-flight fetch error.
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Frame encoding error.
    #[error("frame error: {0}")]
    Types(#[from] live_types::TypesError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Usage errors on a [`WriteFence`](crate::WriteFence).
///
/// These are programming-contract violations and surface to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FenceError {
    /// A write or callback was added after the fence fired.
    #[error("fence has already fired")]
    AlreadyFired,

    /// `committed()` was called twice on the same handle.
    #[error("write handle committed twice")]
    DoubleCommit,

    /// `retire()` was called before the fence fired.
    #[error("can't retire a fence that hasn't fired")]
    NotFired,

    /// The fence was armed from inside its own scope.
    #[error("can't arm the current fence")]
    ArmedInsideScope,
}

/// Malformed crossbar triggers or notifications.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CrossbarError {
    /// `collection` is present but empty.
    #[error("message has empty collection")]
    EmptyCollection,

    /// `collection` is present but not a string.
    #[error("message has non-string collection")]
    NonStringCollection,
}

/// Document store errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Insert of an id that already exists.
    #[error("duplicate id {id} in {collection}")]
    Duplicate {
        /// Collection name.
        collection: String,
        /// Stringified document id.
        id: String,
    },

    /// Update or remove of an id that does not exist.
    #[error("document {id} not found in {collection}")]
    NotFound {
        /// Collection name.
        collection: String,
        /// Stringified document id.
        id: String,
    },

    /// The write could not be registered on the current fence.
    #[error("write fence error: {0}")]
    Fence(#[from] FenceError),

    /// The backing store failed.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Errors delivered to [`DocFetcher`](crate::DocFetcher) waiters.
///
/// Cloned to every waiter of a failed fetch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    /// The store query failed.
    #[error("store query failed: {0}")]
    Store(#[from] StoreError),

    /// The fetch task ended without producing a result.
    #[error("fetch abandoned before completing")]
    Abandoned,
}

/// Result type alias for livedata-server operations.
pub type Result<T> = std::result::Result<T, LivedataError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for fence operations.
pub type FenceResult<T> = std::result::Result<T, FenceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_convert_into_top_level() {
        let err: LivedataError = FenceError::DoubleCommit.into();
        assert!(matches!(err, LivedataError::Fence(FenceError::DoubleCommit)));
        assert_eq!(err.to_string(), "write fence error: write handle committed twice");

        let err: LivedataError = FetchError::from(StoreError::Backend("disk".into())).into();
        assert_eq!(
            err.to_string(),
            "fetch error: store query failed: backend error: disk"
        );
    }

    #[test]
    fn store_error_display_names_document() {
        let err = StoreError::NotFound {
            collection: "docs".into(),
            id: "a".into(),
        };
        assert_eq!(err.to_string(), "document a not found in docs");
    }
}
