//! Error types for livedata types.

use thiserror::Error;

/// Errors raised while building or decoding livedata types.
#[derive(Debug, Error)]
pub enum TypesError {
    /// String is not a 24-character hex ObjectId.
    #[error("invalid object id: {0:?}")]
    InvalidObjectId(String),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
