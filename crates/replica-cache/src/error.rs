//! Error types for the record cache.

use thiserror::Error;

/// Errors reported by a [`RemoteDataSource`](crate::RemoteDataSource).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The request never produced a usable response.
    #[error("transport error: {0}")]
    Transport(String),

    /// The remote rejected the query.
    #[error("query error: {code} - {message}")]
    Query { code: String, message: String },

    /// No row matched. Single-record lookups turn this into `None`.
    #[error("record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Rate limited.
    #[error("rate limited{}", match retry_after_secs {
        Some(secs) => format!(" (retry after {}s)", secs),
        None => String::new(),
    })]
    RateLimited {
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// The remote answered with something we could not interpret.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Errors that can occur while reading through or synchronizing the cache.
#[derive(Debug, Error)]
pub enum SyncError {
    /// A remote call failed. Never retried by the cache itself.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// The repository was destroyed.
    #[error("repository has been destroyed")]
    Destroyed,

    /// A change event could not be interpreted.
    #[error("malformed change event: {0}")]
    MalformedEvent(String),

    /// A payload could not be turned into a record.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Subscribing to the change-event source failed.
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// A view registration collides with an existing view of the same key.
    #[error("view conflict on {key}: {reason}")]
    ViewConflict { key: String, reason: String },
}
