//! Network adapters for replica-cache.
//!
//! - [`HttpDataSource`]: JSON-over-HTTP system of record, with retries
//! - [`FeedClient`]: WebSocket change feed with automatic reconnection

mod feed;
mod http;

pub use feed::{FeedClient, MAX_BACKOFF_SECS};
pub use http::HttpDataSource;
