//! Reactive client-side record cache.
//!
//! Keeps cached records and the views derived from them consistent with a
//! live stream of change events, while serving cache-first reads against a
//! remote system of record.
//!
//! ## Features
//!
//! - **Store**: Thread-safe keyed store of record snapshots with change notification
//! - **Views**: Named list views and id-set projections, maintained incrementally
//! - **Router**: Single mutation path applying change events and fetched rows
//! - **Executor**: Cache-first single, batch and query reads
//! - **Repository**: Facade owning all of the above, synced to an event source

mod error;
mod event;
mod executor;
mod key;
pub mod memory;
mod query;
mod record;
mod remote;
pub mod repository;
mod router;
mod source;
pub mod store;
pub mod view;

pub use error::{RemoteError, SyncError};
pub use event::{ChangeEvent, WireEvent};
pub use executor::QueryExecutor;
pub use key::{CacheKey, normalize_ids};
pub use query::{FieldFilter, FilterOp, Order, OrderBy, QueryDescriptor};
pub use record::{ID_FIELD, Record, RecordId, SortKey};
pub use remote::{CollectionPath, RemoteDataSource};
pub use repository::{DEFAULT_NAMESPACE, Repository, RepositoryBuilder, SyncState};
pub use router::ChangeEventRouter;
pub use source::{ChangeEventSource, Subscription, UnsubscribeHandle};
pub use store::{CacheUpdate, RecordStore};
pub use view::{ViewDefinition, ViewHandle, ViewRegistry, ViewResult};
