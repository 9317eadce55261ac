//! Query-Cache: a keyed asynchronous data cache with reactive invalidation.
//!
//! A [`Query`] watches a reactive key. Whenever the key points at something
//! the cache has not seen, it is fetched once in the background; everything
//! else is a synchronous cache read. Entries can be overwritten by hand, and
//! the whole cache can be mirrored between independent stores.
//!
//! # Key Features
//!
//! - **Reactive keys**: pass a [`Signal`] (or anything implementing
//!   [`Accessor`]) as the key and changing it drives fetching
//! - **Atomic entry writes**: value, error and loading flags of a settled fetch
//!   reach subscribers in one notification
//! - **Owned stores**: every query owns its [`CacheStore`] unless one is shared
//!   explicitly; there is no global cache
//! - **Broadcast**: [`BroadcastQuery`] keeps stores on a named channel in sync
//! - **Mutations and paging**: [`Mutation`] and [`InfiniteQuery`] cover writes
//!   and page-by-page loading
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{QueryOptions, Signal};
//!
//! let todo_id = Signal::new(1u32);
//! let todos = QueryOptions::new(todo_id.clone(), |id: u32| async move {
//!     api::fetch_todo(id).await
//! })
//! .build()?;
//!
//! todos.refetch().await;
//! assert!(todos.data().is_some());
//!
//! // Not cached yet: fetched automatically.
//! todo_id.set(2);
//! assert!(todos.is_loading());
//! ```
//!
//! # Observability
//!
//! Everything logs through `tracing`. For structured events, see the
//! [`tracer`] module.

mod error;
mod fetcher;
mod infinite;
mod key;
mod mutation;
mod query;
mod signal;
mod state;
mod store;
pub mod tracer;

#[cfg(feature = "broadcast")]
pub mod broadcast;

pub use error::{FetchError, QueryError};
pub use fetcher::Fetcher;
pub use infinite::{InfiniteQuery, InfiniteQueryOptions, Page};
pub use key::{QueryKey, QueryValue};
pub use mutation::{Mutation, MutationOptions};
pub use query::{Query, QueryOptions, Refetch};
pub use signal::{batch, Accessor, Callback, Map, Signal, Subscription, WeakSignal};
pub use state::{EntryPatch, EntryUpdate, QueryState};
pub use store::{CacheMap, CacheStore, WeakCacheStore};
pub use tracer::{CacheWrite, FetchOutcome, NoopTracer, Tracer, TracerKey};

#[cfg(feature = "broadcast")]
pub use broadcast::{
    BroadcastHub, BroadcastMessage, BroadcastOptions, BroadcastQuery, HubChannel, Transport,
};
