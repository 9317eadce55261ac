//! Tracer trait for observing cache activity.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! fetches and cache writes. The default [`NoopTracer`] discards everything.
//! Independently of the tracer, the crate logs through `tracing` at
//! `debug`/`trace` level.
//!
//! # Example
//!
//! ```ignore
//! use query_cache::{FetchOutcome, Tracer, TracerKey};
//!
//! struct PrintTracer;
//!
//! impl Tracer for PrintTracer {
//!     fn on_fetch_end(&self, key: &TracerKey, outcome: FetchOutcome) {
//!         println!("{} settled: {:?}", key, outcome);
//!     }
//! }
//!
//! let query = QueryOptions::new(key, fetch_todo)
//!     .tracer(Arc::new(PrintTracer))
//!     .build()?;
//! ```

use std::fmt;

use crate::key::QueryKey;

/// Represents a cache key in a type-erased manner for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TracerKey {
    /// The key type name (e.g., "u32")
    pub key_type: &'static str,
    /// Debug representation of the key (e.g., "42")
    pub key_debug: String,
}

impl TracerKey {
    /// Create a tracer key from a cache key.
    #[inline]
    pub fn of<K: QueryKey>(key: &K) -> Self {
        Self {
            key_type: key.type_name(),
            key_debug: format!("{:?}", key),
        }
    }
}

impl fmt::Display for TracerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key_debug)
    }
}

/// How a fetch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The fetcher resolved and the value was stored.
    Success,
    /// The fetcher rejected and the error was stored.
    Failure,
    /// The query was disabled; nothing was fetched or written.
    Skipped,
}

/// Kind of cache write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheWrite {
    /// An entry was marked loading at the start of a fetch.
    Loading,
    /// A fetch result was written.
    Settled,
    /// Manual `set_data`.
    SetData,
    /// Manual `set_error`.
    SetError,
    /// Manual `set_entry`.
    SetEntry,
    /// The whole mapping was replaced or edited through `set_cache`.
    SetCache,
    /// The whole mapping was emptied.
    Clear,
}

/// Tracer trait for observing cache activity.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: fetches settle on runtime worker
/// threads.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a fetch is about to be issued.
    #[inline]
    fn on_fetch_start(&self, _key: &TracerKey) {}

    /// Called once the fetch result has been written, or when it was skipped.
    #[inline]
    fn on_fetch_end(&self, _key: &TracerKey, _outcome: FetchOutcome) {}

    /// Called when a key change (or a cache write) left the current key
    /// without an entry and a fetch is triggered automatically.
    #[inline]
    fn on_auto_refetch(&self, _key: &TracerKey) {}

    /// Called after every write the engine performs. `key` is `None` for
    /// whole-cache writes.
    #[inline]
    fn on_cache_write(&self, _key: Option<&TracerKey>, _write: CacheWrite) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`Query`](crate::Query).
pub struct NoopTracer;

impl Tracer for NoopTracer {}
