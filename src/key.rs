//! Bounds shared by cache keys and cached values.

use std::fmt::Debug;
use std::hash::Hash;

/// Trait for types that can identify a cache entry.
///
/// It is automatically implemented for all types that implement
/// `Hash + Eq + Clone + Debug + Send + Sync + 'static`; in practice strings
/// and integers.
pub trait QueryKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {
    /// Get the type name for this key, used when tracing.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<T: Hash + Eq + Clone + Debug + Send + Sync + 'static> QueryKey for T {}

/// Convenience trait for cached data and error types.
///
/// Values are cloned out of the cache on every read, so wrap large payloads
/// in `Arc` if cloning is expensive.
pub trait QueryValue: Clone + Send + Sync + 'static {}
impl<T: Clone + Send + Sync + 'static> QueryValue for T {}
