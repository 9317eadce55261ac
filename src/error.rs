//! Error types.

use std::fmt;
use std::sync::Arc;

/// Failures of the crate's own machinery.
///
/// Fetch failures are *not* reported here: whatever a fetcher rejects with
/// is stored in the cache entry or handed to the `on_error` callback.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// A component that spawns background work was built outside a tokio
    /// runtime and no handle was supplied.
    #[error("no tokio runtime available; call from within a runtime or pass a handle")]
    NoRuntime,

    /// A broadcast message could not be serialized.
    #[cfg(feature = "broadcast")]
    #[error("failed to encode broadcast message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A broadcast message could not be deserialized.
    #[cfg(feature = "broadcast")]
    #[error("failed to decode broadcast message: {0}")]
    Decode(#[source] serde_json::Error),

    /// The named broadcast channel has no live endpoints.
    #[cfg(feature = "broadcast")]
    #[error("broadcast channel `{0}` is closed")]
    ChannelClosed(String),
}

/// A clonable, type-erased fetch error.
///
/// Fetchers may use any error type; this one is provided for the common case
/// where fetch functions want `?` to work on anything that converts into
/// [`anyhow::Error`]. It is cheap to clone, which cache entries require.
///
/// It deliberately does not implement `std::error::Error`, otherwise the
/// blanket `From` impl would overlap with the reflexive one.
#[derive(Clone)]
pub struct FetchError(Arc<anyhow::Error>);

impl FetchError {
    /// Create an error from a message.
    pub fn msg(message: impl fmt::Display + fmt::Debug + Send + Sync + 'static) -> Self {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// The underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }

    /// Attempts to downcast to a specific error type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.0.downcast_ref::<E>()
    }

    /// Returns `true` if the error is of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

impl<T: Into<anyhow::Error>> From<T> for FetchError {
    fn from(err: T) -> Self {
        Self(Arc::new(err.into()))
    }
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

// Across a broadcast channel only the message survives.
#[cfg(feature = "serde")]
impl serde::Serialize for FetchError {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&*self.0)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for FetchError {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let message = String::deserialize(deserializer)?;
        Ok(Self::msg(message))
    }
}
