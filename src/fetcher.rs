//! The async operations the components drive.

use std::future::Future;

use async_trait::async_trait;

/// An async operation from `I` to `Result<O, E>`.
///
/// The query engine uses it as its fetch function (`I` is the key), the
/// mutation executor as its mutation function, and the infinite pager as its
/// page loader (`I` is the page number). Any
/// `Fn(I) -> impl Future<Output = Result<O, E>>` closure implements it.
///
/// # Example
///
/// ```ignore
/// struct Todos { client: HttpClient }
///
/// #[async_trait]
/// impl Fetcher<u32, Todo, FetchError> for Todos {
///     async fn fetch(&self, id: u32) -> Result<Todo, FetchError> {
///         Ok(self.client.get_json(format!("/todos/{id}")).await?)
///     }
/// }
/// ```
#[async_trait]
pub trait Fetcher<I, O, E>: Send + Sync + 'static {
    /// Run the operation. There is no timeout and no cancellation.
    async fn fetch(&self, input: I) -> Result<O, E>;
}

#[async_trait]
impl<I, O, E, F, Fut> Fetcher<I, O, E> for F
where
    F: Fn(I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, E>> + Send + 'static,
    I: Send + 'static,
    O: Send + 'static,
    E: Send + 'static,
{
    async fn fetch(&self, input: I) -> Result<O, E> {
        (self)(input).await
    }
}
