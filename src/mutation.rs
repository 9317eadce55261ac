//! Fire-and-forget async actions with loading and callback bookkeeping.

use std::sync::Arc;

use tracing::debug;

use crate::fetcher::Fetcher;
use crate::signal::{FlagGuard, Signal};

type SuccessFn<R> = Arc<dyn Fn(&R) + Send + Sync>;
type ErrorFn<E> = Arc<dyn Fn(&E) + Send + Sync>;
type SettledFn = Arc<dyn Fn() + Send + Sync>;

/// Configuration for a [`Mutation`]. Every callback defaults to none.
pub struct MutationOptions<A, R, E> {
    mutation_fn: Arc<dyn Fetcher<A, R, E>>,
    on_success: Option<SuccessFn<R>>,
    on_error: Option<ErrorFn<E>>,
    on_settled: Option<SettledFn>,
}

impl<A, R, E> MutationOptions<A, R, E>
where
    A: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Options for a mutation performed by `mutation_fn`.
    pub fn new(mutation_fn: impl Fetcher<A, R, E>) -> Self {
        Self {
            mutation_fn: Arc::new(mutation_fn),
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    /// Called with the response of a successful mutation.
    pub fn on_success(mut self, f: impl Fn(&R) + Send + Sync + 'static) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    /// Called with the error of a failed mutation.
    pub fn on_error(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Called after every mutation.
    pub fn on_settled(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    /// Build the mutation.
    pub fn build(self) -> Mutation<A, R, E> {
        Mutation::new(self)
    }
}

/// Wrapper around an async action, independent of any cache.
///
/// Calls are neither deduplicated nor serialized: every [`Mutation::mutate`]
/// runs, and the loading flag is cleared by whichever call finishes first.
///
/// This is cheap to clone.
pub struct Mutation<A, R, E> {
    options: Arc<MutationOptions<A, R, E>>,
    is_loading: Signal<bool>,
}

impl<A, R, E> Clone for Mutation<A, R, E> {
    fn clone(&self) -> Self {
        Self {
            options: self.options.clone(),
            is_loading: self.is_loading.clone(),
        }
    }
}

impl<A, R, E> Mutation<A, R, E>
where
    A: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Create a mutation from its options.
    pub fn new(options: MutationOptions<A, R, E>) -> Self {
        Self {
            options: Arc::new(options),
            is_loading: Signal::new(false),
        }
    }

    /// Returns true while a mutation is running.
    pub fn is_loading(&self) -> bool {
        self.is_loading.get()
    }

    /// The loading flag as a signal, for subscribing.
    pub fn loading_signal(&self) -> &Signal<bool> {
        &self.is_loading
    }

    /// Run the mutation.
    ///
    /// Returns the response, or `None` if it failed. The error itself is only
    /// delivered to `on_error`.
    pub async fn mutate(&self, args: A) -> Option<R> {
        let _loading = FlagGuard::raise(&self.is_loading);
        let result = self.options.mutation_fn.fetch(args).await;

        let response = match result {
            Ok(response) => {
                debug!("mutation succeeded");
                if let Some(on_success) = &self.options.on_success {
                    on_success(&response);
                }
                Some(response)
            }
            Err(error) => {
                debug!("mutation failed");
                if let Some(on_error) = &self.options.on_error {
                    on_error(&error);
                }
                None
            }
        };
        if let Some(on_settled) = &self.options.on_settled {
            on_settled();
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[tokio::test]
    async fn test_success_returns_response() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        let mutation = MutationOptions::new(|n: u32| async move { Ok::<_, String>(n + 1) })
            .on_success(move |r| s.lock().push(*r))
            .build();

        assert_eq!(mutation.mutate(1).await, Some(2));
        assert_eq!(*seen.lock(), vec![2]);
        assert!(!mutation.is_loading());
    }

    #[tokio::test]
    async fn test_loading_during_mutation() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let rx = Mutex::new(Some(rx));
        let mutation = MutationOptions::new(move |_: ()| {
            let rx = rx.lock().take();
            async move {
                if let Some(rx) = rx {
                    let _ = rx.await;
                }
                Ok::<_, String>(())
            }
        })
        .build();

        let running = tokio::spawn({
            let mutation = mutation.clone();
            async move { mutation.mutate(()).await }
        });
        mutation.loading_signal().wait_for(|loading| *loading).await;
        assert!(mutation.is_loading());

        tx.send(()).unwrap();
        assert_eq!(running.await.unwrap(), Some(()));
        assert!(!mutation.is_loading());
    }
}
