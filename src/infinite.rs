//! Infinite pager: an ordered sequence of fetched pages.

use std::sync::Arc;

use tokio::runtime::Handle;
use tracing::{debug, trace};

use crate::error::QueryError;
use crate::fetcher::Fetcher;
use crate::key::QueryValue;
use crate::signal::{FlagGuard, Signal};

type SuccessFn<D> = Arc<dyn Fn(&D) + Send + Sync>;
type ErrorFn<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// One fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Page<D> {
    /// Page number passed to the fetcher.
    pub number: i64,
    /// What the fetcher returned.
    pub data: D,
}

/// Configuration for an [`InfiniteQuery`].
///
/// | option                  | default                        |
/// |-------------------------|--------------------------------|
/// | `initial_page`          | `1`, or `0` when lazy          |
/// | `lazy`                  | `false`                        |
/// | `on_fetch_page_success` | none                           |
/// | `on_fetch_page_error`   | none                           |
/// | `handle`                | the current tokio runtime      |
pub struct InfiniteQueryOptions<D, E> {
    on_fetch_page: Arc<dyn Fetcher<i64, D, E>>,
    initial_page: Option<i64>,
    lazy: bool,
    on_fetch_page_success: Option<SuccessFn<D>>,
    on_fetch_page_error: Option<ErrorFn<E>>,
    handle: Option<Handle>,
}

impl<D: QueryValue, E: Send + 'static> InfiniteQueryOptions<D, E> {
    /// Options for pages loaded by `on_fetch_page`.
    pub fn new(on_fetch_page: impl Fetcher<i64, D, E>) -> Self {
        Self {
            on_fetch_page: Arc::new(on_fetch_page),
            initial_page: None,
            lazy: false,
            on_fetch_page_success: None,
            on_fetch_page_error: None,
            handle: None,
        }
    }

    /// Page the pointer starts on, and the page loaded eagerly.
    pub fn initial_page(mut self, page: i64) -> Self {
        self.initial_page = Some(page);
        self
    }

    /// Skip the eager load at construction.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Called with every successfully fetched page's data.
    pub fn on_fetch_page_success(mut self, f: impl Fn(&D) + Send + Sync + 'static) -> Self {
        self.on_fetch_page_success = Some(Arc::new(f));
        self
    }

    /// Called with every page fetch error.
    pub fn on_fetch_page_error(mut self, f: impl Fn(&E) + Send + Sync + 'static) -> Self {
        self.on_fetch_page_error = Some(Arc::new(f));
        self
    }

    /// Runtime used for the eager initial load.
    pub fn handle(mut self, handle: Handle) -> Self {
        self.handle = Some(handle);
        self
    }

    /// Build the pager. Same as [`InfiniteQuery::new`].
    pub fn build(self) -> Result<InfiniteQuery<D, E>, QueryError> {
        InfiniteQuery::new(self)
    }
}

struct Pager<D, E> {
    on_fetch_page: Arc<dyn Fetcher<i64, D, E>>,
    on_fetch_page_success: Option<SuccessFn<D>>,
    on_fetch_page_error: Option<ErrorFn<E>>,
    /// Sorted by page number, one page per number.
    pages: Signal<Vec<Page<D>>>,
    current_page: Signal<i64>,
    is_loading: Signal<bool>,
    is_loading_initial: Signal<bool>,
}

impl<D: QueryValue, E: Send + 'static> Pager<D, E> {
    fn page(&self, number: i64) -> Option<Page<D>> {
        self.pages.with(|pages| {
            pages
                .binary_search_by_key(&number, |page| page.number)
                .ok()
                .map(|index| pages[index].clone())
        })
    }

    /// Insert or replace `page`, keeping the sequence sorted.
    fn store(&self, page: Page<D>) {
        self.pages
            .update(|pages| match pages.binary_search_by_key(&page.number, |p| p.number) {
                Ok(index) => pages[index] = page,
                Err(index) => pages.insert(index, page),
            });
    }

    async fn fetch(&self, number: i64) -> Option<Page<D>> {
        let _loading = FlagGuard::raise(&self.is_loading);
        trace!(page = number, "fetching page");
        match self.on_fetch_page.fetch(number).await {
            Ok(data) => {
                debug!(page = number, "page fetched");
                if let Some(on_success) = &self.on_fetch_page_success {
                    on_success(&data);
                }
                let page = Page { number, data };
                self.store(page.clone());
                Some(page)
            }
            Err(error) => {
                debug!(page = number, "page fetch failed");
                if let Some(on_error) = &self.on_fetch_page_error {
                    on_error(&error);
                }
                None
            }
        }
    }

    async fn nth(&self, number: i64) -> Option<Page<D>> {
        match self.page(number) {
            Some(page) => Some(page),
            None => self.fetch(number).await,
        }
    }
}

/// Sequence of pages loaded on demand around a page pointer.
///
/// A page is fetched at most once unless [`InfiniteQuery::refetch`] is used.
/// If two loads of the same missing page overlap, both fetch and the later
/// result replaces the earlier one; the sequence never holds duplicates.
///
/// This is cheap to clone.
pub struct InfiniteQuery<D, E> {
    pager: Arc<Pager<D, E>>,
}

impl<D, E> Clone for InfiniteQuery<D, E> {
    fn clone(&self) -> Self {
        Self {
            pager: self.pager.clone(),
        }
    }
}

impl<D: QueryValue, E: Send + 'static> InfiniteQuery<D, E> {
    /// Build the pager and, unless lazy, start loading the initial page.
    ///
    /// # Errors
    ///
    /// [`QueryError::NoRuntime`] if the pager is not lazy, no handle was
    /// configured and this is not called from within a tokio runtime.
    pub fn new(options: InfiniteQueryOptions<D, E>) -> Result<Self, QueryError> {
        let initial_page = options
            .initial_page
            .unwrap_or(if options.lazy { 0 } else { 1 });
        let handle = if options.lazy {
            None
        } else {
            match options.handle {
                Some(handle) => Some(handle),
                None => Some(Handle::try_current().map_err(|_| QueryError::NoRuntime)?),
            }
        };

        let pager = Arc::new(Pager {
            on_fetch_page: options.on_fetch_page,
            on_fetch_page_success: options.on_fetch_page_success,
            on_fetch_page_error: options.on_fetch_page_error,
            pages: Signal::new(Vec::new()),
            current_page: Signal::new(initial_page),
            is_loading: Signal::new(false),
            is_loading_initial: Signal::new(false),
        });

        if let Some(handle) = handle {
            // Raised before returning so `ready()` never sees a stale false.
            pager.is_loading_initial.set(true);
            let eager = pager.clone();
            handle.spawn(async move {
                let _initial = FlagGuard::raise(&eager.is_loading_initial);
                debug!(page = initial_page, "loading initial page");
                eager.nth(initial_page).await;
            });
        }

        Ok(Self { pager })
    }

    /// Return page `number`, fetching it if it is not loaded yet.
    ///
    /// Returns `None` if the fetch failed; nothing is stored in that case.
    pub async fn nth(&self, number: i64) -> Option<Page<D>> {
        self.pager.nth(number).await
    }

    /// Load the page after the pointer and, if that worked, move onto it.
    ///
    /// Returns `None` without fetching if the pointer is at `i64::MAX`.
    pub async fn next(&self) -> Option<Page<D>> {
        let target = self.pager.current_page.get().checked_add(1)?;
        let page = self.pager.nth(target).await;
        if page.is_some() {
            self.pager.current_page.set(target);
        }
        page
    }

    /// Load the page before the pointer. The pointer does not move.
    ///
    /// Returns `None` without fetching if the pointer is at `i64::MIN`.
    pub async fn prev(&self) -> Option<Page<D>> {
        let target = self.pager.current_page.get().checked_sub(1)?;
        self.pager.nth(target).await
    }

    /// Fetch an already loaded page again and replace it in place.
    ///
    /// Returns `None` without fetching if the page was never loaded, or if
    /// the fetch failed (the old copy is kept then).
    pub async fn refetch(&self, number: i64) -> Option<Page<D>> {
        self.pager.page(number)?;
        self.pager.fetch(number).await
    }

    /// All loaded pages, sorted by number.
    pub fn pages(&self) -> Vec<Page<D>> {
        self.pager.pages.get()
    }

    /// Loaded page `number`, without fetching.
    pub fn page(&self, number: i64) -> Option<Page<D>> {
        self.pager.page(number)
    }

    /// The page pointer.
    pub fn current_page(&self) -> i64 {
        self.pager.current_page.get()
    }

    /// Returns true while any page fetch is running.
    pub fn is_loading(&self) -> bool {
        self.pager.is_loading.get()
    }

    /// Returns true while the eager initial load is running.
    pub fn is_loading_initial(&self) -> bool {
        self.pager.is_loading_initial.get()
    }

    /// Wait until the eager initial load (if any) has settled.
    pub async fn ready(&self) {
        self.pager
            .is_loading_initial
            .wait_for(|loading| !*loading)
            .await
    }

    /// The loaded pages as a signal, for subscribing.
    pub fn pages_signal(&self) -> &Signal<Vec<Page<D>>> {
        &self.pager.pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(calls: Arc<AtomicUsize>) -> InfiniteQueryOptions<String, String> {
        InfiniteQueryOptions::new(move |n: i64| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 0 {
                    Err(format!("no page {}", n))
                } else {
                    Ok(format!("page {}", n))
                }
            }
        })
    }

    #[tokio::test]
    async fn test_eager_initial_page() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pager = counting(calls.clone()).build().unwrap();
        assert!(pager.is_loading_initial());

        pager.ready().await;
        assert!(!pager.is_loading_initial());
        assert_eq!(pager.current_page(), 1);
        assert_eq!(
            pager.pages(),
            vec![Page {
                number: 1,
                data: "page 1".to_string()
            }]
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lazy_needs_no_runtime() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pager = counting(calls.clone()).lazy(true).build().unwrap();

        assert_eq!(pager.current_page(), 0);
        assert!(!pager.is_loading_initial());
        assert!(pager.pages().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_eager_outside_runtime_errors() {
        let result = counting(Arc::new(AtomicUsize::new(0))).build();
        assert!(matches!(result, Err(QueryError::NoRuntime)));
    }

    #[tokio::test]
    async fn test_nth_fetches_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pager = counting(calls.clone()).lazy(true).build().unwrap();

        let first = pager.nth(5).await.unwrap();
        let second = pager.nth(5).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_page_is_not_stored() {
        let errors = Arc::new(AtomicUsize::new(0));
        let e = errors.clone();
        let pager = counting(Arc::new(AtomicUsize::new(0)))
            .lazy(true)
            .on_fetch_page_error(move |_| {
                e.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        assert_eq!(pager.prev().await, None);
        assert!(pager.pages().is_empty());
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(!pager.is_loading());
    }

    #[tokio::test]
    async fn test_pages_stay_sorted() {
        let pager = counting(Arc::new(AtomicUsize::new(0)))
            .lazy(true)
            .build()
            .unwrap();

        pager.nth(3).await;
        pager.nth(1).await;
        pager.nth(2).await;

        let numbers: Vec<i64> = pager.pages().iter().map(|page| page.number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_pointer_at_limits() {
        let calls = Arc::new(AtomicUsize::new(0));
        let last = counting(calls.clone())
            .lazy(true)
            .initial_page(i64::MAX)
            .build()
            .unwrap();
        assert_eq!(last.next().await, None);
        assert_eq!(last.current_page(), i64::MAX);

        let first = counting(calls.clone())
            .lazy(true)
            .initial_page(i64::MIN)
            .build()
            .unwrap();
        assert_eq!(first.prev().await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refetch_unloaded_is_noop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let pager = counting(calls.clone()).lazy(true).build().unwrap();

        assert_eq!(pager.refetch(4).await, None);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
