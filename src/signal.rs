//! Observable cells with change notification.
//!
//! A [`Signal`] is the reactive primitive every other component is built on:
//! a shared value plus a list of subscribers that are told "something
//! changed" after every write. Subscribers are plain callbacks; they re-read
//! whatever they care about.
//!
//! Writes are synchronous. Each call to [`Signal::set`] or [`Signal::update`]
//! produces exactly one notification, so grouping several field writes into
//! one `update` closure is how an entry is changed atomically. Writes to
//! *different* signals can be grouped with [`batch`].

use std::cell::RefCell;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use slab::Slab;
use tokio::sync::Notify;

/// Callback invoked after a signal changed.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

type SubscriberList = Mutex<Slab<Callback>>;

// Notifications deferred by an active `batch`, keyed by (subscriber list, slot).
thread_local! {
    static BATCH: RefCell<Option<Vec<(usize, usize, Callback)>>> = const { RefCell::new(None) };
}

struct Shared<T> {
    value: RwLock<T>,
    subscribers: Arc<SubscriberList>,
    changed: Notify,
}

/// Shared observable value.
///
/// This is cheap to clone - all clones observe and write the same cell.
pub struct Signal<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Default> Default for Signal<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&*self.shared.value.read()).finish()
    }
}

impl<T> Signal<T> {
    /// Create a signal holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            shared: Arc::new(Shared {
                value: RwLock::new(value),
                subscribers: Arc::new(Mutex::new(Slab::new())),
                changed: Notify::new(),
            }),
        }
    }

    /// Read the current value through a closure without cloning it.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.shared.value.read())
    }

    /// Replace the value and notify subscribers.
    pub fn set(&self, value: T) {
        *self.shared.value.write() = value;
        self.notify();
    }

    /// Mutate the value in place. Subscribers are notified once, after `f` returns.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = f(&mut self.shared.value.write());
        self.notify();
        result
    }

    /// Register a callback fired after every write.
    ///
    /// The callback runs on the writing thread after the value lock has been
    /// released, so it may read or write signals itself.
    pub fn subscribe(&self, callback: impl Fn() + Send + Sync + 'static) -> Subscription {
        self.subscribe_callback(Arc::new(callback))
    }

    /// Same as [`Signal::subscribe`] for an already shared callback.
    pub fn subscribe_callback(&self, callback: Callback) -> Subscription {
        let index = self.shared.subscribers.lock().insert(callback);
        Subscription {
            list: Arc::downgrade(&self.shared.subscribers),
            index,
            active: true,
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().len()
    }

    /// Wait until `predicate` holds for the current value.
    ///
    /// Returns immediately if it already holds.
    pub async fn wait_for(&self, mut predicate: impl FnMut(&T) -> bool) {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();
            if predicate(&self.shared.value.read()) {
                return;
            }
            changed.await;
        }
    }

    /// Weak handle that does not keep the value alive.
    pub fn downgrade(&self) -> WeakSignal<T> {
        WeakSignal {
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn notify(&self) {
        self.shared.changed.notify_waiters();

        let list_id = Arc::as_ptr(&self.shared.subscribers) as usize;
        let callbacks: Vec<(usize, Callback)> = self
            .shared
            .subscribers
            .lock()
            .iter()
            .map(|(index, callback)| (index, callback.clone()))
            .collect();

        let immediate = BATCH.with(|batch| match batch.borrow_mut().as_mut() {
            Some(pending) => {
                for (index, callback) in callbacks {
                    if !pending
                        .iter()
                        .any(|(list, slot, _)| *list == list_id && *slot == index)
                    {
                        pending.push((list_id, index, callback));
                    }
                }
                None
            }
            None => Some(callbacks),
        });

        for (_, callback) in immediate.into_iter().flatten() {
            callback();
        }
    }
}

impl<T: Clone> Signal<T> {
    /// Clone out the current value.
    pub fn get(&self) -> T {
        self.shared.value.read().clone()
    }
}

impl<T: Send + Sync + 'static> Signal<T> {
    /// Derive a read-only accessor that applies `f` to this signal's value.
    ///
    /// Subscribing to the derived accessor subscribes to this signal.
    pub fn map<U, F>(&self, f: F) -> Map<T, F>
    where
        F: Fn(&T) -> U + Send + Sync + 'static,
    {
        Map {
            source: self.clone(),
            f,
        }
    }
}

/// Weak counterpart of [`Signal`], used by callbacks that are themselves
/// registered on the signal.
pub struct WeakSignal<T> {
    shared: Weak<Shared<T>>,
}

impl<T> Clone for WeakSignal<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> WeakSignal<T> {
    /// Recover the signal if any strong handle is still alive.
    pub fn upgrade(&self) -> Option<Signal<T>> {
        self.shared.upgrade().map(|shared| Signal { shared })
    }
}

/// Registration returned by [`Signal::subscribe`].
///
/// Dropping it unregisters the callback.
#[must_use = "dropping a Subscription unregisters its callback"]
pub struct Subscription {
    list: Weak<SubscriberList>,
    index: usize,
    active: bool,
}

impl Subscription {
    /// Unregister now. Equivalent to dropping.
    pub fn unsubscribe(self) {}

    /// Keep the callback registered for the lifetime of the signal.
    pub fn detach(mut self) {
        self.active = false;
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("index", &self.index)
            .field("active", &self.active)
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Some(list) = self.list.upgrade() {
            let mut list = list.lock();
            if list.contains(self.index) {
                list.remove(self.index);
            }
        }
    }
}

/// Group writes so each affected subscriber is notified once, after `f` returns.
///
/// Nested batches are flattened into the outermost one.
pub fn batch<R>(f: impl FnOnce() -> R) -> R {
    let scope = BatchScope::enter();
    let result = f();
    for (_, _, callback) in scope.finish() {
        callback();
    }
    result
}

struct BatchScope {
    outermost: bool,
}

impl BatchScope {
    fn enter() -> Self {
        let outermost = BATCH.with(|batch| {
            let mut batch = batch.borrow_mut();
            if batch.is_none() {
                *batch = Some(Vec::new());
                true
            } else {
                false
            }
        });
        Self { outermost }
    }

    fn finish(mut self) -> Vec<(usize, usize, Callback)> {
        if !self.outermost {
            return Vec::new();
        }
        self.outermost = false;
        BATCH.with(|batch| batch.borrow_mut().take()).unwrap_or_default()
    }
}

impl Drop for BatchScope {
    fn drop(&mut self) {
        // Only reached with `outermost` still set when the batch body panicked.
        if self.outermost {
            BATCH.with(|batch| batch.borrow_mut().take());
        }
    }
}

/// A readable, subscribable value.
///
/// This is what the query engine takes as its key: anything that can say
/// what the current value is and tell you when it may have changed.
pub trait Accessor<T>: Send + Sync + 'static {
    /// Current value.
    fn get(&self) -> T;

    /// Register `callback` to run whenever the value may have changed.
    fn subscribe(&self, callback: Callback) -> Subscription;
}

impl<T: Clone + Send + Sync + 'static> Accessor<T> for Signal<T> {
    fn get(&self) -> T {
        Signal::get(self)
    }

    fn subscribe(&self, callback: Callback) -> Subscription {
        self.subscribe_callback(callback)
    }
}

/// Accessor derived from a signal by [`Signal::map`].
pub struct Map<T, F> {
    source: Signal<T>,
    f: F,
}

impl<T, U, F> Accessor<U> for Map<T, F>
where
    T: Send + Sync + 'static,
    F: Fn(&T) -> U + Send + Sync + 'static,
{
    fn get(&self) -> U {
        self.source.with(&self.f)
    }

    fn subscribe(&self, callback: Callback) -> Subscription {
        self.source.subscribe_callback(callback)
    }
}

/// Sets a boolean signal back to `false` when dropped, so loading flags are
/// cleared even if a callback unwinds.
pub(crate) struct FlagGuard<'a> {
    flag: &'a Signal<bool>,
}

impl<'a> FlagGuard<'a> {
    pub(crate) fn raise(flag: &'a Signal<bool>) -> Self {
        flag.set(true);
        Self { flag }
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}
