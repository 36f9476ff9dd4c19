//! Thread-safe callback registry with handle-based cancellation.
//!
//! Every subscriber names the [`Dispatcher`] it must be called on. Notifying
//! posts one invocation per subscriber onto that subscriber's dispatcher; the
//! notifier never runs foreign callbacks itself.

use crate::event::Dispatcher;
use parking_lot::{Mutex, ReentrantMutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Registry of callbacks that receive a `T` on every notification.
pub struct CallbackRegistry<T> {
    inner: Arc<RegistryInner<T>>,
}

struct RegistryInner<T> {
    entries: Mutex<Vec<Arc<Entry<T>>>>,
}

struct Entry<T> {
    dispatcher: Dispatcher,
    alive: AtomicBool,
    /// Held for the duration of an invocation.
    gate: ReentrantMutex<()>,
    callback: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> Entry<T> {
    fn invoke(&self, value: T) {
        let _gate = self.gate.lock();
        if self.alive.load(Ordering::Acquire) {
            (self.callback)(value);
        }
    }

    /// Mark the entry dead and wait out any invocation running on another thread.
    ///
    /// The gate is re-entrant, so a callback may release its own handle.
    fn retire(&self) {
        self.alive.store(false, Ordering::Release);
        drop(self.gate.lock());
    }
}

impl<T> CallbackRegistry<T>
where
    T: Clone + Send + 'static,
{
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register `cb` to be invoked on `dispatcher` at every notification.
    ///
    /// The registration is visible to the next call to [`run_callbacks`].
    ///
    /// [`run_callbacks`]: CallbackRegistry::run_callbacks
    pub fn add<F>(&self, dispatcher: &Dispatcher, cb: F) -> CallbackHandle
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (handle, _) = self.insert(dispatcher, Box::new(cb));
        handle
    }

    /// Register `cb` and immediately queue one invocation of it with `value`.
    ///
    /// The queued invocation honors handle release like any other.
    pub fn add_and_run<F>(&self, dispatcher: &Dispatcher, cb: F, value: T) -> CallbackHandle
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        let (handle, entry) = self.insert(dispatcher, Box::new(cb));
        post_invoke(entry, value);
        handle
    }

    /// Notify every registered callback with a clone of `value`.
    ///
    /// Returns the number of invocations queued.
    pub fn run_callbacks(&self, value: T) -> usize {
        let entries: Vec<Arc<Entry<T>>> = self.inner.entries.lock().clone();
        let count = entries.len();
        for entry in entries {
            post_invoke(entry, value.clone());
        }
        count
    }

    /// Number of live registrations.
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Whether no callbacks are registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(
        &self,
        dispatcher: &Dispatcher,
        callback: Box<dyn Fn(T) + Send + Sync>,
    ) -> (CallbackHandle, Arc<Entry<T>>) {
        let entry = Arc::new(Entry {
            dispatcher: dispatcher.clone(),
            alive: AtomicBool::new(true),
            gate: ReentrantMutex::new(()),
            callback,
        });
        self.inner.entries.lock().push(Arc::clone(&entry));

        let link = EntryLink {
            registry: Arc::downgrade(&self.inner),
            entry: Arc::clone(&entry),
        };
        (
            CallbackHandle {
                link: Some(Box::new(link)),
            },
            entry,
        )
    }
}

fn post_invoke<T>(entry: Arc<Entry<T>>, value: T)
where
    T: Send + 'static,
{
    let dispatcher = entry.dispatcher.clone();
    dispatcher.post(move || entry.invoke(value));
}

impl<T> Default for CallbackRegistry<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CallbackRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("callbacks", &self.inner.entries.lock().len())
            .finish()
    }
}

trait Subscription: Send + Sync {
    fn unsubscribe(&self);
}

struct EntryLink<T> {
    registry: Weak<RegistryInner<T>>,
    entry: Arc<Entry<T>>,
}

impl<T> Subscription for EntryLink<T>
where
    T: Send + 'static,
{
    fn unsubscribe(&self) {
        self.entry.retire();
        if let Some(registry) = self.registry.upgrade() {
            registry
                .entries
                .lock()
                .retain(|entry| !Arc::ptr_eq(entry, &self.entry));
        }
    }
}

/// Exclusively owned registration token.
///
/// Dropping the handle (or calling [`release`](CallbackHandle::release))
/// unregisters the callback. Once that returns, the callback is never invoked
/// again, even if a notification was in flight on another dispatcher.
#[must_use = "dropping a CallbackHandle unregisters its callback"]
pub struct CallbackHandle {
    link: Option<Box<dyn Subscription>>,
}

impl CallbackHandle {
    /// Unregister the callback now.
    pub fn release(mut self) {
        self.unsubscribe();
    }

    /// Whether the callback is still registered through this handle.
    pub fn is_active(&self) -> bool {
        self.link.is_some()
    }

    fn unsubscribe(&mut self) {
        if let Some(link) = self.link.take() {
            link.unsubscribe();
        }
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("active", &self.is_active())
            .finish()
    }
}
