//! Serial execution contexts and one-shot timers.
//!
//! A [`Dispatcher`] is a single tokio task that runs posted closures one at a
//! time, in posting order. Timers created through a dispatcher always fire on it,
//! so state owned by one dispatcher is never touched by another implicitly.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Counter for dispatcher identifiers.
static NEXT_DISPATCHER_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    static CURRENT: DispatcherId;
}

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Cap for deadlines that would overflow the clock (roughly 30 years).
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// `start + delay`, saturating to a far-future instant instead of overflowing.
pub fn deadline_after(start: Instant, delay: Duration) -> Instant {
    start
        .checked_add(delay)
        .or_else(|| start.checked_add(FAR_FUTURE))
        .unwrap_or(start)
}

/// Identifies one dispatcher for the lifetime of the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DispatcherId(u64);

impl fmt::Display for DispatcherId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dispatcher-{}", self.0)
    }
}

/// Handle to a serial execution context.
///
/// Cloning is cheap; all clones post onto the same queue. The underlying task
/// exits once every clone (including those held by pending timers) is gone.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    id: DispatcherId,
    name: String,
    tx: mpsc::UnboundedSender<Task>,
}

impl Dispatcher {
    /// Spawn a new dispatcher task on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a tokio runtime context.
    pub fn spawn(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = DispatcherId(NEXT_DISPATCHER_ID.fetch_add(1, Ordering::Relaxed));
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();

        let task_name = name.clone();
        tokio::spawn(CURRENT.scope(id, async move {
            debug!(dispatcher = %task_name, id = %id, "dispatcher started");
            while let Some(task) = rx.recv().await {
                task();
            }
            debug!(dispatcher = %task_name, id = %id, "dispatcher stopped");
        }));

        Self {
            inner: Arc::new(DispatcherInner { id, name, tx }),
        }
    }

    /// This dispatcher's identifier.
    pub fn id(&self) -> DispatcherId {
        self.inner.id
    }

    /// Human-readable name, used in logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The dispatcher whose task is running the caller, if any.
    pub fn current() -> Option<DispatcherId> {
        CURRENT.try_with(|id| *id).ok()
    }

    /// Whether the caller is running on this dispatcher.
    pub fn is_current(&self) -> bool {
        Self::current() == Some(self.inner.id)
    }

    /// Current monotonic time.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// Queue `f` to run on this dispatcher.
    ///
    /// Tasks posted to a stopped dispatcher are dropped.
    pub fn post<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.tx.send(Box::new(f)).is_err() {
            debug!(dispatcher = %self.inner.name, "dispatcher stopped, dropping posted task");
        }
    }

    /// Run `f` on this dispatcher once `delay` has elapsed.
    ///
    /// The deadline is fixed at call time. Dropping the returned [`Timer`]
    /// cancels it, including a firing that is already queued but has not run.
    pub fn schedule_once<F>(&self, delay: Duration, f: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = deadline_after(Instant::now(), delay);
        let armed = Arc::new(AtomicBool::new(true));
        let fire = Arc::clone(&armed);
        let dispatcher = self.clone();

        let sleeper = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            dispatcher.post(move || {
                if fire.swap(false, Ordering::AcqRel) {
                    f();
                }
            });
        });

        Timer { armed, sleeper }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

/// A one-shot timer bound to a dispatcher. Cancelled on drop.
pub struct Timer {
    armed: Arc<AtomicBool>,
    sleeper: JoinHandle<()>,
}

impl Timer {
    /// Whether the timer has neither fired nor been cancelled.
    pub fn is_enabled(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        self.armed.store(false, Ordering::Release);
        self.sleeper.abort();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    async fn settle() {
        for _ in 0..32 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_posted_tasks_run_in_order() {
        let dispatcher = Dispatcher::spawn("test");
        let (tx, mut rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            let tx = tx.clone();
            dispatcher.post(move || {
                let _ = tx.send(i);
            });
        }

        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(rx.recv().await.unwrap());
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_posted_tasks_run_on_dispatcher() {
        let dispatcher = Dispatcher::spawn("worker");
        let id = dispatcher.id();
        let (tx, rx) = tokio::sync::oneshot::channel();

        assert!(!dispatcher.is_current());
        dispatcher.post(move || {
            let _ = tx.send(Dispatcher::current());
        });

        assert_eq!(rx.await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_dispatcher_ids_are_unique() {
        let a = Dispatcher::spawn("a");
        let b = Dispatcher::spawn("b");
        assert_ne!(a.id(), b.id());
        assert_eq!(a.name(), "a");
    }

    #[test]
    fn test_deadline_after_saturates() {
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(3)), now + Duration::from_secs(3));
        assert_eq!(deadline_after(now, Duration::MAX), now + FAR_FUTURE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_huge_delay_does_not_overflow() {
        let dispatcher = Dispatcher::spawn("timers");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let timer = dispatcher.schedule_once(Duration::MAX, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::advance(Duration::from_secs(86400)).await;
        settle().await;

        assert!(timer.is_enabled());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_after_delay() {
        let dispatcher = Dispatcher::spawn("timers");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let timer = dispatcher.schedule_once(Duration::from_secs(5), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        settle().await;
        assert!(timer.is_enabled());

        tokio::time::advance(Duration::from_millis(4999)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timer.is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_timer_never_fires() {
        let dispatcher = Dispatcher::spawn("timers");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let timer = dispatcher.schedule_once(Duration::from_secs(1), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        drop(timer);

        tokio::time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_idempotent() {
        let dispatcher = Dispatcher::spawn("timers");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);

        let timer = dispatcher.schedule_once(Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.cancel();
        timer.cancel();
        assert!(!timer.is_enabled());

        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
