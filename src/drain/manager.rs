//! Drain manager implementation.
//!
//! By default a root manager:
//! 1. drains over `drain_time` (10 minutes), with a drain close becoming more
//!    likely on every decision as the window elapses;
//! 2. terminates the parent after `parent_shutdown_time` (15 minutes) once a
//!    parent shutdown sequence has been started.

use super::{DrainCloseCb, DrainDecision, DrainServer, DrainType};
use crate::callback::{CallbackHandle, CallbackRegistry};
use crate::event::{deadline_after, Dispatcher, Timer};
use parking_lot::Mutex;
use rand::Rng;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace};

/// Number of drain notifications spread across one drain window.
const TICKS_PER_WINDOW: u32 = 50;

/// Lower bound on the tick period for short windows.
const MIN_TICK_INTERVAL: Duration = Duration::from_millis(10);

type DrainCompleteCb = Box<dyn FnOnce() + Send + 'static>;

/// Start and end of a drain sequence.
#[derive(Debug, Clone, Copy)]
struct DrainWindow {
    start: Instant,
    deadline: Instant,
}

impl DrainWindow {
    fn length(&self) -> Duration {
        self.deadline.duration_since(self.start)
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    fn tick_interval(&self) -> Duration {
        (self.length() / TICKS_PER_WINDOW).max(MIN_TICK_INTERVAL)
    }

    /// P(close) = elapsed / length, drawn independently per call.
    fn should_close(&self, now: Instant) -> bool {
        let length = self.length();
        let elapsed = now.saturating_duration_since(self.start);
        if elapsed >= length {
            return true;
        }
        rand::thread_rng().gen_range(Duration::ZERO..length) < elapsed
    }
}

/// Drain manager for one scope: the whole process, or one sub-resource.
///
/// Always held in an [`Arc`]. Timers and subscriptions only keep a weak
/// reference back, so dropping the last `Arc` cancels everything it scheduled.
pub struct DrainManager {
    this: Weak<DrainManager>,
    server: Arc<dyn DrainServer>,
    dispatcher: Dispatcher,
    drain_type: DrainType,
    draining: AtomicBool,
    /// Written once, before `draining` is released.
    window: OnceLock<DrainWindow>,
    callbacks: CallbackRegistry<Duration>,
    state: Mutex<SequenceState>,
}

#[derive(Default)]
struct SequenceState {
    tick_timer: Option<Timer>,
    on_complete: Option<DrainCompleteCb>,
    parent_shutdown_timer: Option<Timer>,
    children: Vec<ChildLink>,
}

/// The parent's subscription that forwards draining into one child.
struct ChildLink {
    child: Weak<DrainManager>,
    _handle: CallbackHandle,
}

impl DrainManager {
    /// Create a manager whose timers run on `dispatcher`.
    pub fn new(
        server: Arc<dyn DrainServer>,
        drain_type: DrainType,
        dispatcher: Dispatcher,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            server,
            dispatcher,
            drain_type,
            draining: AtomicBool::new(false),
            window: OnceLock::new(),
            callbacks: CallbackRegistry::new(),
            state: Mutex::new(SequenceState::default()),
        })
    }

    pub fn drain_type(&self) -> DrainType {
        self.drain_type
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Whether a drain sequence has started. Never reverts to false.
    pub fn draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// The instant at which closing becomes certain, once draining.
    pub fn drain_deadline(&self) -> Option<Instant> {
        if self.draining() {
            self.window.get().map(|window| window.deadline)
        } else {
            None
        }
    }

    /// Begin draining.
    ///
    /// `on_complete` runs once the full drain window has elapsed. If a drain
    /// sequence is already running (started directly or by a parent), this is
    /// a no-op and `on_complete` runs immediately.
    pub fn start_drain_sequence<F>(&self, on_complete: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let drain_time = self.server.drain_options().drain_time;
        let now = self.dispatcher.now();
        let window = DrainWindow {
            start: now,
            deadline: deadline_after(now, drain_time),
        };

        let mut state = self.state.lock();
        if self.window.set(window).is_err() {
            drop(state);
            debug!(scope = %self.dispatcher.name(), "drain sequence already started");
            on_complete();
            return;
        }
        self.draining.store(true, Ordering::Release);
        state.on_complete = Some(Box::new(on_complete));
        state.tick_timer = Some(self.schedule_tick(window));
        drop(state);

        info!(
            scope = %self.dispatcher.name(),
            drain_type = %self.drain_type,
            drain_time = %humantime::format_duration(drain_time),
            "drain sequence started"
        );
        self.callbacks
            .run_callbacks(self.notification_value(&window, now));
    }

    /// Arm the one-shot timer that terminates the parent process.
    ///
    /// Only the first call has any effect.
    pub fn start_parent_shutdown_sequence(&self) {
        let options = self.server.drain_options();
        if !options.parent_shutdown_enabled {
            debug!(scope = %self.dispatcher.name(), "parent shutdown disabled, ignoring");
            return;
        }

        let mut state = self.state.lock();
        if state.parent_shutdown_timer.is_some() {
            debug!(scope = %self.dispatcher.name(), "parent shutdown sequence already started");
            return;
        }

        let this = self.this.clone();
        state.parent_shutdown_timer = Some(self.dispatcher.schedule_once(
            options.parent_shutdown_time,
            move || {
                if let Some(manager) = this.upgrade() {
                    info!(scope = %manager.dispatcher.name(), "shutting down parent after drain");
                    manager.server.terminate_parent();
                }
            },
        ));
        drop(state);

        info!(
            scope = %self.dispatcher.name(),
            parent_shutdown_time = %humantime::format_duration(options.parent_shutdown_time),
            "parent shutdown sequence started"
        );
    }

    /// Create a child manager that inherits this manager's drain type.
    pub fn create_child_manager(&self, dispatcher: Dispatcher) -> Arc<DrainManager> {
        self.create_child_manager_with_type(dispatcher, self.drain_type)
    }

    /// Create a child manager on `dispatcher`.
    ///
    /// The child starts draining whenever this manager does, and may also be
    /// drained on its own. The child's lifetime belongs to the caller; this
    /// manager only keeps a weak link to it.
    pub fn create_child_manager_with_type(
        &self,
        dispatcher: Dispatcher,
        drain_type: DrainType,
    ) -> Arc<DrainManager> {
        let child = DrainManager::new(Arc::clone(&self.server), drain_type, dispatcher);

        let link = Arc::downgrade(&child);
        let parent_scope = self.dispatcher.name().to_string();
        let handle = self.add_on_drain_close_cb(
            child.dispatcher(),
            Box::new(move |_| {
                let Some(child) = link.upgrade() else {
                    return;
                };
                if !child.draining() {
                    debug!(
                        parent = %parent_scope,
                        scope = %child.dispatcher.name(),
                        "parent draining, starting child drain sequence"
                    );
                    child.start_drain_sequence(|| {});
                }
            }),
        );

        let stale = {
            let mut state = self.state.lock();
            let (live, stale): (Vec<_>, Vec<_>) = std::mem::take(&mut state.children)
                .into_iter()
                .partition(|link| link.child.strong_count() > 0);
            state.children = live;
            state.children.push(ChildLink {
                child: Arc::downgrade(&child),
                _handle: handle,
            });
            stale
        };
        // Released outside the state lock: releasing may wait on a running callback.
        if !stale.is_empty() {
            debug!(
                scope = %self.dispatcher.name(),
                released = stale.len(),
                "released links to dropped child managers"
            );
        }
        drop(stale);

        child
    }

    fn notification_value(&self, window: &DrainWindow, now: Instant) -> Duration {
        match self.drain_type {
            DrainType::Immediate => Duration::ZERO,
            DrainType::Gradual => window.remaining(now),
        }
    }

    fn schedule_tick(&self, window: DrainWindow) -> Timer {
        let delay = window
            .remaining(self.dispatcher.now())
            .min(window.tick_interval());
        let this = self.this.clone();
        self.dispatcher.schedule_once(delay, move || {
            if let Some(manager) = this.upgrade() {
                manager.on_drain_tick(window);
            }
        })
    }

    fn on_drain_tick(&self, window: DrainWindow) {
        let now = self.dispatcher.now();
        let remaining = window.remaining(now);
        trace!(
            scope = %self.dispatcher.name(),
            remaining_ms = remaining.as_millis() as u64,
            "drain tick"
        );
        self.callbacks
            .run_callbacks(self.notification_value(&window, now));

        if !remaining.is_zero() {
            let timer = self.schedule_tick(window);
            self.state.lock().tick_timer = Some(timer);
            return;
        }

        let on_complete = {
            let mut state = self.state.lock();
            state.tick_timer = None;
            state.on_complete.take()
        };
        info!(scope = %self.dispatcher.name(), "drain sequence complete");
        self.server.drain_sequence_completed(self.dispatcher.name());
        if let Some(on_complete) = on_complete {
            on_complete();
        }
    }
}

impl DrainDecision for DrainManager {
    fn drain_close(&self) -> bool {
        if self.server.health_check_failed() {
            return true;
        }
        if !self.draining.load(Ordering::Acquire) {
            return false;
        }
        if self.drain_type == DrainType::Immediate {
            return true;
        }
        match self.window.get() {
            Some(window) => window.should_close(self.dispatcher.now()),
            None => false,
        }
    }

    fn add_on_drain_close_cb(&self, dispatcher: &Dispatcher, cb: DrainCloseCb) -> CallbackHandle {
        // Checked under the state lock so a racing start cannot skip this subscriber.
        let _state = self.state.lock();
        match self.window.get() {
            Some(window) => {
                let value = self.notification_value(window, self.dispatcher.now());
                self.callbacks.add_and_run(dispatcher, cb, value)
            }
            None => self.callbacks.add(dispatcher, cb),
        }
    }
}

impl fmt::Debug for DrainManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DrainManager")
            .field("dispatcher", &self.dispatcher)
            .field("drain_type", &self.drain_type)
            .field("draining", &self.draining())
            .field("callbacks", &self.callbacks)
            .finish()
    }
}
