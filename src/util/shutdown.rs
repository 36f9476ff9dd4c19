//! Graceful shutdown handling.

use std::fmt;
use tokio::sync::broadcast;

/// Why the process (or a listener) is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// An operator signal such as ctrl-c or SIGTERM.
    Signal,
    /// The drain window elapsed.
    DrainComplete,
    /// The parent shutdown window elapsed.
    ParentTerminated,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal => f.write_str("signal"),
            ShutdownReason::DrainComplete => f.write_str("drain complete"),
            ShutdownReason::ParentTerminated => f.write_str("parent terminated"),
        }
    }
}

/// Broadcasts shutdown to every subscribed task.
#[derive(Clone)]
pub struct ShutdownSignal {
    sender: broadcast::Sender<ShutdownReason>,
}

impl ShutdownSignal {
    /// Create a new shutdown signal.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(4);
        Self { sender }
    }

    /// Subscribe to shutdown notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownReason> {
        self.sender.subscribe()
    }

    /// Trigger shutdown. Subscribers that have gone away are ignored.
    pub fn shutdown(&self, reason: ShutdownReason) {
        let _ = self.sender.send(reason);
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}
