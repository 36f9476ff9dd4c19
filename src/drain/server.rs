//! The owning-server seam.

use std::time::Duration;

/// Drain timing supplied by the owning server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainOptions {
    /// Window over which gradual closing ramps from never to always.
    pub drain_time: Duration,
    /// Delay after which the parent process is told to terminate.
    pub parent_shutdown_time: Duration,
    /// When false, parent shutdown sequences are ignored.
    pub parent_shutdown_enabled: bool,
}

impl Default for DrainOptions {
    fn default() -> Self {
        Self {
            drain_time: Duration::from_secs(600),
            parent_shutdown_time: Duration::from_secs(900),
            parent_shutdown_enabled: true,
        }
    }
}

/// The process or server object that owns a tree of drain managers.
pub trait DrainServer: Send + Sync {
    /// Configured drain timing.
    fn drain_options(&self) -> &DrainOptions;

    /// Whether the server is failing its health check on purpose.
    ///
    /// While true, every drain decision closes, whatever the manager's drain
    /// type and whether or not it is draining. No manager is exempt.
    fn health_check_failed(&self) -> bool {
        false
    }

    /// Called on the manager's dispatcher when a drain sequence of `scope`
    /// reaches its deadline, for roots and children alike.
    fn drain_sequence_completed(&self, _scope: &str) {}

    /// Terminate the parent process. Called once the parent shutdown window ends.
    fn terminate_parent(&self);
}
