//! The owning server: shared process state and the drain collaborator.

use crate::config::Config;
use crate::drain::{DrainManager, DrainOptions, DrainServer};
use crate::metrics::MetricsCollector;
use crate::util::{ShutdownReason, ShutdownSignal};
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Process-wide state shared by every task.
pub struct Server {
    /// Current configuration (swapped atomically on hot reload).
    config: ArcSwap<Config>,

    /// Drain timing, fixed at startup.
    options: DrainOptions,

    /// Set by the admin endpoint to force every drain decision to close.
    health_check_failed: AtomicBool,

    /// Whether the root drain has been started through this server.
    drain_started: AtomicBool,

    /// Process shutdown broadcast.
    shutdown: ShutdownSignal,

    /// Process-wide metrics.
    metrics: MetricsCollector,
}

impl Server {
    /// Create server state with drain timing taken from the config.
    pub fn new(config: Config) -> Arc<Self> {
        let options = config.drain.options();
        Self::with_options(config, options)
    }

    /// Create server state with explicit drain timing (e.g. CLI overrides).
    pub fn with_options(config: Config, options: DrainOptions) -> Arc<Self> {
        Arc::new(Self {
            config: ArcSwap::from_pointee(config),
            options,
            health_check_failed: AtomicBool::new(false),
            drain_started: AtomicBool::new(false),
            shutdown: ShutdownSignal::new(),
            metrics: MetricsCollector::new(),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> arc_swap::Guard<Arc<Config>> {
        self.config.load()
    }

    /// Swap the configuration atomically (for hot reload).
    pub fn swap_config(&self, new_config: Config) {
        let current = self.config.load();
        if new_config.drain.options() != current.drain.options()
            || new_config.drain.strategy != current.drain.strategy
        {
            warn!("drain settings changed on reload; they take effect on restart");
        }
        self.config.store(Arc::new(new_config));
    }

    /// Get the shutdown signal.
    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Get the metrics collector.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Fail (or pass) the health check on purpose.
    pub fn set_health_check_failed(&self, failed: bool) {
        let previous = self.health_check_failed.swap(failed, Ordering::AcqRel);
        if previous != failed {
            info!(failed, "health check state changed");
        }
    }

    /// Start draining the process through its root drain manager.
    ///
    /// Broadcasts [`ShutdownReason::DrainComplete`] once the drain window ends and
    /// arms the parent shutdown timer. Later calls do nothing.
    ///
    /// The host binary exits on whichever of the two broadcasts arrives first.
    /// With the defaults that is drain completion, so parent termination only
    /// fires when the parent shutdown window is configured shorter than the
    /// drain window.
    pub fn start_drain(&self, root: &DrainManager) {
        if self.drain_started.swap(true, Ordering::AcqRel) {
            debug!("drain already started");
            return;
        }

        let shutdown = self.shutdown.clone();
        root.start_drain_sequence(move || shutdown.shutdown(ShutdownReason::DrainComplete));
        root.start_parent_shutdown_sequence();
    }

    /// Whether [`start_drain`](Server::start_drain) has been called.
    pub fn drain_started(&self) -> bool {
        self.drain_started.load(Ordering::Acquire)
    }
}

impl DrainServer for Server {
    fn drain_options(&self) -> &DrainOptions {
        &self.options
    }

    fn health_check_failed(&self) -> bool {
        self.health_check_failed.load(Ordering::Acquire)
    }

    fn terminate_parent(&self) {
        warn!("parent shutdown window elapsed, terminating");
        self.shutdown.shutdown(ShutdownReason::ParentTerminated);
    }

    fn drain_sequence_completed(&self, scope: &str) {
        self.metrics.drain_completed(scope);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DrainConfig, FrontendConfig, GlobalConfig};
    use crate::drain::{DrainDecision, DrainType};
    use crate::event::Dispatcher;
    use std::time::Duration;
    use tokio::sync::broadcast::error::TryRecvError;

    fn config() -> Config {
        Config {
            global: GlobalConfig::default(),
            drain: DrainConfig {
                drain_time: Duration::from_secs(10),
                parent_shutdown_time: Duration::from_secs(15),
                ..DrainConfig::default()
            },
            frontends: vec![FrontendConfig {
                name: "web".to_string(),
                listen: "127.0.0.1:0".parse().unwrap(),
                drain_type: None,
            }],
        }
    }

    async fn settle() {
        for _ in 0..64 {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_options_come_from_config() {
        let server = Server::new(config());
        assert_eq!(server.drain_options().drain_time, Duration::from_secs(10));
        assert_eq!(server.config().frontends.len(), 1);
    }

    #[test]
    fn test_swap_config() {
        let server = Server::new(config());
        let mut next = config();
        next.frontends.clear();
        server.swap_config(next);
        assert!(server.config().frontends.is_empty());
    }

    #[tokio::test]
    async fn test_health_check_failure_forces_drain_close() {
        let server = Server::new(config());
        let root = DrainManager::new(server.clone(), DrainType::Gradual, Dispatcher::spawn("main"));

        assert!(!root.drain_close());
        server.set_health_check_failed(true);
        assert!(root.drain_close());
        server.set_health_check_failed(false);
        assert!(!root.drain_close());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_then_parent_termination() {
        let server = Server::new(config());
        let root = DrainManager::new(server.clone(), DrainType::Gradual, Dispatcher::spawn("main"));
        let mut shutdown = server.shutdown_signal().subscribe();

        server.start_drain(&root);
        server.start_drain(&root);
        settle().await;
        assert!(server.drain_started());
        assert!(matches!(shutdown.try_recv(), Err(TryRecvError::Empty)));

        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(shutdown.try_recv().unwrap(), ShutdownReason::DrainComplete);

        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(shutdown.try_recv().unwrap(), ShutdownReason::ParentTerminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_completion_is_counted_per_scope() {
        let server = Server::new(config());
        let root = DrainManager::new(server.clone(), DrainType::Gradual, Dispatcher::spawn("main"));
        let _child = root.create_child_manager(Dispatcher::spawn("listener:web"));

        server.start_drain(&root);
        settle().await;
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;

        let mut output = String::new();
        prometheus_client::encoding::text::encode(&mut output, server.metrics().registry())
            .unwrap();
        assert!(output.contains("rustdrain_drain_sequences_completed_total{scope=\"main\"} 1"));
        assert!(output.contains(
            "rustdrain_drain_sequences_completed_total{scope=\"listener:web\"} 1"
        ));
    }
}
