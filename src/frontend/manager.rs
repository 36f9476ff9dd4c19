//! Lifecycle of the configured listeners.
//!
//! Each listener runs on its own dispatcher with a child drain manager of the
//! root. Removing a listener drains just that listener.

use crate::callback::CallbackHandle;
use crate::config::FrontendConfig;
use crate::drain::{DrainDecision, DrainManager};
use crate::event::Dispatcher;
use crate::frontend::FrontendListener;
use crate::metrics::MetricsCollector;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Errors from adding or removing listeners.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener '{0}' already exists")]
    Duplicate(String),

    #[error("listener '{0}' not found")]
    NotFound(String),

    #[error("failed to bind listener '{name}' on {address}: {source}")]
    Bind {
        name: String,
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// One running listener.
struct ActiveListener {
    config: FrontendConfig,
    local_addr: SocketAddr,
    drain: Arc<DrainManager>,
    metrics_handle: CallbackHandle,
    stop: oneshot::Sender<()>,
    closing: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// The set of active listeners, keyed by name.
pub struct ListenerManager {
    root: Arc<DrainManager>,
    metrics: MetricsCollector,
    listeners: DashMap<String, ActiveListener>,
}

impl ListenerManager {
    /// Create an empty manager whose listeners drain under `root`.
    pub fn new(root: Arc<DrainManager>, metrics: MetricsCollector) -> Self {
        Self {
            root,
            metrics,
            listeners: DashMap::new(),
        }
    }

    /// Bind and start a listener. Returns the bound address.
    pub async fn add_listener(&self, config: FrontendConfig) -> Result<SocketAddr, ListenerError> {
        if self.listeners.contains_key(&config.name) {
            return Err(ListenerError::Duplicate(config.name));
        }

        let dispatcher = Dispatcher::spawn(format!("listener:{}", config.name));
        let drain = match config.drain_type {
            Some(drain_type) => self.root.create_child_manager_with_type(dispatcher, drain_type),
            None => self.root.create_child_manager(dispatcher),
        };
        let metrics_handle = watch_drain_progress(&drain, &self.metrics);

        let listener = FrontendListener::bind(
            &config,
            Arc::clone(&drain) as Arc<dyn DrainDecision>,
            self.metrics.clone(),
        )
        .await
        .map_err(|source| ListenerError::Bind {
            name: config.name.clone(),
            address: config.listen,
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| ListenerError::Bind {
            name: config.name.clone(),
            address: config.listen,
            source,
        })?;

        let (stop, stop_rx) = oneshot::channel();
        let (closing, closing_rx) = watch::channel(false);
        let task = tokio::spawn(listener.run(stop_rx, closing_rx));

        let name = config.name.clone();
        let active = ActiveListener {
            config,
            local_addr,
            drain,
            metrics_handle,
            stop,
            closing,
            task,
        };

        // Another add for the same name may have raced this one.
        let rejected = match self.listeners.entry(name) {
            Entry::Occupied(entry) => Some((entry.key().clone(), active)),
            Entry::Vacant(entry) => {
                info!(
                    name = %entry.key(),
                    address = %local_addr,
                    drain_type = %active.drain.drain_type(),
                    "listener added"
                );
                entry.insert(active);
                None
            }
        };

        match rejected {
            Some((name, active)) => {
                let _ = active.stop.send(());
                let _ = active.task.await;
                Err(ListenerError::Duplicate(name))
            }
            None => Ok(local_addr),
        }
    }

    /// Stop accepting on a listener and drain its open connections.
    ///
    /// Returns once the listener's address is free. The listener's own drain
    /// sequence keeps running in the background.
    pub async fn remove_listener(&self, name: &str) -> Result<(), ListenerError> {
        let (name, active) = self
            .listeners
            .remove(name)
            .ok_or_else(|| ListenerError::NotFound(name.to_string()))?;

        let ActiveListener {
            local_addr,
            drain,
            metrics_handle,
            stop,
            closing,
            task,
            ..
        } = active;

        let _ = stop.send(());
        if let Err(e) = task.await {
            warn!(name = %name, error = %e, "listener task ended abnormally");
        }
        info!(name = %name, address = %local_addr, "listener removed, draining");

        let scope = drain.dispatcher().name().to_string();
        let child = Arc::clone(&drain);
        drain.start_drain_sequence(move || {
            info!(scope = %scope, "listener drained");
            let _ = closing.send(true);
            drop(metrics_handle);
            drop(child);
        });

        Ok(())
    }

    /// Reconcile the running listeners with a reloaded frontend list.
    pub async fn apply(&self, frontends: &[FrontendConfig]) {
        let wanted: HashMap<&str, &FrontendConfig> = frontends
            .iter()
            .map(|frontend| (frontend.name.as_str(), frontend))
            .collect();

        let outdated: Vec<String> = self
            .listeners
            .iter()
            .filter(|entry| wanted.get(entry.key().as_str()) != Some(&&entry.value().config))
            .map(|entry| entry.key().clone())
            .collect();

        for name in outdated {
            if let Err(e) = self.remove_listener(&name).await {
                warn!(error = %e, "failed to remove listener");
            }
        }

        for frontend in frontends {
            if self.listeners.contains_key(&frontend.name) {
                continue;
            }
            if let Err(e) = self.add_listener(frontend.clone()).await {
                error!(error = %e, "failed to add listener");
            }
        }
    }

    /// Stop every accept loop and close open connections gracefully.
    pub async fn stop_all(&self) {
        let names: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();

        for name in names {
            let Some((name, active)) = self.listeners.remove(&name) else {
                continue;
            };
            let _ = active.stop.send(());
            if let Err(e) = active.task.await {
                warn!(name = %name, error = %e, "listener task ended abnormally");
            }
            let _ = active.closing.send(true);
            info!(name = %name, "listener stopped");
        }
    }

    /// Bound address of a listener.
    pub fn local_addr(&self, name: &str) -> Option<SocketAddr> {
        self.listeners.get(name).map(|entry| entry.local_addr)
    }

    /// Drain manager of a listener.
    pub fn drain_manager(&self, name: &str) -> Option<Arc<DrainManager>> {
        self.listeners.get(name).map(|entry| Arc::clone(&entry.drain))
    }

    /// Names of the active listeners.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.listeners.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Mirror a drain manager's notifications into the drain gauges.
pub fn watch_drain_progress(drain: &DrainManager, metrics: &MetricsCollector) -> CallbackHandle {
    let scope = drain.dispatcher().name().to_string();
    let metrics = metrics.clone();
    drain.add_on_drain_close_cb(
        drain.dispatcher(),
        Box::new(move |remaining| {
            metrics.set_draining(&scope, true);
            metrics.set_drain_remaining(&scope, remaining);
        }),
    )
}
