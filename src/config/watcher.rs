//! Configuration file watcher for hot reload.
//!
//! Reloads on file change events and on SIGHUP. Listeners that disappear from
//! the reloaded file are drained by the reload callback.

use crate::config::{load_config, Config};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

/// Callback type for config reload.
pub type ReloadCallback = Box<dyn Fn(Config) + Send + Sync>;

/// Configuration file watcher.
pub struct ConfigWatcher {
    /// Path to the config file.
    config_path: PathBuf,
    /// Callback to invoke with each successfully reloaded config.
    reload_callback: ReloadCallback,
}

impl ConfigWatcher {
    /// Create a new config watcher.
    pub fn new(config_path: PathBuf, reload_callback: ReloadCallback) -> Self {
        Self {
            config_path,
            reload_callback,
        }
    }

    /// Get the path being watched.
    pub fn path(&self) -> &PathBuf {
        &self.config_path
    }

    /// Watch until `shutdown` fires.
    pub async fn run<T: Clone>(self, mut shutdown: broadcast::Receiver<T>) {
        info!(path = %self.config_path.display(), "config watcher starting");

        let (tx, mut events) = mpsc::unbounded_channel();
        let watcher: Result<RecommendedWatcher, _> =
            notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                if let Ok(event) = res {
                    let _ = tx.send(event);
                }
            });

        // Kept alive for the duration of the loop.
        let _watcher = match watcher {
            Ok(mut watcher) => {
                let dir = self
                    .config_path
                    .parent()
                    .filter(|p| !p.as_os_str().is_empty())
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("."));
                match watcher.watch(&dir, RecursiveMode::NonRecursive) {
                    Ok(()) => Some(watcher),
                    Err(e) => {
                        error!(error = %e, dir = %dir.display(), "failed to watch config directory");
                        None
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "failed to create file watcher");
                None
            }
        };

        #[cfg(unix)]
        let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "failed to setup SIGHUP handler");
                None
            }
        };

        info!("config watcher ready, watching for changes");

        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if self.should_reload(&event) {
                        self.try_reload();
                    }
                }

                _ = async {
                    #[cfg(unix)]
                    {
                        match sighup.as_mut() {
                            Some(sig) => sig.recv().await,
                            None => std::future::pending::<Option<()>>().await,
                        }
                    }
                    #[cfg(not(unix))]
                    {
                        std::future::pending::<Option<()>>().await
                    }
                } => {
                    info!("received SIGHUP, reloading configuration");
                    self.try_reload();
                }

                _ = shutdown.recv() => {
                    info!("config watcher shutting down");
                    break;
                }
            }
        }
    }

    /// Check if this event should trigger a reload.
    fn should_reload(&self, event: &Event) -> bool {
        let is_our_file = event
            .paths
            .iter()
            .any(|p| p.file_name() == self.config_path.file_name());

        let is_modify_or_create = matches!(
            event.kind,
            notify::EventKind::Modify(_) | notify::EventKind::Create(_)
        );

        is_our_file && is_modify_or_create
    }

    /// Load, validate and hand over the new configuration.
    fn try_reload(&self) {
        info!(path = %self.config_path.display(), "attempting config reload");

        let new_config = match load_config(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                error!(error = %e, "failed to load new config, keeping current");
                return;
            }
        };

        info!(
            frontends = new_config.frontends.len(),
            "configuration reloaded successfully"
        );
        (self.reload_callback)(new_config);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::NamedTempFile;

    fn watcher_for(path: &str) -> ConfigWatcher {
        ConfigWatcher::new(PathBuf::from(path), Box::new(|_| {}))
    }

    fn modify_event(path: &str) -> Event {
        Event {
            kind: notify::EventKind::Modify(notify::event::ModifyKind::Data(
                notify::event::DataChange::Content,
            )),
            paths: vec![PathBuf::from(path)],
            attrs: Default::default(),
        }
    }

    #[test]
    fn test_should_reload_modify() {
        let watcher = watcher_for("/etc/rustdrain/config.yaml");
        assert!(watcher.should_reload(&modify_event("/etc/rustdrain/config.yaml")));
    }

    #[test]
    fn test_should_reload_create() {
        let watcher = watcher_for("/etc/rustdrain/config.yaml");
        let event = Event {
            kind: notify::EventKind::Create(notify::event::CreateKind::File),
            paths: vec![PathBuf::from("/etc/rustdrain/config.yaml")],
            attrs: Default::default(),
        };
        assert!(watcher.should_reload(&event));
    }

    #[test]
    fn test_should_reload_ignores_other_files_and_removal() {
        let watcher = watcher_for("/etc/rustdrain/config.yaml");
        assert!(!watcher.should_reload(&modify_event("/etc/rustdrain/other.yaml")));

        let event = Event {
            kind: notify::EventKind::Remove(notify::event::RemoveKind::File),
            paths: vec![PathBuf::from("/etc/rustdrain/config.yaml")],
            attrs: Default::default(),
        };
        assert!(!watcher.should_reload(&event));
    }

    #[test]
    fn test_try_reload_skips_invalid_config() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"frontends: []").unwrap();

        let watcher = ConfigWatcher::new(
            file.path().to_path_buf(),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        watcher.try_reload();
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        std::fs::write(
            file.path(),
            "frontends:\n  - name: web\n    listen: \"127.0.0.1:8080\"\n",
        )
        .unwrap();
        watcher.try_reload();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
