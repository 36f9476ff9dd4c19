//! rustdrain - an HTTP/1.1 server that drains gracefully
//!
//! Usage:
//!     rustdrain --config <path>
//!
//! See --help for more options.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

use rustdrain::config::{load_config, Config, ConfigWatcher};
use rustdrain::drain::{DrainManager, DrainOptions, DrainType};
use rustdrain::event::Dispatcher;
use rustdrain::frontend::{watch_drain_progress, ListenerManager};
use rustdrain::metrics::AdminServer;
use rustdrain::server::Server;
use rustdrain::util::{init_logging, ShutdownReason};

/// An HTTP/1.1 server that closes keep-alive connections gradually on shutdown.
#[derive(Parser, Debug)]
#[command(name = "rustdrain")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the configuration file
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,

    /// Override the drain window (e.g. "30s", "10m")
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    drain_time: Option<Duration>,

    /// Override the parent shutdown window
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    parent_shutdown_time: Option<Duration>,

    /// Override the root drain strategy (gradual, immediate)
    #[arg(long, value_name = "STRATEGY")]
    drain_strategy: Option<DrainType>,
}

impl Cli {
    /// Drain options from the config with command line overrides applied.
    fn drain_options(&self, config: &Config) -> DrainOptions {
        let mut options = config.drain.options();
        if let Some(drain_time) = self.drain_time {
            options.drain_time = drain_time;
        }
        if let Some(parent_shutdown_time) = self.parent_shutdown_time {
            options.parent_shutdown_time = parent_shutdown_time;
        }
        options
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config).with_context(|| {
        format!(
            "failed to load configuration from '{}'",
            cli.config.display()
        )
    })?;

    // CLI overrides config
    let log_level = cli
        .log_level
        .as_deref()
        .unwrap_or(&config.global.log_level);
    init_logging(log_level, &config.global.log_format).context("failed to initialize logging")?;

    let options = cli.drain_options(&config);
    let strategy = cli.drain_strategy.unwrap_or(config.drain.strategy);

    if cli.validate {
        info!("Configuration is valid");
        println!("Configuration is valid.");
        println!(
            "  Drain: {} over {}, parent shutdown after {}{}",
            strategy,
            humantime::format_duration(options.drain_time),
            humantime::format_duration(options.parent_shutdown_time),
            if options.parent_shutdown_enabled { "" } else { " (disabled)" }
        );
        println!("  Frontends: {}", config.frontends.len());
        for frontend in &config.frontends {
            println!(
                "    - {} on {} [{}]",
                frontend.name,
                frontend.listen,
                frontend.drain_type.unwrap_or(strategy)
            );
        }
        return Ok(());
    }

    info!(
        config_path = %cli.config.display(),
        frontends = config.frontends.len(),
        drain_strategy = %strategy,
        drain_time = %humantime::format_duration(options.drain_time),
        parent_shutdown_time = %humantime::format_duration(options.parent_shutdown_time),
        "rustdrain starting"
    );

    run(cli.config, config, options, strategy)
}

/// Run the server with the given configuration.
fn run(path: PathBuf, config: Config, options: DrainOptions, strategy: DrainType) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    runtime.block_on(async { run_async(path, config, options, strategy).await })
}

/// Async entry point.
async fn run_async(
    path: PathBuf,
    config: Config,
    options: DrainOptions,
    strategy: DrainType,
) -> Result<()> {
    let server = Server::with_options(config.clone(), options);
    let shutdown = server.shutdown_signal().clone();
    let metrics = server.metrics().clone();

    let root = DrainManager::new(server.clone(), strategy, Dispatcher::spawn("main"));
    let _root_progress = watch_drain_progress(&root, &metrics);

    let listeners = Arc::new(ListenerManager::new(Arc::clone(&root), metrics.clone()));
    for frontend in &config.frontends {
        listeners
            .add_listener(frontend.clone())
            .await
            .with_context(|| format!("failed to start frontend '{}'", frontend.name))?;
    }

    let admin = &config.global.admin;
    if admin.enabled {
        let admin_server = AdminServer::bind(
            admin.address,
            admin.metrics_path.clone(),
            Arc::clone(&server),
            Arc::clone(&root),
            metrics.clone(),
        )
        .await
        .with_context(|| format!("failed to bind admin server on {}", admin.address))?;
        tokio::spawn(admin_server.run(shutdown.subscribe()));
    }

    let watcher = {
        let server = Arc::clone(&server);
        let listeners = Arc::clone(&listeners);
        ConfigWatcher::new(
            path,
            Box::new(move |new_config: Config| {
                let frontends = new_config.frontends.clone();
                server.swap_config(new_config);
                let listeners = Arc::clone(&listeners);
                tokio::spawn(async move {
                    listeners.apply(&frontends).await;
                });
            }),
        )
    };
    tokio::spawn(watcher.run(shutdown.subscribe()));

    info!("rustdrain is running");
    info!("press Ctrl+C to drain, twice to stop at once");

    let reason = wait_for_shutdown(&server, &root).await;
    if reason == ShutdownReason::Signal {
        shutdown.shutdown(reason);
    }
    info!(reason = %reason, "shutting down");

    listeners.stop_all().await;

    info!("rustdrain shut down complete");
    Ok(())
}

/// Drain on the first signal and return once shutdown is due.
async fn wait_for_shutdown(server: &Server, root: &DrainManager) -> ShutdownReason {
    let mut shutdown_rx = server.shutdown_signal().subscribe();

    #[cfg(unix)]
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(error = %e, "failed to setup SIGTERM handler");
            None
        }
    };

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!(error = %e, "failed to listen for shutdown signal");
                    return ShutdownReason::Signal;
                }
                if server.drain_started() {
                    warn!("received second shutdown signal, exiting now");
                    return ShutdownReason::Signal;
                }
                info!("received shutdown signal, draining");
                server.start_drain(root);
            }

            _ = async {
                #[cfg(unix)]
                {
                    match sigterm.as_mut() {
                        Some(sig) => sig.recv().await,
                        None => std::future::pending::<Option<()>>().await,
                    }
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<Option<()>>().await
                }
            } => {
                if server.drain_started() {
                    warn!("received second SIGTERM, exiting now");
                    return ShutdownReason::Signal;
                }
                info!("received SIGTERM, draining");
                server.start_drain(root);
            }

            result = shutdown_rx.recv() => {
                match result {
                    Ok(reason) => return reason,
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return ShutdownReason::Signal,
                }
            }
        }
    }
}
