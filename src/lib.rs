//! rustdrain - drain management for graceful shutdown
//!
//! This crate decides, connection by connection, when a server that is about
//! to stop should close keep-alive connections. It provides:
//! - Serial dispatchers with cancellable one-shot timers
//! - A callback registry with safe unsubscription
//! - Drain managers with gradual and immediate drain types, parent/child
//!   scopes and parent shutdown timers
//! - An HTTP/1.1 host with hot-reloaded listeners and an admin endpoint

pub mod callback;
pub mod config;
pub mod drain;
pub mod event;
pub mod frontend;
pub mod metrics;
pub mod server;
pub mod util;

pub use config::Config;
pub use drain::{DrainDecision, DrainManager, DrainOptions, DrainServer, DrainType};
pub use server::Server;
