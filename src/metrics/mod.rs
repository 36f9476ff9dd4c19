//! Metrics collection and the admin endpoint.

mod collector;
mod server;

pub use collector::{Decision, MetricsCollector};
pub use server::AdminServer;
