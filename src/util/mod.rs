//! Utility functions and helpers.

mod conn_id;
mod logging;
mod shutdown;

pub use conn_id::ConnectionId;
pub use logging::{init_logging, LoggingError};
pub use shutdown::{ShutdownReason, ShutdownSignal};
