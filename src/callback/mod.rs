//! Multi-subscriber notification with handle-based cancellation.

mod registry;

pub use registry::{CallbackHandle, CallbackRegistry};
