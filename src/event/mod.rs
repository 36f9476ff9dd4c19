//! Execution contexts and timers.

mod dispatcher;

pub use dispatcher::{deadline_after, Dispatcher, DispatcherId, Timer};
