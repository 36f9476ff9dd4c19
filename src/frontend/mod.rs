//! Frontend listeners.
//!
//! Accepts client connections and answers them over HTTP/1.1, closing
//! keep-alive connections as the drain decision dictates.

mod listener;
mod manager;

pub use listener::FrontendListener;
pub use manager::{watch_drain_progress, ListenerError, ListenerManager};
