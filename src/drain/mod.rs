//! Drain management.
//!
//! A [`DrainManager`] decides, for any connection or request, whether it should
//! be closed now instead of kept alive, and drives the timers that move the
//! process from healthy to draining to terminated.

mod manager;
mod server;

pub use manager::DrainManager;
pub use server::{DrainOptions, DrainServer};

use crate::callback::CallbackHandle;
use crate::event::Dispatcher;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// How closing ramps up once draining starts.
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DrainType {
    /// Close probability rises linearly across the drain window.
    #[default]
    Gradual,
    /// Every decision closes once draining starts.
    Immediate,
}

impl fmt::Display for DrainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DrainType::Gradual => f.write_str("gradual"),
            DrainType::Immediate => f.write_str("immediate"),
        }
    }
}

impl FromStr for DrainType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gradual" => Ok(DrainType::Gradual),
            "immediate" => Ok(DrainType::Immediate),
            other => Err(format!(
                "invalid drain type '{}', must be one of: gradual, immediate",
                other
            )),
        }
    }
}

/// Callback delivered on each drain notification with the remaining drain time.
pub type DrainCloseCb = Box<dyn Fn(Duration) + Send + Sync>;

/// The decision surface consulted by connection-handling code.
pub trait DrainDecision: Send + Sync {
    /// Whether the caller should close its connection now.
    ///
    /// Never blocks; safe to call from any context at any rate.
    fn drain_close(&self) -> bool;

    /// Register `cb` to run on `dispatcher` whenever the drain state advances.
    ///
    /// Dropping the returned handle unregisters the callback.
    fn add_on_drain_close_cb(&self, dispatcher: &Dispatcher, cb: DrainCloseCb) -> CallbackHandle;
}
