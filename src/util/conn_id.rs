//! Connection identifiers for log correlation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter for connection IDs.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Process-unique identifier for an accepted connection.
///
/// Formatted as `conn-{counter}` with the counter zero-padded to 16 hex digits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Allocate the next identifier.
    pub fn next() -> Self {
        Self(CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{:016x}", self.0)
    }
}
