//! Metrics collector using prometheus-client.
//!
//! Provides metrics for connections, keep-alive decisions and drain progress.

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue, LabelValueEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::fmt::Write;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

/// Labels for connection metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct FrontendLabels {
    pub frontend: String,
}

/// Labels for request metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub frontend: String,
    pub decision: Decision,
}

/// What a response told the client to do with its connection.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub enum Decision {
    KeepAlive,
    DrainClose,
}

impl EncodeLabelValue for Decision {
    fn encode(&self, encoder: &mut LabelValueEncoder) -> Result<(), std::fmt::Error> {
        match self {
            Decision::KeepAlive => encoder.write_str("keep_alive"),
            Decision::DrainClose => encoder.write_str("drain_close"),
        }
    }
}

/// Labels for drain manager metrics ("root" or "listener:<name>").
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScopeLabels {
    pub scope: String,
}

/// Collects and stores all metrics.
#[derive(Clone)]
pub struct MetricsCollector {
    inner: Arc<MetricsCollectorInner>,
}

struct MetricsCollectorInner {
    /// Total connections counter.
    connections_total: Family<FrontendLabels, Counter>,
    /// Active connections gauge.
    active_connections: Family<FrontendLabels, Gauge>,
    /// Responses by keep-alive decision.
    requests_total: Family<RequestLabels, Counter>,
    /// Draining gauge (1 = draining, 0 = healthy).
    draining: Family<ScopeLabels, Gauge>,
    /// Time left in the drain window.
    drain_remaining_seconds: Family<ScopeLabels, Gauge<f64, AtomicU64>>,
    /// Drain sequences that ran to completion.
    drain_sequences_completed: Family<ScopeLabels, Counter>,
    /// The prometheus registry.
    registry: Registry,
}

impl MetricsCollector {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let connections_total = Family::<FrontendLabels, Counter>::default();
        let active_connections = Family::<FrontendLabels, Gauge>::default();
        let requests_total = Family::<RequestLabels, Counter>::default();
        let draining = Family::<ScopeLabels, Gauge>::default();
        let drain_remaining_seconds = Family::<ScopeLabels, Gauge<f64, AtomicU64>>::default();
        let drain_sequences_completed = Family::<ScopeLabels, Counter>::default();

        registry.register(
            "rustdrain_connections",
            "Total number of accepted connections",
            connections_total.clone(),
        );
        registry.register(
            "rustdrain_active_connections",
            "Number of open connections",
            active_connections.clone(),
        );
        registry.register(
            "rustdrain_requests",
            "Total number of responses by keep-alive decision",
            requests_total.clone(),
        );
        registry.register(
            "rustdrain_draining",
            "Drain state (1=draining, 0=healthy)",
            draining.clone(),
        );
        registry.register(
            "rustdrain_drain_remaining_seconds",
            "Seconds left in the drain window",
            drain_remaining_seconds.clone(),
        );
        registry.register(
            "rustdrain_drain_sequences_completed",
            "Total number of drain sequences that reached their deadline",
            drain_sequences_completed.clone(),
        );

        Self {
            inner: Arc::new(MetricsCollectorInner {
                connections_total,
                active_connections,
                requests_total,
                draining,
                drain_remaining_seconds,
                drain_sequences_completed,
                registry,
            }),
        }
    }

    /// Get the prometheus registry for encoding.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Increment active connections.
    pub fn connection_opened(&self, frontend: &str) {
        let labels = FrontendLabels {
            frontend: frontend.to_string(),
        };
        self.inner.active_connections.get_or_create(&labels).inc();
        self.inner.connections_total.get_or_create(&labels).inc();
    }

    /// Decrement active connections.
    pub fn connection_closed(&self, frontend: &str) {
        let labels = FrontendLabels {
            frontend: frontend.to_string(),
        };
        self.inner.active_connections.get_or_create(&labels).dec();
    }

    /// Record a response and the keep-alive decision it carried.
    pub fn request_served(&self, frontend: &str, drain_close: bool) {
        let labels = RequestLabels {
            frontend: frontend.to_string(),
            decision: if drain_close {
                Decision::DrainClose
            } else {
                Decision::KeepAlive
            },
        };
        self.inner.requests_total.get_or_create(&labels).inc();
    }

    /// Update the drain state of a scope.
    pub fn set_draining(&self, scope: &str, draining: bool) {
        let labels = ScopeLabels {
            scope: scope.to_string(),
        };
        self.inner
            .draining
            .get_or_create(&labels)
            .set(if draining { 1 } else { 0 });
    }

    /// Update the time left in a scope's drain window.
    pub fn set_drain_remaining(&self, scope: &str, remaining: Duration) {
        let labels = ScopeLabels {
            scope: scope.to_string(),
        };
        self.inner
            .drain_remaining_seconds
            .get_or_create(&labels)
            .set(remaining.as_secs_f64());
    }

    /// Count a drain sequence that reached its deadline.
    pub fn drain_completed(&self, scope: &str) {
        let labels = ScopeLabels {
            scope: scope.to_string(),
        };
        self.inner
            .drain_sequences_completed
            .get_or_create(&labels)
            .inc();
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
