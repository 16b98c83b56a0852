//! # Fetch Metrics
//!
//! Observation records emitted by the fetch layer. Sinks are purely
//! observational: whatever a sink does, including panicking, never changes
//! the outcome of a fetch.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    FetchStarted,
    FetchSucceeded,
    FetchFailed,
    RetryAttempt,
    CircuitBreakerTripped,
    StaleIfErrorServed,
    CaptivePortalDetected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricEvent {
    pub kind: MetricKind,
    pub url: String,
    pub host: Option<String>,
    pub status_code: Option<u16>,
    pub attempt: Option<u32>,
    pub duration: Option<Duration>,
    pub error: Option<String>,
}

impl MetricEvent {
    pub fn new(kind: MetricKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            host: None,
            status_code: None,
            attempt: None,
            duration: None,
            error: None,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_status_option(mut self, status: Option<u16>) -> Self {
        self.status_code = status;
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn with_error(mut self, error: impl ToString) -> Self {
        self.error = Some(error.to_string());
        self
    }
}

/// Receiver of metric events
pub trait MetricsSink: Send + Sync {
    fn record(&self, event: &MetricEvent);
}

/// Sink that forwards every event to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn record(&self, event: &MetricEvent) {
        let host = event.host.as_deref().unwrap_or("-");
        match event.kind {
            MetricKind::FetchStarted | MetricKind::RetryAttempt => debug!(
                kind = ?event.kind,
                url = %event.url,
                host,
                attempt = ?event.attempt,
                "fetch event"
            ),
            MetricKind::FetchSucceeded => debug!(
                url = %event.url,
                host,
                status = ?event.status_code,
                attempt = ?event.attempt,
                duration_ms = ?event.duration.map(|d| d.as_millis()),
                "fetch succeeded"
            ),
            MetricKind::StaleIfErrorServed => info!(
                url = %event.url,
                host,
                error = ?event.error,
                "served stale content after fetch failure"
            ),
            MetricKind::FetchFailed
            | MetricKind::CircuitBreakerTripped
            | MetricKind::CaptivePortalDetected => warn!(
                kind = ?event.kind,
                url = %event.url,
                host,
                status = ?event.status_code,
                attempt = ?event.attempt,
                error = ?event.error,
                "fetch problem"
            ),
        }
    }
}

/// Shared, swappable holder for the optional sink.
///
/// Fetchers keep a handle to the hub rather than to a sink, so a sink
/// installed after they were built still receives their events.
#[derive(Default)]
pub struct MetricsHub {
    sink: RwLock<Option<Arc<dyn MetricsSink>>>,
}

impl std::fmt::Debug for MetricsHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsHub")
            .field("has_sink", &self.sink.read().is_some())
            .finish()
    }
}

impl MetricsHub {
    pub fn set_sink(&self, sink: Option<Arc<dyn MetricsSink>>) {
        *self.sink.write() = sink;
    }

    pub fn has_sink(&self) -> bool {
        self.sink.read().is_some()
    }

    pub fn emit(&self, event: MetricEvent) {
        let sink = self.sink.read().clone();
        let Some(sink) = sink else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| sink.record(&event))).is_err() {
            warn!(kind = ?event.kind, "Metrics sink panicked; event dropped");
        }
    }
}
