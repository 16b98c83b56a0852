//! # Host Circuit Breaker
//!
//! Tracks consecutive failures per host and fails fast once a host has
//! crossed the failure threshold. After the reset window a single probe
//! request is admitted; its outcome either closes the circuit again or
//! re-opens it for another window.
//!
//! ```text
//! Closed   --threshold failures-->  Open
//! Open     --reset window elapsed--> HalfOpen (claimed by one caller)
//! HalfOpen --success-->              Closed
//! HalfOpen --failure-->              Open
//! ```

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Phase of a single host circuit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CircuitPhase {
    #[default]
    Closed,
    Open {
        opened_at: Instant,
    },
    HalfOpen {
        probe_in_flight: bool,
    },
}

/// Per-host circuit bookkeeping
#[derive(Debug, Clone, Default)]
pub struct HostCircuitState {
    pub consecutive_failures: u32,
    pub phase: CircuitPhase,
}

impl HostCircuitState {
    pub fn is_open(&self) -> bool {
        matches!(self.phase, CircuitPhase::Open { .. })
    }

    pub fn is_half_open(&self) -> bool {
        matches!(self.phase, CircuitPhase::HalfOpen { .. })
    }

    pub fn probe_in_flight(&self) -> bool {
        matches!(
            self.phase,
            CircuitPhase::HalfOpen {
                probe_in_flight: true
            }
        )
    }

}

/// Answer of [`HostCircuitBreaker::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Denied,
    Allowed,
    /// Allowed as the single half-open probe; the caller owns the slot
    /// until it records an outcome or releases it.
    Probe,
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        !matches!(self, Admission::Denied)
    }
}

/// Claimed half-open probe slot that is handed back if dropped unresolved.
///
/// A caller that is cancelled between admission and recording an outcome
/// would otherwise leave the host half-open with its only slot taken.
#[derive(Debug)]
pub struct ProbeClaim<'a> {
    breaker: &'a HostCircuitBreaker,
    host: &'a str,
    armed: bool,
}

impl<'a> ProbeClaim<'a> {
    /// Guard for `admission` on `host`. Only a [`Admission::Probe`] arms it.
    pub fn new(breaker: &'a HostCircuitBreaker, host: &'a str, admission: Admission) -> Self {
        Self {
            breaker,
            host,
            armed: admission == Admission::Probe,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// The outcome has been recorded on the breaker; nothing to hand back.
    pub fn settle(&mut self) {
        self.armed = false;
    }

    /// End the claim without judging the host. Frees the slot only if this
    /// caller holds it.
    pub fn release(mut self) {
        if self.armed {
            self.armed = false;
            self.breaker.release_probe(self.host);
        }
    }
}

impl Drop for ProbeClaim<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(host = self.host, "Probe abandoned before completing, releasing slot");
            self.breaker.release_probe(self.host);
        }
    }
}

/// Shared per-host circuit breaker.
///
/// Every read-modify-write happens under one lock, so claiming the
/// half-open probe slot is a single indivisible step.
#[derive(Debug)]
pub struct HostCircuitBreaker {
    hosts: Mutex<HashMap<String, HostCircuitState>>,
    failure_threshold: u32,
    reset_duration: Duration,
}

impl Default for HostCircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl HostCircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            failure_threshold: config.failure_threshold.max(1),
            reset_duration: config.reset_duration,
        }
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn reset_duration(&self) -> Duration {
        self.reset_duration
    }

    /// Decide whether a request to `host` may go out.
    ///
    /// Not a pure query: an open circuit whose reset window has elapsed moves
    /// to half-open here, and the caller that observes that transition claims
    /// the only probe slot.
    pub fn allow_request(&self, host: &str) -> bool {
        self.admit(host).is_allowed()
    }

    /// Like [`allow_request`](Self::allow_request), but tells a probe
    /// admission apart from a regular one.
    pub fn admit(&self, host: &str) -> Admission {
        let mut hosts = self.hosts.lock();
        let Some(state) = hosts.get_mut(host) else {
            return Admission::Allowed;
        };

        match state.phase {
            CircuitPhase::Closed => Admission::Allowed,
            CircuitPhase::Open { opened_at } => {
                if opened_at.elapsed() >= self.reset_duration {
                    state.phase = CircuitPhase::HalfOpen {
                        probe_in_flight: true,
                    };
                    debug!(host, "Circuit half-open, admitting probe request");
                    Admission::Probe
                } else {
                    Admission::Denied
                }
            }
            CircuitPhase::HalfOpen {
                probe_in_flight: true,
            } => Admission::Denied,
            CircuitPhase::HalfOpen {
                probe_in_flight: false,
            } => {
                state.phase = CircuitPhase::HalfOpen {
                    probe_in_flight: true,
                };
                Admission::Probe
            }
        }
    }

    /// Whether the circuit for `host` is open. Never transitions state.
    pub fn is_open(&self, host: &str) -> bool {
        self.hosts.lock().get(host).is_some_and(|s| s.is_open())
    }

    /// Whether the circuit for `host` is half-open. Never transitions state.
    pub fn is_half_open(&self, host: &str) -> bool {
        self.hosts.lock().get(host).is_some_and(|s| s.is_half_open())
    }

    /// Snapshot of a host's state, if it has any history.
    pub fn state(&self, host: &str) -> Option<HostCircuitState> {
        self.hosts.lock().get(host).cloned()
    }

    pub fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.lock();
        if let Some(state) = hosts.get_mut(host) {
            if !matches!(state.phase, CircuitPhase::Closed) {
                info!(host, "Circuit closed after successful request");
            }
            *state = HostCircuitState::default();
        }
    }

    /// Record a failed request. Returns `true` when this call opened the circuit.
    pub fn record_failure(&self, host: &str) -> bool {
        let mut hosts = self.hosts.lock();
        let state = hosts.entry(host.to_string()).or_default();

        match state.phase {
            CircuitPhase::HalfOpen { .. } => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                state.phase = CircuitPhase::Open {
                    opened_at: Instant::now(),
                };
                warn!(host, "Probe failed, circuit re-opened");
                true
            }
            CircuitPhase::Open { .. } => {
                // A request admitted before the trip is still reporting back.
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                false
            }
            CircuitPhase::Closed => {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.consecutive_failures >= self.failure_threshold {
                    state.phase = CircuitPhase::Open {
                        opened_at: Instant::now(),
                    };
                    warn!(
                        host,
                        failures = state.consecutive_failures,
                        "Circuit opened"
                    );
                    true
                } else {
                    debug!(
                        host,
                        failures = state.consecutive_failures,
                        threshold = self.failure_threshold,
                        "Recorded host failure"
                    );
                    false
                }
            }
        }
    }

    /// Give back a claimed probe slot without judging host health.
    ///
    /// Used when the admitted request ended in a way that says nothing about
    /// the host, e.g. a captive portal answered instead.
    pub fn release_probe(&self, host: &str) {
        let mut hosts = self.hosts.lock();
        if let Some(state) = hosts.get_mut(host) {
            if let CircuitPhase::HalfOpen {
                probe_in_flight: true,
            } = state.phase
            {
                state.phase = CircuitPhase::HalfOpen {
                    probe_in_flight: false,
                };
            }
        }
    }

    pub fn reset(&self, host: &str) {
        if self.hosts.lock().remove(host).is_some() {
            debug!(host, "Circuit reset manually");
        }
    }

    pub fn reset_all(&self) {
        let mut hosts = self.hosts.lock();
        let count = hosts.len();
        hosts.clear();
        debug!(count, "All circuits reset");
    }
}
