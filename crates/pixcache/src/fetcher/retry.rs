// Retry protocol building blocks: status classification, adaptive timeouts and backoff.

use std::time::Duration;

use rand::Rng;

use crate::error::FetchError;
use crate::fetcher::transport::TransportResponse;

const BACKOFF_BASE_MS: u64 = 500;
const BACKOFF_JITTER_MS: u64 = 500;
const BACKOFF_CAP: Duration = Duration::from_secs(15);
const TIMEOUT_STEP: Duration = Duration::from_secs(3);

/// Upper bound on draining the body of a retryable error response.
pub(crate) const DRAIN_CAP: Duration = Duration::from_secs(5);

/// Statuses worth another attempt: throttling, gateway trouble and the
/// Cloudflare 52x family.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504 | 520..=525)
}

/// Timeout for attempt `attempt` (0-based): the base grows by 3s per retry.
pub fn adaptive_timeout(base: Duration, attempt: u32) -> Duration {
    base.saturating_add(TIMEOUT_STEP.saturating_mul(attempt))
}

/// Backoff after failed attempt `attempt` (0-based), with random jitter.
pub fn backoff_delay(attempt: u32) -> Duration {
    let jitter = rand::rng().random_range(0..BACKOFF_JITTER_MS);
    backoff_with_jitter(attempt, jitter)
}

pub(crate) fn backoff_with_jitter(attempt: u32, jitter_ms: u64) -> Duration {
    let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    let base = BACKOFF_BASE_MS.saturating_mul(factor);
    Duration::from_millis(base.saturating_add(jitter_ms)).min(BACKOFF_CAP)
}

/// Outcome of a single network attempt
pub(crate) enum AttemptOutcome {
    /// Usable response (2xx or 304)
    Success(TransportResponse),
    /// Failed, another attempt may succeed
    Retryable(FetchError),
    /// Failed, retrying will not help
    Fatal(FetchError),
}

impl AttemptOutcome {
    pub(crate) fn from_error(error: FetchError) -> Self {
        if error.is_retryable() {
            AttemptOutcome::Retryable(error)
        } else {
            AttemptOutcome::Fatal(error)
        }
    }
}
