//! # Resilient Fetcher
//!
//! Retrieves image bytes over unreliable links. A fetch takes a slot of the
//! global pool, asks the host circuit breaker for admission, then runs up to
//! `max_retry_attempts` attempts with growing timeouts, connectivity probes
//! between attempts and jittered exponential backoff. Successful bodies are
//! wrapped in a [`GuardedStream`] and their freshness is clamped to the
//! bucket policy. Revalidation requests that cannot reach the origin are
//! answered with a synthetic "not modified" response instead of an error.

mod probe;
mod response;
mod retry;
mod stream;
mod transport;

pub use probe::{ConnectivityProbe, DnsProbe};
pub use response::{
    FetchResponse, NetworkResponse, ResponseMeta, STATUS_NOT_MODIFIED, STATUS_OK, StaleResponse,
};
pub use retry::{adaptive_timeout, backoff_delay, is_retryable_status};
pub use stream::GuardedStream;
pub use transport::{BodyStream, HttpTransport, ReqwestTransport, TransportResponse, create_client};

pub(crate) use response::add_duration;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::StreamExt;
use reqwest::header::{
    ACCEPT_ENCODING, ETAG, HeaderMap, HeaderValue, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED,
    USER_AGENT,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};
use url::Url;

use crate::circuit::{HostCircuitBreaker, ProbeClaim};
use crate::config::RegistryConfig;
use crate::error::FetchError;
use crate::events::{MetricEvent, MetricKind, MetricsHub};
use crate::policy::BucketPolicy;

use response::{clamp_valid_till, server_freshness};
use retry::{AttemptOutcome, DRAIN_CAP};

/// Process-wide collaborators shared by every fetcher.
///
/// Built once by the registry; cloning only bumps reference counts.
#[derive(Clone)]
pub struct FetchContext {
    pool: Arc<Semaphore>,
    breaker: Arc<HostCircuitBreaker>,
    transport: Arc<dyn HttpTransport>,
    probe: Arc<dyn ConnectivityProbe>,
    metrics: Arc<MetricsHub>,
    user_agent: HeaderValue,
    captive_portal_extensions: Arc<[String]>,
    sniff_content: bool,
}

impl std::fmt::Debug for FetchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchContext")
            .field("available_permits", &self.pool.available_permits())
            .field("user_agent", &self.user_agent)
            .field("captive_portal_extensions", &self.captive_portal_extensions)
            .field("sniff_content", &self.sniff_content)
            .finish_non_exhaustive()
    }
}

impl FetchContext {
    pub fn new(
        config: &RegistryConfig,
        transport: Arc<dyn HttpTransport>,
        probe: Arc<dyn ConnectivityProbe>,
    ) -> Self {
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .unwrap_or_else(|_| HeaderValue::from_static(crate::config::DEFAULT_USER_AGENT));
        Self {
            pool: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            breaker: Arc::new(HostCircuitBreaker::new(config.circuit_breaker)),
            transport,
            probe,
            metrics: Arc::new(MetricsHub::default()),
            user_agent,
            captive_portal_extensions: config
                .captive_portal_extensions
                .iter()
                .map(|e| e.to_ascii_lowercase())
                .collect(),
            sniff_content: config.sniff_content,
        }
    }

    pub fn breaker(&self) -> &Arc<HostCircuitBreaker> {
        &self.breaker
    }

    pub fn metrics(&self) -> &Arc<MetricsHub> {
        &self.metrics
    }

    pub fn available_permits(&self) -> usize {
        self.pool.available_permits()
    }

    fn is_captive_extension(&self, extension: &str) -> bool {
        let extension = extension.to_ascii_lowercase();
        self.captive_portal_extensions
            .iter()
            .any(|e| *e == extension)
    }
}

/// Conditional headers of a revalidation request.
#[derive(Debug, Clone)]
struct Revalidation {
    etag: Option<String>,
}

impl Revalidation {
    fn from_headers(headers: &HeaderMap) -> Option<Self> {
        if !headers.contains_key(IF_NONE_MATCH) && !headers.contains_key(IF_MODIFIED_SINCE) {
            return None;
        }
        let etag = headers
            .get(IF_NONE_MATCH)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Some(Self { etag })
    }
}

/// Fetcher bound to one bucket policy
#[derive(Debug, Clone)]
pub struct ResilientFetcher {
    ctx: FetchContext,
    policy: Arc<BucketPolicy>,
}

impl ResilientFetcher {
    pub fn new(ctx: FetchContext, policy: BucketPolicy) -> Self {
        Self {
            ctx,
            policy: Arc::new(policy),
        }
    }

    pub fn policy(&self) -> &BucketPolicy {
        &self.policy
    }

    /// Fetch `url`, retrying transient failures.
    ///
    /// `headers` may carry `If-None-Match`/`If-Modified-Since`; such
    /// revalidation requests degrade to a stale response when the origin is
    /// unreachable or its circuit is open.
    pub async fn fetch(
        &self,
        url: &str,
        headers: Option<&HeaderMap>,
    ) -> Result<FetchResponse, FetchError> {
        let parsed = Url::parse(url).map_err(|e| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        let host = parsed
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl {
                url: url.to_string(),
                reason: "missing host".into(),
            })?
            .to_string();

        let mut headers = headers.cloned().unwrap_or_default();
        let revalidation = Revalidation::from_headers(&headers);

        // Moves into the response body, so the slot covers the transfer too.
        let permit = self
            .ctx
            .pool
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| FetchError::Transport("global fetch pool closed".into()))?;

        let started = Instant::now();
        self.emit(MetricEvent::new(MetricKind::FetchStarted, url).with_host(&host));

        let admission = self.ctx.breaker.admit(&host);
        if !admission.is_allowed() {
            let error = FetchError::CircuitOpen(host.clone());
            self.emit(
                MetricEvent::new(MetricKind::FetchFailed, url)
                    .with_host(&host)
                    .with_error(&error),
            );
            if let Some(revalidation) = revalidation {
                debug!(url, host = %host, "Circuit open, serving stale for revalidation");
                return Ok(self.stale_response(url, &host, &parsed, revalidation, &error));
            }
            return Err(error);
        }
        let mut claim = ProbeClaim::new(&self.ctx.breaker, &host, admission);

        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, self.ctx.user_agent.clone());
        }
        if !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        }

        let max_attempts = self.policy.max_retry_attempts.max(1);
        let mut attempt: u32 = 0;

        loop {
            if attempt > 0 {
                if let Err(error) = self.ctx.probe.check(&parsed).await {
                    warn!(url, host = %host, error = %error, "Connectivity probe failed, giving up");
                    claim.release();
                    self.emit(
                        MetricEvent::new(MetricKind::FetchFailed, url)
                            .with_host(&host)
                            .with_attempt(attempt + 1)
                            .with_error(&error),
                    );
                    return Err(error);
                }
            }

            let timeout = adaptive_timeout(self.policy.response_timeout, attempt);
            match self.attempt(&parsed, &headers, timeout).await {
                AttemptOutcome::Success(response) => {
                    self.ctx.breaker.record_success(&host);
                    claim.settle();
                    let response = self.wrap_success(
                        url,
                        &parsed,
                        response,
                        revalidation.as_ref(),
                        permit,
                    );
                    self.emit(
                        MetricEvent::new(MetricKind::FetchSucceeded, url)
                            .with_host(&host)
                            .with_status(response.status_code())
                            .with_attempt(attempt + 1)
                            .with_duration(started.elapsed()),
                    );
                    return Ok(response);
                }
                AttemptOutcome::Fatal(error) => {
                    // The host answered; the answer just is not usable.
                    claim.release();
                    if matches!(error, FetchError::CaptivePortal(_)) {
                        self.emit(
                            MetricEvent::new(MetricKind::CaptivePortalDetected, url)
                                .with_host(&host)
                                .with_status(STATUS_OK)
                                .with_attempt(attempt + 1)
                                .with_error(&error),
                        );
                    }
                    self.emit(
                        MetricEvent::new(MetricKind::FetchFailed, url)
                            .with_host(&host)
                            .with_status_option(error.status_code())
                            .with_attempt(attempt + 1)
                            .with_duration(started.elapsed())
                            .with_error(&error),
                    );
                    return Err(error);
                }
                AttemptOutcome::Retryable(error) => {
                    let tripped = self.ctx.breaker.record_failure(&host);
                    claim.settle();
                    if tripped {
                        self.emit(
                            MetricEvent::new(MetricKind::CircuitBreakerTripped, url)
                                .with_host(&host)
                                .with_attempt(attempt + 1)
                                .with_error(&error),
                        );
                    }

                    attempt += 1;
                    if attempt >= max_attempts {
                        let exhausted = FetchError::RetryExhausted {
                            url: url.to_string(),
                            attempts: attempt,
                            last: Box::new(error),
                        };
                        self.emit(
                            MetricEvent::new(MetricKind::FetchFailed, url)
                                .with_host(&host)
                                .with_status_option(exhausted.status_code())
                                .with_attempt(attempt)
                                .with_duration(started.elapsed())
                                .with_error(&exhausted),
                        );
                        if let Some(revalidation) = revalidation {
                            return Ok(self.stale_response(
                                url,
                                &host,
                                &parsed,
                                revalidation,
                                &exhausted,
                            ));
                        }
                        return Err(exhausted);
                    }

                    let delay = backoff_delay(attempt - 1);
                    debug!(
                        url,
                        host = %host,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, backing off"
                    );
                    self.emit(
                        MetricEvent::new(MetricKind::RetryAttempt, url)
                            .with_host(&host)
                            .with_status_option(error.status_code())
                            .with_attempt(attempt + 1)
                            .with_duration(delay)
                            .with_error(&error),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// One network round trip, classified.
    async fn attempt(
        &self,
        url: &Url,
        headers: &HeaderMap,
        timeout: std::time::Duration,
    ) -> AttemptOutcome {
        let response = match tokio::time::timeout(timeout, self.ctx.transport.get(url, headers)).await
        {
            Err(_) => return AttemptOutcome::Retryable(FetchError::Timeout(timeout)),
            Ok(Err(error)) => return AttemptOutcome::from_error(error),
            Ok(Ok(response)) => response,
        };

        let status = response.status;
        if is_retryable_status(status) {
            drain(response).await;
            return AttemptOutcome::Retryable(FetchError::RetryableStatus(status));
        }

        if status == STATUS_OK {
            let extension = response.file_extension(url);
            if self.ctx.is_captive_extension(&extension) {
                return AttemptOutcome::Fatal(FetchError::CaptivePortal(format!(
                    "{url} answered 200 with {extension} content"
                )));
            }
        }

        if (200..300).contains(&status) || status == STATUS_NOT_MODIFIED {
            return AttemptOutcome::Success(response);
        }

        AttemptOutcome::Fatal(FetchError::Status(status))
    }

    fn wrap_success(
        &self,
        url: &str,
        parsed: &Url,
        response: TransportResponse,
        revalidation: Option<&Revalidation>,
        permit: OwnedSemaphorePermit,
    ) -> FetchResponse {
        let received_at = Utc::now();
        let valid_till = clamp_valid_till(
            received_at,
            server_freshness(&response.headers, received_at),
            &self.policy,
        );

        let etag = response
            .header_str(ETAG)
            .map(str::to_string)
            .or_else(|| {
                // A 304 without an ETag still refers to the validator we sent.
                (response.status == STATUS_NOT_MODIFIED)
                    .then(|| revalidation.and_then(|r| r.etag.clone()))
                    .flatten()
            });
        let last_modified = response.header_str(LAST_MODIFIED).map(str::to_string);
        let content_length = response.content_length();
        let file_extension = response.file_extension(parsed);

        let body = GuardedStream::new(
            response.body,
            self.policy.stream_timeout,
            self.ctx.sniff_content && response.status == STATUS_OK,
        )
        .with_metrics(
            url,
            parsed.host_str().unwrap_or_default(),
            response.status,
            self.ctx.metrics.clone(),
        )
        .with_permit(permit);

        FetchResponse::Network(NetworkResponse {
            status: response.status,
            received_at,
            valid_till,
            etag,
            last_modified,
            content_length,
            file_extension,
            body,
        })
    }

    fn stale_response(
        &self,
        url: &str,
        host: &str,
        parsed: &Url,
        revalidation: Revalidation,
        cause: &FetchError,
    ) -> FetchResponse {
        info!(url, host, error = %cause, "Serving stale content for failed revalidation");
        self.emit(
            MetricEvent::new(MetricKind::StaleIfErrorServed, url)
                .with_host(host)
                .with_status(STATUS_NOT_MODIFIED)
                .with_error(cause),
        );
        FetchResponse::Stale(StaleResponse {
            valid_till: add_duration(Utc::now(), self.policy.min_fresh),
            etag: revalidation.etag,
            file_extension: transport::file_extension_for(None, parsed),
        })
    }

    fn emit(&self, event: MetricEvent) {
        self.ctx.metrics.emit(event);
    }
}

/// Best-effort read of an error body so the connection can be reused.
async fn drain(response: TransportResponse) {
    let mut body = response.body;
    let _ = tokio::time::timeout(DRAIN_CAP, async {
        while let Some(chunk) = body.next().await {
            if chunk.is_err() {
                break;
            }
        }
    })
    .await;
}
