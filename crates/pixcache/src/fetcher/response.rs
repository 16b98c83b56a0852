use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, TimeDelta, Utc};
use futures::StreamExt;
use reqwest::header::{CACHE_CONTROL, EXPIRES, HeaderMap};

use crate::error::FetchError;
use crate::fetcher::stream::GuardedStream;
use crate::fetcher::transport::BodyStream;
use crate::policy::BucketPolicy;

pub const STATUS_OK: u16 = 200;
pub const STATUS_NOT_MODIFIED: u16 = 304;

/// Capabilities shared by every kind of fetch response.
pub trait ResponseMeta {
    fn status_code(&self) -> u16;
    fn valid_till(&self) -> DateTime<Utc>;
    fn etag(&self) -> Option<&str>;
    fn last_modified(&self) -> Option<&str>;
    fn content_length(&self) -> Option<u64>;
    fn file_extension(&self) -> &str;
}

/// A response that actually came off the network
pub struct NetworkResponse {
    pub(crate) status: u16,
    pub(crate) received_at: DateTime<Utc>,
    pub(crate) valid_till: DateTime<Utc>,
    pub(crate) etag: Option<String>,
    pub(crate) last_modified: Option<String>,
    pub(crate) content_length: Option<u64>,
    pub(crate) file_extension: String,
    pub(crate) body: GuardedStream,
}

impl NetworkResponse {
    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

impl ResponseMeta for NetworkResponse {
    fn status_code(&self) -> u16 {
        self.status
    }

    fn valid_till(&self) -> DateTime<Utc> {
        self.valid_till
    }

    fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn last_modified(&self) -> Option<&str> {
        self.last_modified.as_deref()
    }

    fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    fn file_extension(&self) -> &str {
        &self.file_extension
    }
}

/// Synthetic "not modified" answer used when a revalidation cannot reach
/// the origin; the caller keeps serving what it already has.
#[derive(Debug, Clone)]
pub struct StaleResponse {
    pub(crate) valid_till: DateTime<Utc>,
    pub(crate) etag: Option<String>,
    pub(crate) file_extension: String,
}

impl ResponseMeta for StaleResponse {
    fn status_code(&self) -> u16 {
        STATUS_NOT_MODIFIED
    }

    fn valid_till(&self) -> DateTime<Utc> {
        self.valid_till
    }

    fn etag(&self) -> Option<&str> {
        self.etag.as_deref()
    }

    fn last_modified(&self) -> Option<&str> {
        None
    }

    fn content_length(&self) -> Option<u64> {
        Some(0)
    }

    fn file_extension(&self) -> &str {
        &self.file_extension
    }
}

/// Result of a successful `fetch`
pub enum FetchResponse {
    Network(NetworkResponse),
    Stale(StaleResponse),
}

impl std::fmt::Debug for FetchResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self {
            FetchResponse::Network(_) => "Network",
            FetchResponse::Stale(_) => "Stale",
        };
        f.debug_struct("FetchResponse")
            .field("variant", &variant)
            .field("status", &self.status_code())
            .field("valid_till", &self.valid_till())
            .field("etag", &self.etag())
            .field("file_extension", &self.file_extension())
            .finish()
    }
}

impl FetchResponse {
    pub fn is_stale(&self) -> bool {
        matches!(self, FetchResponse::Stale(_))
    }

    pub fn is_not_modified(&self) -> bool {
        self.status_code() == STATUS_NOT_MODIFIED
    }

    /// Consume the response into its body stream. Stale responses have an
    /// empty body.
    pub fn into_stream(self) -> BodyStream {
        match self {
            FetchResponse::Network(resp) => Box::pin(resp.body),
            FetchResponse::Stale(_) => Box::pin(futures::stream::empty()),
        }
    }

    /// Collect the whole body.
    pub async fn bytes(self) -> Result<Bytes, FetchError> {
        let capacity = self.content_length().unwrap_or(0).min(16 * 1024 * 1024) as usize;
        let mut stream = self.into_stream();
        let mut buf = BytesMut::with_capacity(capacity);
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl ResponseMeta for FetchResponse {
    fn status_code(&self) -> u16 {
        match self {
            FetchResponse::Network(r) => r.status_code(),
            FetchResponse::Stale(r) => r.status_code(),
        }
    }

    fn valid_till(&self) -> DateTime<Utc> {
        match self {
            FetchResponse::Network(r) => r.valid_till(),
            FetchResponse::Stale(r) => r.valid_till(),
        }
    }

    fn etag(&self) -> Option<&str> {
        match self {
            FetchResponse::Network(r) => r.etag(),
            FetchResponse::Stale(r) => r.etag(),
        }
    }

    fn last_modified(&self) -> Option<&str> {
        match self {
            FetchResponse::Network(r) => r.last_modified(),
            FetchResponse::Stale(r) => r.last_modified(),
        }
    }

    fn content_length(&self) -> Option<u64> {
        match self {
            FetchResponse::Network(r) => r.content_length(),
            FetchResponse::Stale(r) => r.content_length(),
        }
    }

    fn file_extension(&self) -> &str {
        match self {
            FetchResponse::Network(r) => r.file_extension(),
            FetchResponse::Stale(r) => r.file_extension(),
        }
    }
}

/// `at + duration`, saturating at the far future.
pub(crate) fn add_duration(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Freshness the server asked for, from `Cache-Control` or `Expires`.
pub(crate) fn server_freshness(headers: &HeaderMap, received_at: DateTime<Utc>) -> Option<Duration> {
    if let Some(cache_control) = headers.get(CACHE_CONTROL).and_then(|v| v.to_str().ok()) {
        for directive in cache_control.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            if directive == "no-cache" || directive == "no-store" {
                return Some(Duration::ZERO);
            }
            if let Some(value) = directive.strip_prefix("max-age=") {
                if let Ok(secs) = value.trim_matches('"').parse::<u64>() {
                    return Some(Duration::from_secs(secs));
                }
            }
        }
    }

    let expires = headers.get(EXPIRES).and_then(|v| v.to_str().ok())?;
    match DateTime::parse_from_rfc2822(expires.trim()) {
        Ok(at) => Some(
            at.with_timezone(&Utc)
                .signed_duration_since(received_at)
                .to_std()
                .unwrap_or(Duration::ZERO),
        ),
        // An unparseable Expires means "already expired".
        Err(_) => Some(Duration::ZERO),
    }
}

/// Clamp the server's freshness into the policy's `[min_fresh, max_fresh]`.
///
/// Without any server hint the upper bound is used. An inverted policy
/// window resolves to `max_fresh`.
pub(crate) fn clamp_valid_till(
    received_at: DateTime<Utc>,
    server: Option<Duration>,
    policy: &BucketPolicy,
) -> DateTime<Utc> {
    let fresh = server
        .unwrap_or(policy.max_fresh)
        .max(policy.min_fresh)
        .min(policy.max_fresh);
    add_duration(received_at, fresh)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Bucket;
    use reqwest::header::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs.iter().copied() {
            map.insert(k, HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn test_max_age_parsed() {
        let now = Utc::now();
        let h = headers(&[("cache-control", "public, max-age=120")]);
        assert_eq!(server_freshness(&h, now), Some(Duration::from_secs(120)));

        let h = headers(&[("cache-control", "no-store")]);
        assert_eq!(server_freshness(&h, now), Some(Duration::ZERO));

        assert_eq!(server_freshness(&HeaderMap::new(), now), None);
    }

    #[test]
    fn test_expires_parsed_relative_to_receipt() {
        let received = DateTime::parse_from_rfc2822("Wed, 21 Oct 2015 07:28:00 GMT")
            .unwrap()
            .with_timezone(&Utc);
        let h = headers(&[("expires", "Wed, 21 Oct 2015 08:28:00 GMT")]);
        assert_eq!(server_freshness(&h, received), Some(Duration::from_secs(3600)));

        let h = headers(&[("expires", "0")]);
        assert_eq!(server_freshness(&h, received), Some(Duration::ZERO));
    }

    #[test]
    fn test_valid_till_clamped_both_ways() {
        let policy = Bucket::Thumbnail.default_policy();
        let now = Utc::now();

        let low = clamp_valid_till(now, Some(Duration::ZERO), &policy);
        assert_eq!(low, add_duration(now, policy.min_fresh));

        let high = clamp_valid_till(now, Some(Duration::from_secs(365 * 86_400)), &policy);
        assert_eq!(high, add_duration(now, policy.max_fresh));

        let inside = policy.min_fresh + Duration::from_secs(60);
        assert_eq!(
            clamp_valid_till(now, Some(inside), &policy),
            add_duration(now, inside)
        );

        let none = clamp_valid_till(now, None, &policy);
        assert_eq!(none, add_duration(now, policy.max_fresh));
    }

    #[test]
    fn test_inverted_window_does_not_panic() {
        let mut policy = Bucket::Banner.default_policy();
        policy.min_fresh = Duration::from_secs(7200);
        policy.max_fresh = Duration::from_secs(60);
        let now = Utc::now();

        for server in [None, Some(Duration::ZERO), Some(Duration::from_secs(3600))] {
            assert_eq!(
                clamp_valid_till(now, server, &policy),
                add_duration(now, policy.max_fresh)
            );
        }
    }

    #[tokio::test]
    async fn test_stale_response_has_empty_body() {
        let stale = FetchResponse::Stale(StaleResponse {
            valid_till: Utc::now(),
            etag: Some("\"abc\"".into()),
            file_extension: ".png".into(),
        });
        assert!(stale.is_stale());
        assert!(stale.is_not_modified());
        assert_eq!(stale.etag(), Some("\"abc\""));
        assert!(stale.bytes().await.unwrap().is_empty());
    }
}
