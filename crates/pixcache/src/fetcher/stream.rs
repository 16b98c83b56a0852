use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::{Instant, Sleep};
use tracing::warn;

use crate::error::FetchError;
use crate::events::{MetricEvent, MetricKind, MetricsHub};
use crate::fetcher::transport::BodyStream;

/// Leading bytes of HTML, JSON objects and JSON arrays.
const PORTAL_SIGNATURES: &[u8] = b"<{[";

enum Sniff {
    Disabled,
    /// Holding leading whitespace until the first significant byte shows up
    Pending(BytesMut),
    Passed,
}

/// Response body wrapper that enforces a stall watchdog and rejects bodies
/// that turn out to be HTML/JSON pages served with a 200.
///
/// Nothing is yielded before the first non-whitespace byte has been
/// inspected, so a portal page never reaches the consumer. A fetch pool
/// permit attached with [`with_permit`](Self::with_permit) is held until
/// the body ends, fails or is dropped.
pub struct GuardedStream {
    inner: BodyStream,
    stall_timeout: Duration,
    watchdog: Pin<Box<Sleep>>,
    sniff: Sniff,
    finished: bool,
    url: String,
    host: Option<String>,
    status: u16,
    metrics: Option<Arc<MetricsHub>>,
    permit: Option<OwnedSemaphorePermit>,
}

impl GuardedStream {
    pub fn new(inner: BodyStream, stall_timeout: Duration, sniff_content: bool) -> Self {
        Self {
            inner,
            stall_timeout,
            watchdog: Box::pin(tokio::time::sleep(stall_timeout)),
            sniff: if sniff_content {
                Sniff::Pending(BytesMut::new())
            } else {
                Sniff::Disabled
            },
            finished: false,
            url: String::new(),
            host: None,
            status: 200,
            metrics: None,
            permit: None,
        }
    }

    /// Report body failures of the `status` response from `host` for `url`
    /// to `metrics`.
    pub fn with_metrics(
        mut self,
        url: impl Into<String>,
        host: impl Into<String>,
        status: u16,
        metrics: Arc<MetricsHub>,
    ) -> Self {
        self.url = url.into();
        self.host = Some(host.into());
        self.status = status;
        self.metrics = Some(metrics);
        self
    }

    /// Hold `permit` for as long as the body is being transferred.
    pub fn with_permit(mut self, permit: OwnedSemaphorePermit) -> Self {
        self.permit = Some(permit);
        self
    }

    pub fn holds_permit(&self) -> bool {
        self.permit.is_some()
    }

    fn event(&self, kind: MetricKind) -> MetricEvent {
        let event = MetricEvent::new(kind, self.url.clone()).with_status(self.status);
        match &self.host {
            Some(host) => event.with_host(host),
            None => event,
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.permit = None;
    }

    fn fail(&mut self, error: FetchError) -> Poll<Option<Result<Bytes, FetchError>>> {
        self.finish();
        warn!(url = %self.url, error = %error, "Response body failed");
        if let Some(metrics) = &self.metrics {
            metrics.emit(self.event(MetricKind::FetchFailed).with_error(&error));
        }
        Poll::Ready(Some(Err(error)))
    }

    fn portal_detected(&mut self, signature: u8) -> Poll<Option<Result<Bytes, FetchError>>> {
        warn!(url = %self.url, signature = %(signature as char), "Body looks like a captive portal page");
        if let Some(metrics) = &self.metrics {
            metrics.emit(
                self.event(MetricKind::CaptivePortalDetected)
                    .with_error(format!("body starts with '{}'", signature as char)),
            );
        }
        self.fail(FetchError::CaptivePortal(format!(
            "response body starts with '{}'",
            signature as char
        )))
    }
}

fn first_significant_byte(buf: &[u8]) -> Option<u8> {
    buf.iter().copied().find(|b| !b.is_ascii_whitespace())
}

impl Stream for GuardedStream {
    type Item = Result<Bytes, FetchError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        loop {
            match this.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(chunk))) => {
                    let deadline = Instant::now() + this.stall_timeout;
                    this.watchdog.as_mut().reset(deadline);

                    if chunk.is_empty() {
                        continue;
                    }

                    let Sniff::Pending(buf) = &mut this.sniff else {
                        return Poll::Ready(Some(Ok(chunk)));
                    };

                    buf.extend_from_slice(&chunk);
                    match first_significant_byte(buf) {
                        None => continue,
                        Some(b) if PORTAL_SIGNATURES.contains(&b) => {
                            return this.portal_detected(b);
                        }
                        Some(_) => {
                            let held = buf.split().freeze();
                            this.sniff = Sniff::Passed;
                            return Poll::Ready(Some(Ok(held)));
                        }
                    }
                }
                Poll::Ready(Some(Err(e))) => return this.fail(e),
                Poll::Ready(None) => {
                    this.finish();
                    // A whitespace-only body is released as-is.
                    if let Sniff::Pending(buf) = &mut this.sniff {
                        if !buf.is_empty() {
                            let held = buf.split().freeze();
                            return Poll::Ready(Some(Ok(held)));
                        }
                    }
                    return Poll::Ready(None);
                }
                Poll::Pending => {
                    let stalled = this.watchdog.as_mut().poll(cx).is_ready();
                    if stalled {
                        let timeout = this.stall_timeout;
                        return this.fail(FetchError::StreamStall(timeout));
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::CollectingSink;
    use futures::StreamExt;
    use futures::stream;
    use tokio::sync::Semaphore;

    fn observed(inner: BodyStream, stall: Duration) -> (GuardedStream, Arc<CollectingSink>) {
        let sink = Arc::new(CollectingSink::default());
        let hub = Arc::new(MetricsHub::default());
        hub.set_sink(Some(sink.clone()));
        let stream = GuardedStream::new(inner, stall, true).with_metrics(
            "https://img.example.com/a.png",
            "img.example.com",
            200,
            hub,
        );
        (stream, sink)
    }

    fn body(chunks: Vec<&'static [u8]>) -> BodyStream {
        Box::pin(stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, FetchError>(Bytes::from_static(c))),
        ))
    }

    async fn collect(mut stream: GuardedStream) -> Result<Vec<u8>, FetchError> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_binary_body_passes_through() {
        let stream = GuardedStream::new(
            body(vec![&b"\x89PNG"[..], &b"\r\n\x1a\n"[..], &b"rest"[..]]),
            Duration::from_secs(5),
            true,
        );
        assert_eq!(collect(stream).await.unwrap(), b"\x89PNG\r\n\x1a\nrest");
    }

    #[tokio::test]
    async fn test_html_after_whitespace_is_rejected() {
        let mut stream = GuardedStream::new(
            body(vec![&b"  \n"[..], &b"\t <html><body>login</body></html>"[..]]),
            Duration::from_secs(5),
            true,
        );
        let first = stream.next().await.unwrap();
        assert!(matches!(first, Err(FetchError::CaptivePortal(_))));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_json_signatures_rejected() {
        for payload in [&b"{\"error\":1}"[..], &b"[1,2]"[..]] {
            let stream = GuardedStream::new(body(vec![payload]), Duration::from_secs(5), true);
            assert!(matches!(
                collect(stream).await,
                Err(FetchError::CaptivePortal(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_sniffing_can_be_disabled() {
        let stream = GuardedStream::new(body(vec![&b"<svg/>"[..]]), Duration::from_secs(5), false);
        assert_eq!(collect(stream).await.unwrap(), b"<svg/>");
    }

    #[tokio::test]
    async fn test_whitespace_only_body_released() {
        let stream = GuardedStream::new(body(vec![&b"  "[..], &b"\n"[..]]), Duration::from_secs(5), true);
        assert_eq!(collect(stream).await.unwrap(), b"  \n");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_stream_fails() {
        let head = stream::iter(vec![Ok::<_, FetchError>(Bytes::from_static(b"GIF89a"))]);
        let stalled: BodyStream = Box::pin(head.chain(stream::pending()));
        let mut stream = GuardedStream::new(stalled, Duration::from_secs(2), true);

        assert_eq!(stream.next().await.unwrap().unwrap(), Bytes::from_static(b"GIF89a"));
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FetchError::StreamStall(d) if d == Duration::from_secs(2)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_reported_as_failure() {
        let head = stream::iter(vec![Ok::<_, FetchError>(Bytes::from_static(b"GIF89a"))]);
        let (stream, sink) = observed(Box::pin(head.chain(stream::pending())), Duration::from_secs(2));

        assert!(matches!(collect(stream).await, Err(FetchError::StreamStall(_))));
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MetricKind::FetchFailed);
        assert_eq!(events[0].host.as_deref(), Some("img.example.com"));
        assert_eq!(events[0].status_code, Some(200));
        assert!(events[0].error.as_deref().unwrap().contains("stalled"));
    }

    #[tokio::test]
    async fn test_sniff_rejection_reported_as_failure() {
        let (stream, sink) = observed(body(vec![&b"<html>"[..]]), Duration::from_secs(5));

        assert!(matches!(collect(stream).await, Err(FetchError::CaptivePortal(_))));
        assert_eq!(
            sink.kinds(),
            vec![MetricKind::CaptivePortalDetected, MetricKind::FetchFailed]
        );
    }

    #[tokio::test]
    async fn test_inner_error_reported_as_failure() {
        let failing: BodyStream = Box::pin(stream::iter(vec![
            Ok(Bytes::from_static(b"\x89PNG")),
            Err(FetchError::Transport("connection reset".into())),
        ]));
        let (stream, sink) = observed(failing, Duration::from_secs(5));

        assert!(matches!(collect(stream).await, Err(FetchError::Transport(_))));
        assert_eq!(sink.count(MetricKind::FetchFailed), 1);
    }

    #[tokio::test]
    async fn test_clean_body_reports_nothing() {
        let (stream, sink) = observed(body(vec![&b"\x89PNG"[..]]), Duration::from_secs(5));
        collect(stream).await.unwrap();
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn test_permit_released_when_body_ends() {
        let pool = Arc::new(Semaphore::new(1));
        let permit = pool.clone().acquire_owned().await.unwrap();
        let mut stream = GuardedStream::new(body(vec![&b"\x89PNG"[..]]), Duration::from_secs(5), true)
            .with_permit(permit);
        assert!(stream.holds_permit());

        assert!(stream.next().await.unwrap().is_ok());
        assert_eq!(pool.available_permits(), 0);
        assert!(stream.next().await.is_none());
        assert!(!stream.holds_permit());
        assert_eq!(pool.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_permit_released_on_failure_and_drop() {
        let pool = Arc::new(Semaphore::new(2));
        let rejected = GuardedStream::new(body(vec![&b"{}"[..]]), Duration::from_secs(5), true)
            .with_permit(pool.clone().acquire_owned().await.unwrap());
        let abandoned = GuardedStream::new(body(vec![&b"\x89PNG"[..]]), Duration::from_secs(5), true)
            .with_permit(pool.clone().acquire_owned().await.unwrap());
        assert_eq!(pool.available_permits(), 0);

        assert!(collect(rejected).await.is_err());
        assert_eq!(pool.available_permits(), 1);
        drop(abandoned);
        assert_eq!(pool.available_permits(), 2);
    }
}
