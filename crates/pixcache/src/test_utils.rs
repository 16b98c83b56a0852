//! Scripted collaborators shared by unit tests.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use url::Url;

use crate::error::FetchError;
use crate::events::{MetricEvent, MetricKind, MetricsSink};
use crate::fetcher::{ConnectivityProbe, HttpTransport, TransportResponse};

pub(crate) const PNG_BYTES: &[u8] = b"\x89PNG\r\n\x1a\n\x00\x00\x00\rIHDR";

#[inline]
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Sink that keeps every event for later inspection
#[derive(Default)]
pub(crate) struct CollectingSink {
    events: Mutex<Vec<MetricEvent>>,
}

impl CollectingSink {
    pub(crate) fn events(&self) -> Vec<MetricEvent> {
        self.events.lock().clone()
    }

    pub(crate) fn kinds(&self) -> Vec<MetricKind> {
        self.events.lock().iter().map(|e| e.kind).collect()
    }

    pub(crate) fn count(&self, kind: MetricKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind == kind).count()
    }
}

impl MetricsSink for CollectingSink {
    fn record(&self, event: &MetricEvent) {
        self.events.lock().push(event.clone());
    }
}

/// One scripted transport reaction
#[derive(Debug, Clone)]
pub(crate) enum Scripted {
    Respond {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<&'static [u8]>,
    },
    TransportError(&'static str),
    Hang,
}

impl Scripted {
    pub(crate) fn png() -> Self {
        Scripted::Respond {
            status: 200,
            headers: vec![("content-type", "image/png"), ("etag", "\"v1\"")],
            chunks: vec![&PNG_BYTES[..8], &PNG_BYTES[8..]],
        }
    }

    pub(crate) fn status(status: u16) -> Self {
        Scripted::Respond {
            status,
            headers: vec![("content-type", "text/plain")],
            chunks: vec![&b"error"[..]],
        }
    }

    pub(crate) fn with_body(
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<&'static [u8]>,
    ) -> Self {
        Scripted::Respond {
            status,
            headers,
            chunks,
        }
    }
}

/// Transport replaying a fixed script and recording every request
#[derive(Default)]
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<Scripted>>,
    requests: Mutex<Vec<(Url, HeaderMap)>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub(crate) fn new(script: impl IntoIterator<Item = Scripted>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn repeat(step: Scripted, times: usize) -> Arc<Self> {
        Self::new(std::iter::repeat_n(step, times))
    }

    pub(crate) fn push(&self, step: Scripted) {
        self.script.lock().push_back(step);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn last_headers(&self) -> Option<HeaderMap> {
        self.requests.lock().last().map(|(_, h)| h.clone())
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<TransportResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().push((url.clone(), headers.clone()));

        let step = self.script.lock().pop_front();
        match step {
            None => Err(FetchError::Transport("script exhausted".into())),
            Some(Scripted::TransportError(message)) => Err(FetchError::Transport(message.into())),
            Some(Scripted::Hang) => std::future::pending().await,
            Some(Scripted::Respond {
                status,
                headers,
                chunks,
            }) => {
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.insert(
                        HeaderName::from_static(name),
                        HeaderValue::from_static(value),
                    );
                }
                let body = stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| Ok::<_, FetchError>(Bytes::from_static(c))),
                );
                Ok(TransportResponse {
                    status,
                    headers: map,
                    body: Box::pin(body),
                })
            }
        }
    }
}

/// Transport that answers with a PNG after a delay, tracking peak concurrency
#[derive(Default)]
pub(crate) struct SlowTransport {
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl SlowTransport {
    pub(crate) fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpTransport for SlowTransport {
    async fn get(&self, _url: &Url, _headers: &HeaderMap) -> Result<TransportResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("image/png"));
        Ok(TransportResponse {
            status: 200,
            headers,
            body: Box::pin(stream::iter(vec![Ok(Bytes::from_static(PNG_BYTES))])),
        })
    }
}

/// Probe with a fixed answer
#[derive(Default)]
pub(crate) struct StaticProbe {
    fail: bool,
    calls: AtomicUsize,
}

impl StaticProbe {
    pub(crate) fn online() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn offline() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            calls: AtomicUsize::new(0),
        })
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectivityProbe for StaticProbe {
    async fn check(&self, url: &Url) -> Result<(), FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(FetchError::Connectivity {
                host: url.host_str().unwrap_or_default().to_string(),
                reason: "radio off".into(),
            });
        }
        Ok(())
    }
}
