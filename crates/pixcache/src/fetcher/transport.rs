use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::HeaderMap;
use rustls::{ClientConfig, crypto::ring};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::debug;
use url::Url;

use crate::config::RegistryConfig;
use crate::error::FetchError;

/// Response body as a stream of chunks
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, FetchError>> + Send>>;

/// Raw response handed back by a transport
pub struct TransportResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

impl TransportResponse {
    pub fn header_str(&self, name: impl reqwest::header::AsHeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header_str(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Extension reported for this response, e.g. `.jpg` or `.html`.
    pub fn file_extension(&self, url: &Url) -> String {
        file_extension_for(self.header_str(reqwest::header::CONTENT_TYPE), url)
    }
}

/// Issues HTTP GET requests. Timeouts are enforced by the caller.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<TransportResponse, FetchError>;
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &RegistryConfig) -> Result<Client, FetchError> {
    let provider = Arc::new(ring::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::Transport(format!("TLS protocol configuration failed: {e}")))?
        .with_platform_verifier()
        .map_err(|e| FetchError::Transport(format!("TLS verifier configuration failed: {e}")))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(5)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone())
        .use_preconfigured_tls(tls_config)
        .gzip(true)
        .redirect(if config.follow_redirects {
            reqwest::redirect::Policy::limited(10)
        } else {
            reqwest::redirect::Policy::none()
        });

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(FetchError::from)
}

/// Transport backed by a shared reqwest client
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new(config: &RegistryConfig) -> Result<Self, FetchError> {
        create_client(config).map(Self::with_client)
    }

    /// Transport over an already configured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(&self, url: &Url, headers: &HeaderMap) -> Result<TransportResponse, FetchError> {
        let response = self
            .client
            .get(url.clone())
            .headers(headers.clone())
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        debug!(url = %url, status, "Received response headers");

        let body = response.bytes_stream().map(|chunk| chunk.map_err(FetchError::from));

        Ok(TransportResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }
}

/// Map a content type (or, failing that, the URL path) to a file extension.
pub(crate) fn file_extension_for(content_type: Option<&str>, url: &Url) -> String {
    if let Some(ext) = content_type.and_then(extension_from_mime) {
        return ext.to_string();
    }
    extension_from_path(url).unwrap_or_default()
}

fn extension_from_mime(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    let ext = match mime.as_str() {
        "text/html" | "application/xhtml+xml" => ".html",
        "application/json" | "text/json" => ".json",
        "text/plain" => ".txt",
        "application/xml" | "text/xml" => ".xml",
        "image/jpeg" | "image/jpg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/webp" => ".webp",
        "image/avif" => ".avif",
        "image/heic" => ".heic",
        "image/bmp" => ".bmp",
        "image/svg+xml" => ".svg",
        "image/x-icon" | "image/vnd.microsoft.icon" => ".ico",
        _ => return None,
    };
    Some(ext)
}

fn extension_from_path(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    let (_, ext) = last.rsplit_once('.')?;
    if ext.is_empty() || ext.len() > 5 || !ext.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return None;
    }
    Some(format!(".{}", ext.to_ascii_lowercase()))
}
