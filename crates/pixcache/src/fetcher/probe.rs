use std::time::Duration;

use async_trait::async_trait;
use tokio::net::lookup_host;
use tracing::debug;
use url::Url;

use crate::error::FetchError;

/// Cheap check run before a retry to tell a dead link from a slow server.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn check(&self, url: &Url) -> Result<(), FetchError>;
}

/// Probe that resolves the target host through the system resolver.
#[derive(Debug, Clone, Copy)]
pub struct DnsProbe {
    timeout: Duration,
}

impl Default for DnsProbe {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

impl DnsProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ConnectivityProbe for DnsProbe {
    async fn check(&self, url: &Url) -> Result<(), FetchError> {
        let host = url.host_str().ok_or_else(|| FetchError::InvalidUrl {
            url: url.to_string(),
            reason: "missing host".into(),
        })?;
        let port = url.port_or_known_default().unwrap_or(443);

        let failure = |reason: String| FetchError::Connectivity {
            host: host.to_string(),
            reason,
        };

        match tokio::time::timeout(self.timeout, lookup_host((host, port))).await {
            Err(_) => Err(failure(format!("DNS lookup timed out after {:?}", self.timeout))),
            Ok(Err(e)) => Err(failure(format!("DNS lookup failed: {e}"))),
            Ok(Ok(mut addrs)) => {
                if addrs.next().is_some() {
                    debug!(host, "Connectivity probe resolved host");
                    Ok(())
                } else {
                    Err(failure("DNS lookup returned no addresses".into()))
                }
            }
        }
    }
}
