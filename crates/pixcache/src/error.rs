use std::time::Duration;

/// Message fragments that mark an otherwise opaque transport failure as transient.
const RETRYABLE_MESSAGE_HINTS: &[&str] = &[
    "timed out",
    "timeout",
    "connection reset",
    "connection closed",
    "handshake",
];

// Error type for fetch operations
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("No connectivity to {host}: {reason}")]
    Connectivity { host: String, reason: String },

    #[error("Circuit open for host {0}")]
    CircuitOpen(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Server returned retryable status code {0}")]
    RetryableStatus(u16),

    #[error("Captive portal detected: {0}")]
    CaptivePortal(String),

    #[error("Gave up on {url} after {attempts} attempts: {last}")]
    RetryExhausted {
        url: String,
        attempts: u32,
        last: Box<FetchError>,
    },

    #[error("Stream stalled: no bytes received within {0:?}")]
    StreamStall(Duration),

    #[error("Server returned status code {0}")]
    Status(u16),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    /// Whether a failed attempt may be retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            FetchError::Transport(_) | FetchError::Timeout(_) | FetchError::RetryableStatus(_) => {
                true
            }
            FetchError::Http(e) => {
                // Builder and redirect-policy failures will not heal on a retry.
                if e.is_builder() || e.is_redirect() {
                    return false;
                }
                if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
                    return true;
                }
                message_looks_transient(&e.to_string())
            }
            FetchError::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::ConnectionRefused
                        | ErrorKind::BrokenPipe
                        | ErrorKind::TimedOut
                        | ErrorKind::UnexpectedEof
                        | ErrorKind::NotConnected
                ) || message_looks_transient(&e.to_string())
            }
            _ => false,
        }
    }

    /// Short machine-friendly label used in metric events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::InvalidUrl { .. } => "invalid_url",
            FetchError::Connectivity { .. } => "connectivity",
            FetchError::CircuitOpen(_) => "circuit_open",
            FetchError::Transport(_) => "transport",
            FetchError::Timeout(_) => "timeout",
            FetchError::RetryableStatus(_) => "retryable_status",
            FetchError::CaptivePortal(_) => "captive_portal",
            FetchError::RetryExhausted { .. } => "retry_exhausted",
            FetchError::StreamStall(_) => "stream_stall",
            FetchError::Status(_) => "status",
            FetchError::Http(_) => "http",
            FetchError::Io(_) => "io",
        }
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            FetchError::RetryableStatus(code) | FetchError::Status(code) => Some(*code),
            FetchError::Http(e) => e.status().map(|s| s.as_u16()),
            FetchError::RetryExhausted { last, .. } => last.status_code(),
            _ => None,
        }
    }
}

fn message_looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    RETRYABLE_MESSAGE_HINTS
        .iter()
        .any(|hint| lower.contains(hint))
}

/// Errors raised while building or validating configuration.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid policy for bucket {bucket}: {reason}")]
    InvalidPolicy { bucket: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Errors surfaced by the cache registry.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}
