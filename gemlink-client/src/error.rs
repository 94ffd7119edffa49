use thiserror::Error;

pub type Result<T> = std::result::Result<T, GeminiError>;

#[derive(Debug, Error)]
pub enum GeminiError {
    /// Invalid or missing configuration; raised before any network call.
    #[error("configuration error: {0}")]
    Config(String),

    /// Credential rejected by the provider (401/403).
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Malformed request or unknown model (4xx other than 429).
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Provider throttled the request (429).
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// Timeout, connection reset, or transient 5xx.
    #[error("transient transport error: {0}")]
    Transient(String),

    /// Provider returned a success status with a body we cannot parse.
    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("stream parse error: {0}")]
    StreamParse(String),

    /// Caller cancelled the in-flight call.
    #[error("call cancelled")]
    Cancelled,

    /// All retry attempts consumed; carries the last underlying error.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<GeminiError>,
    },
}

impl GeminiError {
    /// Retryable errors are expected to resolve on a repeat attempt.
    /// Everything else is terminal and aborts the retry loop.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimit(_) | Self::Transient(_))
    }
}

impl From<reqwest::Error> for GeminiError {
    fn from(e: reqwest::Error) -> Self {
        // Timeouts, connect failures, and mid-body resets all land here;
        // HTTP status classification happens where the status is known.
        Self::Transient(e.to_string())
    }
}

impl From<serde_json::Error> for GeminiError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
