use thiserror::Error;

pub type Result<T> = std::result::Result<T, SerperError>;

/// Errors returned by the Serper client.
#[derive(Debug, Error)]
pub enum SerperError {
    /// The request hit the per-request wall clock before a response arrived.
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// Transport-level failure (DNS, connect, TLS, connection reset mid-body).
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The API answered with a non-success HTTP status.
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The response body was not the JSON shape we expect.
    #[error("invalid response body: {message}")]
    InvalidBody { status: u16, message: String },
}

impl SerperError {
    /// Whether a retry has any chance of succeeding.
    ///
    /// Timeouts, transport failures, 429 and 5xx are transient. Other 4xx
    /// responses and malformed bodies are permanent.
    pub fn is_retryable(&self) -> bool {
        match self {
            SerperError::Timeout { .. } | SerperError::Transport(_) => true,
            SerperError::Api { status, .. } => *status == 429 || *status >= 500,
            SerperError::InvalidBody { .. } => false,
        }
    }

    /// The HTTP status associated with this error, when one was received.
    pub fn api_status(&self) -> Option<u16> {
        match self {
            SerperError::Api { status, .. } | SerperError::InvalidBody { status, .. } => {
                Some(*status)
            }
            SerperError::Timeout { .. } | SerperError::Transport(_) => None,
        }
    }
}
