//! Client error types.

/// Errors surfaced by [`crate::LinkedInClient`].
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Missing li_at or JSESSIONID cookie")]
    MissingAuthCookies,

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    /// Non-2xx response decoded from the API error body (or synthesized from
    /// the HTTP status when the body is not an error record).
    #[error("LinkedIn API returned status {status}")]
    Status { status: u16 },

    /// 429 when opening the realtime stream. Fatal for the attempt; the
    /// caller backs off before reconnecting.
    #[error("LinkedIn rate limited the realtime connection")]
    TooManyRequests,

    #[error("Failed to decode {context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Media upload failed: {0}")]
    Upload(String),

    #[error("Invalid conversation URN {0}")]
    InvalidUrn(String),
}

impl ClientError {
    /// Whether this error indicates the session cookies are no longer valid.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::MissingAuthCookies => true,
            Self::Status { status } => *status == 401 || *status == 403,
            // LinkedIn answers dead sessions with a redirect loop to /login.
            Self::Http(e) => e.is_redirect(),
            _ => false,
        }
    }

    /// Whether retrying after a delay is reasonable.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::Status { status } => *status >= 500,
            Self::TooManyRequests => true,
            _ => false,
        }
    }
}

pub type ClientResult<T> = Result<T, ClientError>;
