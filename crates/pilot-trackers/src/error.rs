use thiserror::Error;

/// Errors surfaced by tracker adapters.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// Non-2xx response from the tracker API.
    #[error("tracker API error ({status}): {message}")]
    Http {
        status: u16,
        message: String,
        retryable: bool,
    },

    /// Connection-level failure (DNS, TLS, timeout). Always retryable.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A tag/label the core needs does not exist on the tracker.
    #[error("tag not found: {0}")]
    MissingTag(String),

    /// The tracker has no equivalent for this operation.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The tracker answered 2xx but the payload did not have the expected shape.
    #[error("response decode error: {0}")]
    Decode(String),
}

impl TrackerError {
    /// Whether the next poll tick is likely to succeed without operator
    /// intervention.
    pub fn retryable(&self) -> bool {
        match self {
            TrackerError::Http { retryable, .. } => *retryable,
            TrackerError::Transport(_) => true,
            TrackerError::MissingTag(_) | TrackerError::Unsupported(_) => false,
            TrackerError::Decode(_) => false,
        }
    }

    /// Build an `Http` error from a status code and response body, keeping
    /// only a short preview of the body.
    pub fn from_status(status: u16, body: &str) -> Self {
        TrackerError::Http {
            status,
            message: body_preview(body),
            retryable: status >= 500 || status == 429,
        }
    }
}

/// Truncate a response body for log/error messages.
pub(crate) fn body_preview(body: &str) -> String {
    if body.chars().count() > 320 {
        let truncated: String = body.chars().take(320).collect();
        format!("{truncated}...")
    } else {
        body.to_string()
    }
}

pub type Result<T> = std::result::Result<T, TrackerError>;

/// Consume a response: pass through on 2xx, otherwise read the body into a
/// `TrackerError::Http`.
pub(crate) async fn ok_or_error(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(TrackerError::from_status(status.as_u16(), &body))
}
