use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("sign-in required: {0}")]
    AuthRequired(String),

    #[error("file not found: {0}")]
    NotFound(String),

    #[error("unsupported file: {0}")]
    Unsupported(String),

    #[error("rate limited by the service: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    TransientNetwork(String),

    #[error("request rejected: {0}")]
    PermanentReject(String),

    #[error("cannot assemble frame {frame}: {reason}")]
    AssemblyError { frame: usize, reason: String },

    #[error(
        "frame sequence incomplete: {} frame(s) missing (first missing index {})",
        .missing.len(),
        .missing.first().copied().unwrap_or_default()
    )]
    IncompleteSequence { missing: Vec<usize> },

    #[error("cookie file error: {0}")]
    Cookie(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("output file already exists: {}", .0.display())]
    OutputExists(PathBuf),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("requested range starts past the end of the file")]
    RangeNotSatisfiable,

    #[error("download cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(reqwest::Error),
}

pub type Result<T> = std::result::Result<T, DriveError>;

impl DriveError {
    /// Only throttling and flaky transport are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DriveError::RateLimited(_) | DriveError::TransientNetwork(_))
    }

    /// Maps a non-success status to the error taxonomy, `None` for 2xx/3xx.
    pub fn from_status(status: StatusCode, context: &str) -> Option<Self> {
        if status.is_success() || status.is_redirection() {
            return None;
        }

        let message = format!("{} ({})", context, status);
        let err = match status {
            StatusCode::UNAUTHORIZED => DriveError::AuthRequired(message),
            StatusCode::NOT_FOUND | StatusCode::GONE => DriveError::NotFound(message),
            StatusCode::TOO_MANY_REQUESTS => DriveError::RateLimited(message),
            StatusCode::REQUEST_TIMEOUT => DriveError::TransientNetwork(message),
            s if s.is_server_error() => DriveError::TransientNetwork(message),
            _ => DriveError::PermanentReject(message),
        };

        Some(err)
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            if let Some(classified) = Self::from_status(status, &err.to_string()) {
                return classified;
            }
        }

        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return DriveError::TransientNetwork(err.to_string());
        }

        DriveError::Http(err)
    }

    /// What the user should do about a failed run, if anything.
    pub fn resume_hint(&self) -> Option<&'static str> {
        match self {
            DriveError::AuthRequired(_) => {
                Some("export fresh cookies from a signed-in browser and pass them with --cookies")
            }
            DriveError::Cancelled
            | DriveError::RateLimited(_)
            | DriveError::TransientNetwork(_)
            | DriveError::Encoder(_) => {
                Some("completed frames were kept, run the same command again to resume")
            }
            DriveError::AssemblyError { .. } | DriveError::IncompleteSequence { .. } => Some(
                "the frame directory is partial or corrupted, run again to resume or delete it to restart",
            ),
            _ => None,
        }
    }
}
