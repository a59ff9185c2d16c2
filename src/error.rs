use std::io;
use std::path::{Path, PathBuf};

/// Failures of the credential lifecycle.
///
/// `NotFound` and `Invalid` are recoverable: the session falls back to a new
/// interactive authorization. Everything else is surfaced to the operator.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("no credentials found at {}", .0.display())]
    NotFound(PathBuf),

    #[error("credentials at {} are invalid: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    #[error("the credentials are not valid and have no refresh token")]
    Unrefreshable,

    #[error("failed to refresh the access token: {0}")]
    RefreshFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CredentialError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether a new interactive authorization may replace the failed load.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Invalid { .. })
    }
}

/// Failures of the Gmail REST calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gmail API returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Signatures of {0} not found")]
    SendAsNotFound(String),

    #[error("no default send-as alias is configured")]
    NoDefaultSendAs,
}

/// Failures of a whole send operation.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error(transparent)]
    Credential(#[from] CredentialError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("The subject has been already used: {0}")]
    SubjectUsed(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),
}
