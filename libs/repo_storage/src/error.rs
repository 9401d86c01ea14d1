use std::error::Error as StdError;

/// Reasons a read from a repository failed.
#[derive(Debug)]
pub enum DownloadError {
    /// The caller provided a path the backend cannot address.
    BadInput(anyhow::Error),
    /// The object does not exist. Callers that passed `ignore_missing`
    /// never see this.
    NotFound,
    /// The operation ran past its configured timeout.
    Timeout,
    /// The operation was cancelled; retrying is pointless.
    Cancelled,
    /// Everything else. May be retryable.
    Other(anyhow::Error),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::BadInput(e) => write!(f, "Failed to read object, invalid input: {e:#}"),
            DownloadError::NotFound => write!(f, "No object found"),
            DownloadError::Timeout => write!(f, "Timed out"),
            DownloadError::Cancelled => write!(f, "Cancelled, shutting down"),
            DownloadError::Other(e) => write!(f, "Failed to read object: {e:?}"),
        }
    }
}

impl StdError for DownloadError {}

impl DownloadError {
    /// An error that will never go away on its own.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            DownloadError::BadInput(_) | DownloadError::NotFound | DownloadError::Cancelled
        )
    }
}

#[derive(Debug)]
pub struct Cancelled;

impl std::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation was cancelled")
    }
}

impl StdError for Cancelled {}

impl From<Cancelled> for DownloadError {
    fn from(_: Cancelled) -> Self {
        DownloadError::Cancelled
    }
}

/// Classify a write-path error for retry purposes. Walks the cause chain
/// looking for the markers the backends attach.
pub fn is_permanent_write_error(e: &anyhow::Error) -> bool {
    for cause in e.chain() {
        if cause.downcast_ref::<Cancelled>().is_some() {
            return true;
        }
        if let Some(marker) = cause.downcast_ref::<WriteErrorKind>() {
            return matches!(marker, WriteErrorKind::Auth | WriteErrorKind::BadInput);
        }
    }
    false
}

/// Markers the backends attach to write errors so callers can classify them
/// without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Authentication or authorization failure; never retried.
    Auth,
    /// The request itself is invalid; never retried.
    BadInput,
    /// Connection trouble, 5xx, or rate limiting; retryable.
    Transient,
}

impl std::fmt::Display for WriteErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteErrorKind::Auth => write!(f, "authentication error"),
            WriteErrorKind::BadInput => write!(f, "invalid request"),
            WriteErrorKind::Transient => write!(f, "transient error"),
        }
    }
}

impl StdError for WriteErrorKind {}
