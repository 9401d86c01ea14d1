//! The closed error taxonomy.
//!
//! Every failure the engine can surface has a stable kind name and numeric
//! code; scripts and the worker protocol depend on both. New failure modes
//! get a new variant here, never an ad-hoc string.

use repo_storage::DownloadError;
use utils::lock::LockError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // Connectivity
    #[error("unable to connect to PostgreSQL: {0}")]
    DbConnect(String),
    #[error("unable to connect to host: {0}")]
    HostConnect(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("unable to read file: {0}")]
    FileRead(String),
    #[error("unable to write file: {0}")]
    FileWrite(String),
    #[error("unable to open file: {0}")]
    FileOpen(String),
    #[error("kernel error: {0}")]
    Kernel(String),

    // Semantic
    #[error("archive mismatch: {0}")]
    ArchiveMismatch(String),
    #[error("archive duplicate: {0}")]
    ArchiveDuplicate(String),
    #[error("archive timeout: {0}")]
    ArchiveTimeout(String),
    #[error("database mismatch: {0}")]
    DbMismatch(String),
    #[error("repository invalid: {0}")]
    RepoInvalid(String),
    #[error("format error: {0}")]
    Format(String),
    #[error("file missing: {0}")]
    FileMissing(String),
    #[error("file mode error: {0}")]
    FileMode(String),

    // Operational
    #[error("unable to acquire lock: {0}")]
    LockAcquire(String),
    #[error("unable to execute: {0}")]
    Execute(String),
    #[error("command error: {0}")]
    Command(String),
    #[error("assertion failed: {0}")]
    Assert(String),
    #[error("host invalid: {0}")]
    HostInvalid(String),
    #[error("option '{0}' is required")]
    OptionRequired(String),
    #[error("parameter required: {0}")]
    ParamRequired(String),
    #[error("parameter invalid: {0}")]
    ParamInvalid(String),
    #[error("path missing: {0}")]
    PathMissing(String),
    #[error("unable to open path: {0}")]
    PathOpen(String),
    #[error("unable to remove file: {0}")]
    FileRemove(String),
}

impl Error {
    /// Stable kind name, as rendered in diagnostics and status files.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Error::DbConnect(_) => "DbConnectError",
            Error::HostConnect(_) => "HostConnectError",
            Error::Protocol(_) => "ProtocolError",
            Error::FileRead(_) => "FileReadError",
            Error::FileWrite(_) => "FileWriteError",
            Error::FileOpen(_) => "FileOpenError",
            Error::Kernel(_) => "KernelError",
            Error::ArchiveMismatch(_) => "ArchiveMismatchError",
            Error::ArchiveDuplicate(_) => "ArchiveDuplicateError",
            Error::ArchiveTimeout(_) => "ArchiveTimeoutError",
            Error::DbMismatch(_) => "DbMismatchError",
            Error::RepoInvalid(_) => "RepoInvalidError",
            Error::Format(_) => "FormatError",
            Error::FileMissing(_) => "FileMissingError",
            Error::FileMode(_) => "FileModeError",
            Error::LockAcquire(_) => "LockAcquireError",
            Error::Execute(_) => "ExecuteError",
            Error::Command(_) => "CommandError",
            Error::Assert(_) => "AssertError",
            Error::HostInvalid(_) => "HostInvalidError",
            Error::OptionRequired(_) => "OptionRequiredError",
            Error::ParamRequired(_) => "ParamRequiredError",
            Error::ParamInvalid(_) => "ParamInvalidError",
            Error::PathMissing(_) => "PathMissingError",
            Error::PathOpen(_) => "PathOpenError",
            Error::FileRemove(_) => "FileRemoveError",
        }
    }

    /// Stable numeric code, also used as the process exit code.
    pub fn code(&self) -> i32 {
        match self {
            Error::Assert(_) => 24,
            Error::Format(_) => 42,
            Error::Command(_) => 43,
            Error::OptionRequired(_) => 44,
            Error::ParamRequired(_) => 45,
            Error::ParamInvalid(_) => 46,
            Error::FileOpen(_) => 53,
            Error::FileRead(_) => 54,
            Error::FileMissing(_) => 55,
            Error::DbConnect(_) => 56,
            Error::DbMismatch(_) => 57,
            Error::LockAcquire(_) => 58,
            Error::PathMissing(_) => 59,
            Error::FileWrite(_) => 60,
            Error::PathOpen(_) => 61,
            Error::FileRemove(_) => 62,
            Error::Kernel(_) => 63,
            Error::ArchiveTimeout(_) => 65,
            Error::FileMode(_) => 66,
            Error::ArchiveMismatch(_) => 69,
            Error::ArchiveDuplicate(_) => 70,
            Error::HostInvalid(_) => 72,
            Error::Execute(_) => 73,
            Error::HostConnect(_) => 75,
            Error::Protocol(_) => 102,
            Error::RepoInvalid(_) => 103,
        }
    }

    /// Whether a retry inside the same job may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::HostConnect(_)
                | Error::Protocol(_)
                | Error::FileRead(_)
                | Error::FileWrite(_)
                | Error::FileOpen(_)
                | Error::FileMissing(_)
                | Error::Kernel(_)
        )
    }
}

impl From<LockError> for Error {
    fn from(e: LockError) -> Self {
        Error::LockAcquire(e.to_string())
    }
}

impl From<DownloadError> for Error {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::NotFound => Error::FileMissing("repository object not found".into()),
            DownloadError::Timeout => Error::HostConnect("repository read timed out".into()),
            DownloadError::Cancelled => Error::Command("operation cancelled".into()),
            DownloadError::BadInput(e) => Error::ParamInvalid(format!("{e:#}")),
            DownloadError::Other(e) => Error::FileRead(format!("{e:#}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Exit code for a clean run.
pub const EXIT_OK: i32 = 0;
/// archive-get only: the requested segment is not in the archive.
pub const EXIT_NOT_FOUND: i32 = 1;
/// Async push found no ready files to process.
pub const EXIT_NO_WAL: i32 = 25;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_codes_are_stable() {
        assert_eq!(Error::Protocol("x".into()).kind_name(), "ProtocolError");
        assert_eq!(Error::Protocol("x".into()).code(), 102);
        assert_eq!(Error::RepoInvalid("x".into()).code(), 103);
        assert_eq!(Error::Format("x".into()).code(), 42);
        assert_eq!(Error::FileMissing("x".into()).code(), 55);
    }

    #[test]
    fn retry_classification() {
        assert!(Error::HostConnect("x".into()).is_retryable());
        assert!(Error::FileRead("x".into()).is_retryable());
        assert!(!Error::ArchiveDuplicate("x".into()).is_retryable());
        assert!(!Error::DbMismatch("x".into()).is_retryable());
        assert!(!Error::LockAcquire("x".into()).is_retryable());
    }
}
