use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("invalid argument")]
    InvalidArgument,
    // transaction errors
    #[error("the thread is already running a transaction")]
    XctAlreadyRunning,
    #[error("the thread is not running a transaction")]
    XctNoXct,
    #[error("transaction aborted due to a race; retry from begin")]
    XctRaceAbort,
    // module lifecycle errors
    #[error("a dependent module is not initialized yet")]
    DependentModuleUnavailableInit,
    #[error("a dependent module is already uninitialized")]
    DependentModuleUnavailableUninit,
    // waits
    #[error("operation timed out")]
    TimedOut,
    // page errors
    #[error("page has been moved; caller must retry")]
    PageMoved,
    #[error("insufficient memory({0})")]
    InsufficientMemory(usize),
    // storage errors
    #[error("invalid storage id")]
    InvalidStorageId,
    #[error("storage name already exists")]
    StorageNameExists,
    #[error("offset out of range")]
    OffsetOutOfRange,
    #[error("too many workers")]
    TooManyWorkers,
    // logging errors
    #[error("thread log buffer is full")]
    LogBufferFull,
    // snapshot errors
    #[error("snapshot run failed with {0} error(s)")]
    SnapshotFailed(usize),
    #[error("IO error: {0:?}")]
    IOError(io::ErrorKind),
    #[error("serde error: {0}")]
    SerdeError(String),
    #[error("{0} not supported")]
    NotSupported(&'static str),
}

impl From<io::Error> for Error {
    #[inline]
    fn from(src: io::Error) -> Self {
        Error::IOError(src.kind())
    }
}

impl From<serde_json::Error> for Error {
    #[inline]
    fn from(src: serde_json::Error) -> Self {
        Error::SerdeError(src.to_string())
    }
}

impl Error {
    /// Whether the caller is expected to retry the whole transaction.
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::XctRaceAbort | Error::PageMoved)
    }
}
