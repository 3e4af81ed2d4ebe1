use serde_derive::{Deserialize, Serialize};

/// Result alias used across the crate.
pub type CResult<T> = std::result::Result<T, Error>;

/// Error kinds surfaced by the replicated store.
///
/// The first group maps replica role / lifecycle conditions, the second group
/// maps conditional CRUD failures from the local store, and the rest cover
/// copy coordination and internal failures. `StoreFatalError` means the local
/// engine broke an invariant and the replica must transient-fault.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// The replica is not (or no longer) primary.
    NotPrimary,
    /// The primary lost its write quorum.
    NoWriteQuorum,
    /// A role change is in flight; the caller should retry.
    ReconfigurationPending,
    /// The commit timed out. The operation may still complete later.
    Timeout,
    /// The replica is closed or closing.
    ObjectClosed,

    RecordAlreadyExists,
    RecordNotFound,
    WriteConflict,
    SequenceNumberCheckFailed,
    /// Internal enumeration sentinel.
    EnumerationCompleted,

    /// The wire replicator rejected an operation as too large.
    TransactionTooLarge,
    /// Too many builders are queued behind the active backup.
    MaxFileStreamFullCopyWaiters,
    /// A backup is already in progress.
    BackupInProgress,
    PathTooLong(String),
    /// An object was used outside its valid window (e.g. a released
    /// notification enumerator).
    InvalidState(String),
    InvalidOperation(String),

    /// The local engine failed in a way that may have broken invariants.
    StoreFatalError(String),
    Parse(String),
    Internal(String),
}

impl Error {
    /// True for apply errors that the secondary pump retries in a fresh
    /// transaction rather than faulting the stream.
    pub fn is_retryable_apply(&self) -> bool {
        matches!(self, Error::WriteConflict | Error::SequenceNumberCheckFailed)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::NotPrimary => write!(f, "replica is not primary"),
            Error::NoWriteQuorum => write!(f, "write quorum lost"),
            Error::ReconfigurationPending => write!(f, "reconfiguration pending"),
            Error::Timeout => write!(f, "operation timed out"),
            Error::ObjectClosed => write!(f, "object closed"),
            Error::RecordAlreadyExists => write!(f, "record already exists"),
            Error::RecordNotFound => write!(f, "record not found"),
            Error::WriteConflict => write!(f, "write conflict"),
            Error::SequenceNumberCheckFailed => write!(f, "sequence number check failed"),
            Error::EnumerationCompleted => write!(f, "enumeration completed"),
            Error::TransactionTooLarge => write!(f, "replicated transaction too large"),
            Error::MaxFileStreamFullCopyWaiters => write!(f, "too many file stream copy waiters"),
            Error::BackupInProgress => write!(f, "backup already in progress"),
            Error::PathTooLong(path) => write!(f, "path too long: {}", path),
            Error::InvalidState(msg) => write!(f, "invalid state: {}", msg),
            Error::InvalidOperation(msg) => write!(f, "invalid operation: {}", msg),
            Error::StoreFatalError(msg) => write!(f, "fatal store error: {}", msg),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Parse(err.to_string())
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error::Parse(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn retryable_apply_kinds() {
        assert!(Error::WriteConflict.is_retryable_apply());
        assert!(Error::SequenceNumberCheckFailed.is_retryable_apply());
        assert!(!Error::RecordNotFound.is_retryable_apply());
        assert!(!Error::StoreFatalError("boom".to_string()).is_retryable_apply());
    }

    #[test]
    fn io_error_maps_to_internal() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert!(matches!(err, Error::Internal(_)));
    }
}
