use std::sync::Arc;
use thiserror::Error as ThisError;

use crate::types::Csn;

/// Internal error type. Most of the crate speaks `LoadError`; the public
/// surface converts it into [`Error`] so callers only need to reason about
/// a handful of [`ErrorKind`]s.
#[non_exhaustive]
#[derive(Clone, Debug, ThisError)]
pub enum LoadError {
    #[error("not initialized")]
    NotInitialized,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("load context not found")]
    ContextMissing,

    #[error("slice writer not found. slice_id=`{0}`")]
    SliceMissing(u64),

    #[error("execution attempt not found. context_id=`{0}`")]
    AttemptMissing(u64),

    #[error("unknown tablet. tablet_id=`{0}`")]
    TabletMissing(u64),

    #[error("attempt superseded by a newer execution")]
    Expired,

    #[error("load already committed")]
    AlreadyCommitted,

    #[error("resource busy, try again")]
    Again,

    #[error("bounded wait elapsed, caller should retry")]
    NeedRetry,

    #[error("memory budget exhausted")]
    AllocationFailed,

    #[error("merge scheduler is shut down")]
    SchedulerClosed,

    #[error(
        "csn range gap between merge inputs. covered_end=`{covered_end}`, next_start=`{next_start}`"
    )]
    CsnRangeGap { covered_end: Csn, next_start: Csn },

    #[error("published major table identity does not match the committed identity")]
    SnapshotDiscarded,

    #[error("commit csn conflict. persisted=`{persisted}`, proposed=`{proposed}`")]
    CommitCsnConflict { persisted: Csn, proposed: Csn },

    #[error("stale rebuild seq. expected=`{expected}`, actual=`{actual}`")]
    RebuildSeqMismatch { expected: u64, actual: u64 },

    #[error("checksum report failed after {0} attempts")]
    ChecksumReportFailed(u32),

    #[error("invalid configuration format")]
    InvalidConfigurationFormat(#[from] Arc<figment::Error>),

    #[error("unexpected internal state: {0}")]
    Unexpected(&'static str),
}

impl From<figment::Error> for LoadError {
    fn from(value: figment::Error) -> Self {
        Self::InvalidConfigurationFormat(Arc::new(value))
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Represents the kind of public errors that can be returned to the user.
///
/// These are less specific and more prescriptive: the caller decides how to
/// proceed from the kind alone.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The attempt was superseded by a newer execution or the load already
    /// finished elsewhere. The caller must stop this attempt and let the
    /// newer one (or the finished result) win. Not an error for the end
    /// user when a newer attempt is in flight.
    Expired,

    /// The caller passed an invalid argument, called a method out of order,
    /// or supplied an invalid configuration. The caller must correct the
    /// code or configuration.
    Invalid,

    /// A resource is temporarily unavailable (queue full, bounded wait
    /// elapsed, lock timeout). The caller should retry with backoff.
    Unavailable,

    /// Persisted state is inconsistent (csn range gap, discarded snapshot,
    /// conflicting commit records). Non-retryable; must reach an operator.
    Data,

    /// An unexpected internal error. Callers should not see this.
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Expired => write!(f, "Expired error"),
            ErrorKind::Invalid => write!(f, "Invalid error"),
            ErrorKind::Unavailable => write!(f, "Unavailable error"),
            ErrorKind::Data => write!(f, "Data error"),
            ErrorKind::Internal => write!(f, "Internal error"),
        }
    }
}

#[non_exhaustive]
/// Represents a public error that can be returned to the user.
#[derive(Debug)]
pub struct Error {
    msg: String,
    kind: ErrorKind,
    source: Option<BoxError>,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.msg)?;
        if let Some(source) = self.source.as_ref() {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

impl Error {
    /// Creates a new expired error.
    pub fn expired(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Expired,
            source: None,
        }
    }

    /// Creates a new invalid-usage error.
    pub fn invalid(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Invalid,
            source: None,
        }
    }

    /// Creates a new transient error.
    pub fn unavailable(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Unavailable,
            source: None,
        }
    }

    /// Creates a new data-integrity error.
    pub fn data(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Data,
            source: None,
        }
    }

    /// Creates a new internal error.
    pub fn internal(msg: String) -> Self {
        Self {
            msg,
            kind: ErrorKind::Internal,
            source: None,
        }
    }

    /// Adds a source to the error.
    pub fn with_source(mut self, source: BoxError) -> Self {
        self.source = Some(source);
        self
    }

    /// Returns the error kind.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        let msg = err.to_string();
        match err {
            // Expired: stop this attempt, a newer one (or the finished
            // result) owns the tablet.
            LoadError::Expired => Error::expired(msg),
            LoadError::AlreadyCommitted => Error::expired(msg),

            // Invalid
            LoadError::NotInitialized => Error::invalid(msg),
            LoadError::InvalidArgument(_) => Error::invalid(msg),
            LoadError::ContextMissing => Error::invalid(msg),
            LoadError::SliceMissing(_) => Error::invalid(msg),
            LoadError::AttemptMissing(_) => Error::invalid(msg),
            LoadError::TabletMissing(_) => Error::invalid(msg),
            LoadError::InvalidConfigurationFormat(e) => {
                Error::invalid(msg).with_source(Box::new(e))
            }

            // Unavailable
            LoadError::Again => Error::unavailable(msg),
            LoadError::NeedRetry => Error::unavailable(msg),
            LoadError::AllocationFailed => Error::unavailable(msg),
            LoadError::SchedulerClosed => Error::unavailable(msg),
            LoadError::RebuildSeqMismatch { .. } => Error::unavailable(msg),

            // Data
            LoadError::CsnRangeGap { .. } => Error::data(msg),
            LoadError::SnapshotDiscarded => Error::data(msg),
            LoadError::CommitCsnConflict { .. } => Error::data(msg),
            LoadError::ChecksumReportFailed(_) => Error::data(msg),

            // Internal
            LoadError::Unexpected(_) => Error::internal(msg),
        }
    }
}
