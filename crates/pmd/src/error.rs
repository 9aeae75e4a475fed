//! Unified error type for every fallible PMD operation.
//!
//! Subsystem-local errors (log framing, record decode) are distinct small `Error`-derived types
//! that get folded into [`PmdError`] at the component boundary.

use std::fmt;
use std::io::Error as IoError;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PmdError>;

/// The kinds named by the error-handling design: each maps to one of the documented failure
/// classes, not to an implementation accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PmdErrorKind {
    /// Bad argument: wrong object type, bad media class, bad state for the requested transition.
    InvalidArgument,
    /// A lookup (replay reconciliation, delete-by-id) found nothing.
    NotFound,
    /// A duplicate objid was seen where uniqueness is required.
    AlreadyExists,
    /// The active mlog of an MDC is full; the caller should compact and retry once.
    LogFull,
    /// Non-interrupt I/O error from a collaborator (MDC log, SMAP, ECIO, SB).
    Io,
    /// A device referenced by on-media metadata could not be found/opened.
    DeviceUnavailable,
    /// Allocation failure in this process (not a device capacity failure).
    OutOfMemory,
    /// On-media content-version newer than this binary understands.
    VersionTooNew,
    /// On-media content-version is old and the caller disallowed an upgrade.
    UpgradeNotPermitted,
    /// Pool or MDC set is out of slots/space for a new allocation.
    NoSpace,
    /// Invariant violation detected internally; always a bug, never a user mistake.
    Internal,
}

impl fmt::Display for PmdErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidArgument    => "invalid argument",
            Self::NotFound           => "not found",
            Self::AlreadyExists      => "already exists",
            Self::LogFull            => "log full",
            Self::Io                 => "I/O error",
            Self::DeviceUnavailable  => "device unavailable",
            Self::OutOfMemory        => "out of memory",
            Self::VersionTooNew      => "on-media version too new",
            Self::UpgradeNotPermitted => "upgrade not permitted",
            Self::NoSpace            => "no space",
            Self::Internal           => "internal error",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
#[error("{kind}: {msg}")]
pub struct PmdError {
    pub kind: PmdErrorKind,
    pub msg:  String,
    #[source]
    source:   Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl PmdError {
    #[must_use]
    pub fn new(kind: PmdErrorKind, msg: impl Into<String>) -> Self {
        Self { kind, msg: msg.into(), source: None }
    }

    #[must_use]
    pub fn with_source(
        kind: PmdErrorKind,
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self { kind, msg: msg.into(), source: Some(Box::new(source)) }
    }

    #[must_use]
    pub const fn kind(&self) -> PmdErrorKind {
        self.kind
    }
}

impl From<IoError> for PmdError {
    fn from(err: IoError) -> Self {
        Self::with_source(PmdErrorKind::Io, "I/O error from a collaborator", err)
    }
}
