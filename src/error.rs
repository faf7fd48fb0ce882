use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;

use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::history::HistoryError;
use crate::pointer::PointerError;
use crate::remote::RemoteError;

/// The category of a failure, independent of where it happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Io,
    CacheCorruption,
    MalformedPointer,
    RemoteUnavailable,
    RemoteFull,
    IntegrityMismatch,
    ArtifactUnavailable,
    ObjectNotFound,
    NoDefaultRemote,
    UnknownRemote,
    Config,
    NotTracked,
    History,
}

impl ErrorKind {
    /// Transfer failures worth retrying: the remote may come back, and a
    /// download that failed verification may have been damaged in flight.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::RemoteUnavailable | ErrorKind::IntegrityMismatch
        )
    }

    pub(crate) fn of_cache(err: &CacheError) -> ErrorKind {
        match err {
            CacheError::Io(_) => ErrorKind::Io,
            CacheError::NotFound(_) => ErrorKind::ObjectNotFound,
            CacheError::Corruption { .. } => ErrorKind::CacheCorruption,
            CacheError::DigestMismatch { .. } => ErrorKind::IntegrityMismatch,
        }
    }
}

/// Errors returned by [`Workspace`](crate::Workspace) operations.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Cache(CacheError),
    Remote(RemoteError),
    MalformedPointer {
        path: PathBuf,
        source: PointerError,
    },
    /// The content is neither cached locally nor available from a remote.
    ArtifactUnavailable {
        path: PathBuf,
        id: String,
    },
    NoDefaultRemote,
    UnknownRemote(String),
    Config(ConfigError),
    /// The path has no pointer file.
    NotTracked(PathBuf),
    /// The path lies outside the workspace root.
    OutsideWorkspace(PathBuf),
    /// The path is named like a pointer file and cannot be tracked.
    PointerName(PathBuf),
    History(HistoryError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Io(_) => ErrorKind::Io,
            Error::Cache(e) => ErrorKind::of_cache(e),
            Error::Remote(e) => e.kind(),
            Error::MalformedPointer { .. } => ErrorKind::MalformedPointer,
            Error::ArtifactUnavailable { .. } => ErrorKind::ArtifactUnavailable,
            Error::NoDefaultRemote => ErrorKind::NoDefaultRemote,
            Error::UnknownRemote(_) => ErrorKind::UnknownRemote,
            Error::Config(_) | Error::OutsideWorkspace(_) | Error::PointerName(_) => {
                ErrorKind::Config
            }
            Error::NotTracked(_) => ErrorKind::NotTracked,
            Error::History(_) => ErrorKind::History,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "io error: {e}"),
            Error::Cache(e) => write!(f, "{e}"),
            Error::Remote(e) => write!(f, "{e}"),
            Error::MalformedPointer { path, source } => {
                write!(f, "{}: {source}", path.display())
            }
            Error::ArtifactUnavailable { path, id } => write!(
                f,
                "{id} for {} is not in the cache or on any configured remote",
                path.display()
            ),
            Error::NoDefaultRemote => {
                write!(f, "no remote given and no default remote configured")
            }
            Error::UnknownRemote(name) => write!(f, "no remote named {name:?}"),
            Error::Config(e) => write!(f, "{e}"),
            Error::NotTracked(path) => write!(f, "{} is not tracked", path.display()),
            Error::OutsideWorkspace(path) => {
                write!(f, "{} is outside the workspace", path.display())
            }
            Error::PointerName(path) => {
                write!(f, "{} is named like a pointer file", path.display())
            }
            Error::History(e) => write!(f, "{e}"),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Cache(e) => Some(e),
            Error::Remote(e) => Some(e),
            Error::MalformedPointer { source, .. } => Some(source),
            Error::Config(e) => Some(e),
            Error::History(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<CacheError> for Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Io(e) => Error::Io(e),
            other => Error::Cache(other),
        }
    }
}

impl From<RemoteError> for Error {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Cache(e) => e.into(),
            other => Error::Remote(other),
        }
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::NoDefaultRemote => Error::NoDefaultRemote,
            ConfigError::UnknownRemote(name) => Error::UnknownRemote(name),
            ConfigError::Io(e) => Error::Io(e),
            other => Error::Config(other),
        }
    }
}

impl From<HistoryError> for Error {
    fn from(err: HistoryError) -> Self {
        Error::History(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_and_retryability() {
        let err: Error = CacheError::Corruption {
            id: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert_eq!(err.kind(), ErrorKind::CacheCorruption);
        assert!(!err.is_retryable());

        let err: Error = RemoteError::Cache(CacheError::NotFound("x".into())).into();
        assert_eq!(err.kind(), ErrorKind::ObjectNotFound);

        let err: Error = ConfigError::NoDefaultRemote.into();
        assert!(matches!(err, Error::NoDefaultRemote));
        let err: Error = ConfigError::UnknownRemote("s3".into()).into();
        assert_eq!(err.kind(), ErrorKind::UnknownRemote);

        let err: Error = CacheError::DigestMismatch {
            expected: "a".into(),
            actual: "b".into(),
        }
        .into();
        assert!(err.is_retryable());
        assert!(ErrorKind::RemoteUnavailable.is_retryable());
        assert!(!ErrorKind::RemoteFull.is_retryable());
        assert!(!ErrorKind::ArtifactUnavailable.is_retryable());
    }
}
