//! Error kinds surfaced by the store. Propagation policy: these are always
//! returned as typed results, never as unwinding. The apply path treats
//! [`Error::Internal`] as fatal -- see `cluster::ClusterNode::apply_ready`.

use std::fmt;

pub type CResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Malformed key range, empty key where disallowed, nonsensical revision.
    InputInvalid(String),
    /// Key, lease, or watcher not found.
    NotFound(String),
    /// Read at a revision that has been reclaimed by compaction.
    Compacted { requested: i64, compacted: i64 },
    /// Read at a revision greater than current.
    FutureRevision { requested: i64, current: i64 },
    /// Lease id collision on grant.
    AlreadyExists(String),
    /// Lease is past its TTL.
    Expired(String),
    /// Auth collaborator declined the request.
    PermissionDenied(String),
    /// No leader, or quorum loss.
    Unavailable(String),
    /// Explicit cancel or deadline.
    Canceled(String),
    /// Invariant violation. The apply thread treats this as fatal.
    Internal(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InputInvalid(msg) => write!(f, "invalid input: {msg}"),
            Error::NotFound(what) => write!(f, "not found: {what}"),
            Error::Compacted { requested, compacted } => {
                write!(f, "revision {requested} has been compacted (compacted_revision={compacted})")
            }
            Error::FutureRevision { requested, current } => {
                write!(f, "revision {requested} is in the future (current_revision={current})")
            }
            Error::AlreadyExists(what) => write!(f, "already exists: {what}"),
            Error::Expired(what) => write!(f, "expired: {what}"),
            Error::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            Error::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            Error::Canceled(msg) => write!(f, "canceled: {msg}"),
            Error::Internal(msg) => write!(f, "internal error: {msg}"),
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
        Error::Internal(format!("encoding error: {err}"))
    }
}

impl Error {
    /// True for errors a client may retry without changing its request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Unavailable(_) | Error::Canceled(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_revisions() {
        let err = Error::Compacted { requested: 5, compacted: 10 };
        assert!(err.to_string().contains("5"));
        assert!(err.to_string().contains("10"));
    }

    #[test]
    fn io_error_becomes_internal() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Internal(_)));
    }
}
