//! Error taxonomy shared by the store, the process engine and the
//! control plane

use std::error::Error;
use std::fmt;
use std::time::Duration;

/// Top level error of every MUSIC operation
#[derive(Debug)]
pub enum MusicError {
    /// Unknown zone, signer, group, process or state. Nothing changed.
    Validation(String),
    /// The request would break a model invariant (locked group, last
    /// signer, duplicate membership). Nothing changed.
    Invariant(String),
    /// A signer or parent could not be reached or answered with an error
    Backend(String),
    /// A backend kept throttling past the retry budget
    Throttled {
        backend: String,
        retry_after: Duration,
    },
    /// The data model is malformed, e.g. a zone attached to a process
    /// that does not exist
    Internal(String),
    /// Database failure
    Store(sqlx::Error),
}

impl MusicError {
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        MusicError::Validation(msg.into())
    }

    pub fn invariant<S: Into<String>>(msg: S) -> Self {
        MusicError::Invariant(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        MusicError::Internal(msg.into())
    }

    /// True for database lock contention, which callers may retry.
    pub fn is_locked(&self) -> bool {
        match self {
            MusicError::Store(e) => is_locked_error(e),
            _ => false,
        }
    }
}

/// Recognises SQLite "database is locked" / "database is busy" errors.
pub fn is_locked_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            let msg = db.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        sqlx::Error::PoolTimedOut => true,
        _ => false,
    }
}

impl fmt::Display for MusicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MusicError::Validation(msg) => write!(f, "{}", msg),
            MusicError::Invariant(msg) => write!(f, "{}", msg),
            MusicError::Backend(msg) => write!(f, "backend error: {}", msg),
            MusicError::Throttled {
                backend,
                retry_after,
            } => write!(
                f,
                "backend {} still throttling, retry after {:?}",
                backend, retry_after
            ),
            MusicError::Internal(msg) => write!(f, "internal error: {}", msg),
            MusicError::Store(e) => write!(f, "database error: {}", e),
        }
    }
}

impl Error for MusicError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MusicError::Store(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sqlx::Error> for MusicError {
    fn from(err: sqlx::Error) -> Self {
        MusicError::Store(err)
    }
}

impl From<crate::dns::protocol::ProtocolError> for MusicError {
    fn from(err: crate::dns::protocol::ProtocolError) -> Self {
        MusicError::Validation(err.to_string())
    }
}

/// Result type alias for MUSIC operations
pub type MusicResult<T> = Result<T, MusicError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = MusicError::invariant("signer group gA is locked by process add-signer");
        assert_eq!(
            format!("{}", error),
            "signer group gA is locked by process add-signer"
        );

        let error = MusicError::Throttled {
            backend: "hosted".to_string(),
            retry_after: Duration::from_secs(3),
        };
        assert!(format!("{}", error).contains("hosted"));
    }

    #[test]
    fn test_locked_detection() {
        assert!(MusicError::Store(sqlx::Error::PoolTimedOut).is_locked());
        assert!(!MusicError::validation("zone foo. unknown").is_locked());
    }
}
