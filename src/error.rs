//! Dial error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DialError {
    #[error("username is required")]
    UserRequired,

    #[error("host is required")]
    HostRequired,

    #[error("addr is required")]
    AddrRequired,

    #[error("invalid port {port:?}: {reason}")]
    InvalidPort { port: String, reason: String },

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("host key verification failed: {0}")]
    HostKeyVerification(String),

    #[error("key error: {0}")]
    KeyError(String),

    #[error("channel error: {0}")]
    ChannelError(String),

    #[error("SSH protocol error: {0}")]
    Protocol(String),

    #[error("SSH agent error: {0}")]
    Agent(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("session disconnected")]
    Disconnected,

    #[error("dial cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{}", join_errors(.0))]
    Many(Vec<DialError>),
}

impl DialError {
    /// Collapse a list of errors into one, flattening the single-error case.
    /// Callers must only pass a non-empty list.
    pub(crate) fn many(mut errs: Vec<DialError>) -> DialError {
        if errs.len() == 1 {
            errs.remove(0)
        } else {
            DialError::Many(errs)
        }
    }

    /// End-of-stream class failures: the peer is gone, not merely slow.
    pub fn is_eof(&self) -> bool {
        match self {
            DialError::Disconnected => true,
            DialError::Io(err) => err.kind() == std::io::ErrorKind::UnexpectedEof,
            _ => false,
        }
    }
}

fn join_errors(errs: &[DialError]) -> String {
    errs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl From<russh::Error> for DialError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::Disconnect => DialError::Disconnected,
            other => DialError::Protocol(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for DialError {
    fn from(err: russh::keys::Error) -> Self {
        DialError::KeyError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_many_flattens_single() {
        let err = DialError::many(vec![DialError::UserRequired]);
        assert!(matches!(err, DialError::UserRequired));
    }

    #[test]
    fn test_many_joins_messages() {
        let err = DialError::many(vec![DialError::UserRequired, DialError::HostRequired]);
        assert_eq!(err.to_string(), "username is required; host is required");
    }

    #[test]
    fn test_is_eof() {
        assert!(DialError::Disconnected.is_eof());
        assert!(DialError::Io(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "eof"
        ))
        .is_eof());
        assert!(!DialError::Cancelled.is_eof());
        assert!(!DialError::ChannelError("open failed".into()).is_eof());
    }
}
