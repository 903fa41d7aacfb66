use kestrel_core::ClientError;
use thiserror::Error;

use crate::registry::SessionId;

/// Errors opening or closing a session. Local to that session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("local port {0} is already in use")]
    PortInUse(u16),

    #[error("local port 0 is not allowed; omit the port to pick a free one")]
    ZeroPort,

    #[error("no available port among {count} candidates starting at {base}")]
    NoAvailablePort { base: u16, count: u16 },

    #[error("failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("session: {0}")]
    Client(#[from] ClientError),

    #[error("session {0} not found")]
    NotFound(SessionId),
}

pub type SessionResult<T> = Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exhausted_range_names_the_range() {
        let err = SessionError::NoAvailablePort {
            base: 8000,
            count: 100,
        };
        assert_eq!(err.to_string(), "no available port among 100 candidates starting at 8000");
    }

    #[test]
    fn client_errors_keep_their_message() {
        let err = SessionError::from(ClientError::NotFound("service api".to_string()));
        assert_eq!(err.to_string(), "session: not found: service api");
    }
}
