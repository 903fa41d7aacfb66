//! Error types shared by kestrel crates.

use thiserror::Error;

/// Result type alias for cluster client calls.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors returned by a `ClusterClient`.
///
/// Transport errors (`Unreachable`, `Unauthorized`) are fatal for the
/// operation that hit them. Everything else is specific to the call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClientError {
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("command failed: {0}")]
    Command(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl ClientError {
    /// Whether the error means the control plane could not be talked to at all.
    pub fn is_transport(&self) -> bool {
        matches!(self, ClientError::Unreachable(_) | ClientError::Unauthorized(_))
    }

    /// Whether the error means the addressed object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ClientError::NotFound(_) | ClientError::NamespaceNotFound(_)
        )
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

/// Result type alias for request validation.
pub type RequestResult<T> = Result<T, RequestError>;

/// A malformed rollout request.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("missing required field: {0}")]
    Missing(&'static str),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Result type alias for configuration loading.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading `kestrel.toml`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(ClientError::Unreachable("x".into()).is_transport());
        assert!(ClientError::Unauthorized("x".into()).is_transport());
        assert!(!ClientError::NotFound("x".into()).is_transport());
        assert!(!ClientError::Command("x".into()).is_transport());
    }

    #[test]
    fn not_found_classification() {
        assert!(ClientError::NotFound("x".into()).is_not_found());
        assert!(ClientError::NamespaceNotFound("x".into()).is_not_found());
        assert!(!ClientError::Unreachable("x".into()).is_not_found());
    }
}
