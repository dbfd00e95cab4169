//! Error types for the registry client.

use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::url::UrlError;

/// Result type alias for registry operations.
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors surfaced by the registry core to its callers.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No usable coordination-service connection.
    #[error("coordination connection broken: {0}")]
    ConnectionBroken(String),

    /// The node already existed and the delete-and-retry step also failed.
    #[error("registration conflict at {path}")]
    RegistrationConflict { path: String },

    /// One malformed notification entry.
    #[error("cannot decode registry entry {entry:?}: {reason}")]
    Decode { entry: String, reason: String },

    /// The coordination session was lost mid-call.
    #[error("coordination session expired")]
    SessionExpired,

    /// The registry has been shut down.
    #[error("registry closed")]
    Closed,

    #[error(transparent)]
    InvalidUrl(#[from] UrlError),

    /// Any other remote failure.
    #[error("coordination error: {0}")]
    Coordination(CoordinationError),
}

impl From<CoordinationError> for RegistryError {
    fn from(err: CoordinationError) -> Self {
        match err {
            CoordinationError::ConnectionLoss(msg) => Self::ConnectionBroken(msg),
            CoordinationError::SessionExpired => Self::SessionExpired,
            CoordinationError::Closed => Self::ConnectionBroken("coordination client closed".into()),
            other => Self::Coordination(other),
        }
    }
}

impl RegistryError {
    /// Whether retrying against a fresh session could succeed.
    pub fn is_session_loss(&self) -> bool {
        matches!(self, Self::ConnectionBroken(_) | Self::SessionExpired)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordination_errors_map_to_taxonomy() {
        let err: RegistryError = CoordinationError::ConnectionLoss("reset".into()).into();
        assert!(matches!(err, RegistryError::ConnectionBroken(_)));
        assert!(err.is_session_loss());

        let err: RegistryError = CoordinationError::SessionExpired.into();
        assert!(matches!(err, RegistryError::SessionExpired));

        let err: RegistryError = CoordinationError::NoNode {
            path: "/dubbo/x".into(),
        }
        .into();
        assert!(matches!(err, RegistryError::Coordination(_)));
        assert!(!err.is_session_loss());
        assert!(err.to_string().contains("/dubbo/x"));
    }

    #[test]
    fn conflict_display_names_path() {
        let err = RegistryError::RegistrationConflict {
            path: "/dubbo/com.foo.Service/providers/abc".into(),
        };
        assert!(err.to_string().contains("providers/abc"));
    }
}
