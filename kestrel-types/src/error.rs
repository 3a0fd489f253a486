//! Error taxonomy shared across the control plane.

use thiserror::Error;

/// Errors surfaced by stores, services and reconcilers.
///
/// The variants map 1:1 onto the transport codes of the client API; the
/// service layer translates lower-level failures into these kinds at the
/// seam and never leaks driver errors to callers.
#[derive(Debug, Error)]
pub enum Error {
    /// Entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Uniqueness violation, or an idempotent reject (duplicate download).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Failed validation before any state was touched.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation would violate an invariant in the current state.
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),

    /// Transient downstream failure; safe to retry.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Unexpected failure; logged with context.
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status code for the REST error envelope.
    pub fn http_code(&self) -> u16 {
        match self {
            Error::NotFound(_) => 404,
            Error::AlreadyExists(_) => 409,
            Error::InvalidArgument(_) => 400,
            Error::FailedPrecondition(_) => 412,
            Error::Unavailable(_) => 503,
            Error::Internal(_) => 500,
        }
    }

    /// True for failures that a reconciler should retry next tick.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Unavailable(_))
    }

    /// Wrap an arbitrary error with the name of the failed operation.
    pub fn internal(op: &str, err: impl std::fmt::Display) -> Self {
        Error::Internal(format!("{}: {}", op, err))
    }

    /// Wrap a transient downstream failure with the operation name.
    pub fn unavailable(op: &str, err: impl std::fmt::Display) -> Self {
        Error::Unavailable(format!("{}: {}", op, err))
    }
}

/// Result type used throughout Kestrel.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_codes() {
        assert_eq!(Error::NotFound("vm".into()).http_code(), 404);
        assert_eq!(Error::AlreadyExists("vm".into()).http_code(), 409);
        assert_eq!(Error::InvalidArgument("size".into()).http_code(), 400);
        assert_eq!(Error::FailedPrecondition("volumes".into()).http_code(), 412);
        assert_eq!(Error::Unavailable("daemon".into()).http_code(), 503);
        assert_eq!(Error::Internal("oops".into()).http_code(), 500);
    }

    #[test]
    fn test_only_unavailable_is_transient() {
        assert!(Error::Unavailable("x".into()).is_transient());
        assert!(!Error::NotFound("x".into()).is_transient());
        assert!(!Error::Internal("x".into()).is_transient());
    }
}
