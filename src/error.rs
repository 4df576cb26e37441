//! Unified error handling for imgate.
//!
//! Every control-surface call returns a [`GatewayError`]. Connection-level
//! failures are not returned to callers; they are latched as a
//! [`StatusReason`](crate::state::StatusReason) and reported once with the
//! disconnected status.

use imgate_account::AccountError;
use thiserror::Error;

// ============================================================================
// Gateway Errors (control-surface calls)
// ============================================================================

/// Errors a control-surface call can fail with.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("invalid handle: {0}")]
    InvalidHandle(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not implemented: {0}")]
    Unimplemented(String),

    /// The connection is not in the CONNECTED state.
    #[error("disconnected")]
    Disconnected,

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("account is in use by another client")]
    NameInUse,
}

impl GatewayError {
    /// Get a static error code string for replies and logging.
    #[inline]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidHandle(_) => "invalid_handle",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::NotAvailable(_) => "not_available",
            Self::PermissionDenied(_) => "permission_denied",
            Self::Unimplemented(_) => "not_implemented",
            Self::Disconnected => "disconnected",
            Self::NetworkError(_) => "network_error",
            Self::AuthenticationFailed => "authentication_failed",
            Self::NameInUse => "name_in_use",
        }
    }

    pub(crate) fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub(crate) fn not_available(msg: impl Into<String>) -> Self {
        Self::NotAvailable(msg.into())
    }

    pub(crate) fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    pub(crate) fn unimplemented(msg: impl Into<String>) -> Self {
        Self::Unimplemented(msg.into())
    }
}

/// Contact ids that fail to parse are reported as invalid handles.
impl From<AccountError> for GatewayError {
    fn from(err: AccountError) -> Self {
        Self::InvalidHandle(err.to_string())
    }
}

/// Result type for control-surface calls.
pub type GatewayResult<T> = Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_distinct() {
        let errors = [
            GatewayError::InvalidHandle("x".into()),
            GatewayError::InvalidArgument("x".into()),
            GatewayError::NotAvailable("x".into()),
            GatewayError::PermissionDenied("x".into()),
            GatewayError::Unimplemented("x".into()),
            GatewayError::Disconnected,
            GatewayError::NetworkError("x".into()),
            GatewayError::AuthenticationFailed,
            GatewayError::NameInUse,
        ];
        let mut codes: Vec<_> = errors.iter().map(GatewayError::error_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn account_errors_become_invalid_handles() {
        let err: GatewayError = AccountError::EmptyAccount.into();
        assert_eq!(err.error_code(), "invalid_handle");
    }

    #[test]
    fn display_includes_detail() {
        let err = GatewayError::permission_denied("cannot add members");
        assert_eq!(err.to_string(), "permission denied: cannot add members");
    }
}
