//! Error types for the account-client surface.

use thiserror::Error;

/// Errors raised while interpreting account identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AccountError {
    #[error("empty account name")]
    EmptyAccount,

    #[error("invalid account name: {0}")]
    InvalidAccount(String),

    #[error("invalid network id: {0}")]
    InvalidNetwork(String),
}
