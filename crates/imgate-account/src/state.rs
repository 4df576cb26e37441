//! Client-side login state as reported by an account client.

/// Login progress of the underlying account connection.
///
/// Clients walk these states in declaration order and drop back to
/// `Closed` on logout or failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ClientState {
    #[default]
    Closed,
    Connecting,
    Authenticating,
    Synchronizing,
    /// Address book downloaded; contacts and groups are queryable.
    Synchronized,
    /// Fully logged in.
    Open,
}

/// Failure classes reported before the client closes.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ClientError {
    /// Transport failure or unreachable server.
    #[error("network error: {0}")]
    Network(String),
    /// Bad credentials.
    #[error("authentication failed")]
    Authentication,
    /// Another client logged in with the same account.
    #[error("logged in from another client")]
    OtherClient,
    #[error("protocol error: {0}")]
    Protocol(String),
}
