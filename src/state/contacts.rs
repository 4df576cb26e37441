//! Contact attributes: one lookup returning whatever the presence,
//! aliasing, avatar and capability interfaces know about a set of handles.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::capabilities::Capability;
use super::handle::HandleId;
use super::presence::SimplePresence;
use crate::error::GatewayError;

/// Interfaces that contribute contact attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactInterface {
    /// The contact id. Always reported, requested or not.
    Connection,
    Presence,
    Aliasing,
    Avatars,
    Capabilities,
}

impl ContactInterface {
    pub const ALL: [ContactInterface; 5] = [
        Self::Connection,
        Self::Presence,
        Self::Aliasing,
        Self::Avatars,
        Self::Capabilities,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Presence => "presence",
            Self::Aliasing => "aliasing",
            Self::Avatars => "avatars",
            Self::Capabilities => "capabilities",
        }
    }
}

impl fmt::Display for ContactInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContactInterface {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| GatewayError::invalid_argument(format!("unknown contact interface '{s}'")))
    }
}

/// Attributes of one contact handle. Fields of interfaces that were not
/// asked for stay empty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ContactAttributes {
    pub handle: HandleId,
    pub contact_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<SimplePresence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<Vec<Capability>>,
}

impl ContactAttributes {
    pub fn new(handle: HandleId, contact_id: impl Into<String>) -> Self {
        Self {
            handle,
            contact_id: contact_id.into(),
            presence: None,
            alias: None,
            avatar_token: None,
            capabilities: None,
        }
    }
}
