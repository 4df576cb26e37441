//! Simple presence: the status table and its mapping to account presence.

use imgate_account::{Contact, Presence, Profile};
use serde::Serialize;

use crate::error::{GatewayError, GatewayResult};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceType {
    Unset,
    Offline,
    Available,
    Away,
    ExtendedAway,
    Hidden,
    Busy,
    Unknown,
    Error,
}

/// One settable status.
#[derive(Debug)]
pub struct StatusSpec {
    pub name: &'static str,
    pub kind: PresenceType,
    pub presence: Presence,
    pub may_set_on_self: bool,
    pub can_have_message: bool,
}

pub const STATUSES: &[StatusSpec] = &[
    StatusSpec {
        name: "available",
        kind: PresenceType::Available,
        presence: Presence::Online,
        may_set_on_self: true,
        can_have_message: true,
    },
    StatusSpec {
        name: "away",
        kind: PresenceType::Away,
        presence: Presence::Away,
        may_set_on_self: true,
        can_have_message: true,
    },
    StatusSpec {
        name: "brb",
        kind: PresenceType::Away,
        presence: Presence::BeRightBack,
        may_set_on_self: true,
        can_have_message: true,
    },
    StatusSpec {
        name: "dnd",
        kind: PresenceType::Busy,
        presence: Presence::Busy,
        may_set_on_self: true,
        can_have_message: true,
    },
    StatusSpec {
        name: "phone",
        kind: PresenceType::Busy,
        presence: Presence::OnThePhone,
        may_set_on_self: true,
        can_have_message: true,
    },
    StatusSpec {
        name: "lunch",
        kind: PresenceType::ExtendedAway,
        presence: Presence::OutToLunch,
        may_set_on_self: true,
        can_have_message: true,
    },
    StatusSpec {
        name: "xa",
        kind: PresenceType::ExtendedAway,
        presence: Presence::Idle,
        may_set_on_self: true,
        can_have_message: true,
    },
    StatusSpec {
        name: "hidden",
        kind: PresenceType::Hidden,
        presence: Presence::Invisible,
        may_set_on_self: true,
        can_have_message: false,
    },
    StatusSpec {
        name: "offline",
        kind: PresenceType::Offline,
        presence: Presence::Offline,
        may_set_on_self: true,
        can_have_message: false,
    },
];

pub fn status_named(name: &str) -> Option<&'static StatusSpec> {
    STATUSES.iter().find(|s| s.name == name)
}

pub fn status_of(presence: Presence) -> &'static StatusSpec {
    STATUSES
        .iter()
        .find(|s| s.presence == presence)
        .unwrap_or(&STATUSES[STATUSES.len() - 1])
}

/// What `get_presences` reports for a handle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SimplePresence {
    pub kind: PresenceType,
    pub status: String,
    pub message: String,
}

impl SimplePresence {
    pub fn new(presence: Presence, message: &str) -> Self {
        let spec = status_of(presence);
        Self {
            kind: spec.kind,
            status: spec.name.to_string(),
            message: if spec.can_have_message {
                message.to_string()
            } else {
                String::new()
            },
        }
    }

    pub fn offline() -> Self {
        Self::new(Presence::Offline, "")
    }

    pub fn of_contact(contact: &Contact) -> Self {
        Self::new(contact.presence, &contact.personal_message)
    }

    pub fn of_profile(profile: &Profile) -> Self {
        Self::new(profile.presence, &profile.personal_message)
    }
}

/// A validated `set_presence` request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PresenceRequest {
    /// Going offline means disconnecting.
    Disconnect,
    Set { presence: Presence, message: String },
}

pub fn parse_request(status: &str, message: &str) -> GatewayResult<PresenceRequest> {
    let spec = status_named(status)
        .filter(|s| s.may_set_on_self)
        .ok_or_else(|| GatewayError::invalid_argument(format!("unknown status '{status}'")))?;
    if spec.presence == Presence::Offline {
        return Ok(PresenceRequest::Disconnect);
    }
    Ok(PresenceRequest::Set {
        presence: spec.presence,
        message: if spec.can_have_message {
            message.to_string()
        } else {
            String::new()
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_presence_has_a_status() {
        for presence in [
            Presence::Online,
            Presence::Busy,
            Presence::Idle,
            Presence::BeRightBack,
            Presence::Away,
            Presence::OnThePhone,
            Presence::OutToLunch,
            Presence::Invisible,
            Presence::Offline,
        ] {
            assert_eq!(status_of(presence).presence, presence);
        }
    }

    #[test]
    fn hidden_drops_the_message() {
        assert_eq!(
            parse_request("hidden", "shh").unwrap(),
            PresenceRequest::Set {
                presence: Presence::Invisible,
                message: String::new(),
            }
        );
    }

    #[test]
    fn offline_means_disconnect_and_unknown_is_rejected() {
        assert_eq!(parse_request("offline", "").unwrap(), PresenceRequest::Disconnect);
        assert_eq!(
            parse_request("sleeping", "").unwrap_err().error_code(),
            "invalid_argument"
        );
    }

    #[test]
    fn contact_presence_maps_to_type() {
        let p = SimplePresence::new(Presence::OutToLunch, "back at 2");
        assert_eq!(p.kind, PresenceType::ExtendedAway);
        assert_eq!(p.status, "lunch");
        assert_eq!(p.message, "back at 2");
    }
}
