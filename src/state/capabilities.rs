//! Per-contact channel capabilities.
//!
//! Every forward-list contact can be messaged. Media capabilities follow
//! the client features the contact's messenger advertises.

use std::collections::HashMap;

use imgate_account::{ClientCapabilities, Contact, Memberships};
use serde::Serialize;

use super::channels::ChannelKind;
use super::handle::HandleId;

/// Generic capability flags.
pub const CREATE: u32 = 1;
pub const INVITE: u32 = 2;

/// Media-specific capability flags.
pub const AUDIO: u32 = 1;
pub const VIDEO: u32 = 2;
pub const NAT_TRAVERSAL_STUN: u32 = 4;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityFlags {
    pub generic: u32,
    pub specific: u32,
}

impl CapabilityFlags {
    pub fn is_empty(self) -> bool {
        self.generic == 0 && self.specific == 0
    }
}

/// One entry of a `CapabilitiesChanged` signal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CapabilityChange {
    pub contact: HandleId,
    pub channel_type: ChannelKind,
    pub old: CapabilityFlags,
    pub new: CapabilityFlags,
}

/// One entry of a `get_capabilities` reply.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capability {
    pub contact: HandleId,
    pub channel_type: ChannelKind,
    pub flags: CapabilityFlags,
}

pub fn media_flags(caps: ClientCapabilities) -> CapabilityFlags {
    let mut flags = CapabilityFlags::default();
    if caps.sip_invite {
        flags.generic |= CREATE | INVITE;
        flags.specific |= AUDIO | NAT_TRAVERSAL_STUN;
    }
    if caps.webcam {
        flags.generic |= CREATE | INVITE;
        flags.specific |= VIDEO;
    }
    flags
}

#[derive(Debug, Default)]
pub struct Capabilities {
    text: HashMap<HandleId, CapabilityFlags>,
    media: HashMap<HandleId, CapabilityFlags>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(
        table: &mut HashMap<HandleId, CapabilityFlags>,
        contact: HandleId,
        kind: ChannelKind,
        flags: CapabilityFlags,
    ) -> Option<CapabilityChange> {
        let old = table.get(&contact).copied().unwrap_or_default();
        if old == flags {
            return None;
        }
        if flags.is_empty() {
            table.remove(&contact);
        } else {
            table.insert(contact, flags);
        }
        Some(CapabilityChange {
            contact,
            channel_type: kind,
            old,
            new: flags,
        })
    }

    /// Recompute everything known about `contact`.
    pub fn update(&mut self, handle: HandleId, contact: Option<&Contact>) -> Vec<CapabilityChange> {
        let text = match contact {
            Some(c) if c.memberships.contains(Memberships::FORWARD) => CapabilityFlags {
                generic: CREATE,
                specific: 0,
            },
            _ => CapabilityFlags::default(),
        };
        let media = contact.map_or_else(CapabilityFlags::default, |c| media_flags(c.capabilities));
        Self::set(&mut self.text, handle, ChannelKind::Text, text)
            .into_iter()
            .chain(Self::set(&mut self.media, handle, ChannelKind::StreamedMedia, media))
            .collect()
    }

    pub fn get(&self, handle: HandleId) -> Vec<Capability> {
        [
            (ChannelKind::Text, self.text.get(&handle)),
            (ChannelKind::StreamedMedia, self.media.get(&handle)),
        ]
        .into_iter()
        .filter_map(|(channel_type, flags)| {
            flags.map(|flags| Capability {
                contact: handle,
                channel_type,
                flags: *flags,
            })
        })
        .collect()
    }

    pub fn clear(&mut self) {
        self.text.clear();
        self.media.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgate_account::ContactKey;

    fn contact(sip: bool, webcam: bool) -> Contact {
        let mut c = Contact::new(ContactKey::native("bob@example.com"))
            .with_memberships(Memberships::FORWARD);
        c.capabilities = ClientCapabilities {
            sip_invite: sip,
            webcam,
        };
        c
    }

    #[test]
    fn forward_contacts_can_be_messaged() {
        let mut caps = Capabilities::new();
        let changes = caps.update(HandleId(2), Some(&contact(false, false)));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].channel_type, ChannelKind::Text);
        assert_eq!(changes[0].new.generic, CREATE);
    }

    #[test]
    fn changes_are_only_reported_once() {
        let mut caps = Capabilities::new();
        let bob = contact(true, false);
        assert_eq!(caps.update(HandleId(2), Some(&bob)).len(), 2);
        assert!(caps.update(HandleId(2), Some(&bob)).is_empty());

        let with_cam = contact(true, true);
        let changes = caps.update(HandleId(2), Some(&with_cam));
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].old.specific, AUDIO | NAT_TRAVERSAL_STUN);
        assert_eq!(changes[0].new.specific, AUDIO | NAT_TRAVERSAL_STUN | VIDEO);
    }

    #[test]
    fn removed_contact_loses_everything() {
        let mut caps = Capabilities::new();
        caps.update(HandleId(2), Some(&contact(true, true)));
        let changes = caps.update(HandleId(2), None);
        assert_eq!(changes.len(), 2);
        assert!(caps.get(HandleId(2)).is_empty());
    }
}
