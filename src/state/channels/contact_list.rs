//! Contact-list and group channels.
//!
//! The roster of these channels is never edited directly: it is derived
//! from the address-book membership flags of every known contact. Local
//! add/remove calls go to the address book and the roster follows the
//! echoed address-book events.

use imgate_account::{Contact, ContactKey, GroupId, Memberships};
use tracing::{debug, warn};

use super::{ChannelBase, ChannelCtx, GroupFlags, Groupable};
use crate::error::{GatewayError, GatewayResult};
use crate::state::handle::{Handle, ListName};
use crate::state::roster::{MembersDelta, Placement};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListKind {
    List(ListName),
    /// A user-defined group. The id is unknown until the address book has
    /// created the group.
    Group { id: Option<GroupId>, name: String },
}

impl ListKind {
    /// Where `contact` belongs in a roster of this kind.
    pub fn placement(&self, contact: &Contact) -> Option<Placement> {
        let flags = contact.memberships;
        match self {
            Self::List(ListName::Subscribe) => {
                flags.contains(Memberships::FORWARD).then_some(Placement::Member)
            }
            Self::List(ListName::Publish) => {
                if flags.contains(Memberships::PENDING) {
                    Some(Placement::LocalPending)
                } else if flags.contains(Memberships::REVERSE) {
                    Some(Placement::Member)
                } else {
                    None
                }
            }
            Self::List(ListName::Deny) => {
                flags.contains(Memberships::BLOCK).then_some(Placement::Member)
            }
            Self::Group { id: Some(id), .. } => {
                contact.groups.contains(id).then_some(Placement::Member)
            }
            Self::Group { id: None, .. } => None,
        }
    }
}

#[derive(Debug)]
pub struct ContactListChannel {
    pub(super) base: ChannelBase,
    kind: ListKind,
    /// Contacts waiting for the group to exist.
    queued: Vec<ContactKey>,
    group_requested: bool,
}

impl ContactListChannel {
    pub fn new(base: ChannelBase, kind: ListKind) -> Self {
        Self {
            base,
            kind,
            queued: Vec::new(),
            group_requested: false,
        }
    }

    pub fn kind(&self) -> &ListKind {
        &self.kind
    }

    pub fn group_id(&self) -> Option<&GroupId> {
        match &self.kind {
            ListKind::Group { id, .. } => id.as_ref(),
            ListKind::List(_) => None,
        }
    }

    /// Full resync from the address book, always reported once.
    pub(super) fn populate(&mut self, ctx: &mut ChannelCtx<'_>) {
        if let ListKind::Group { id: None, name } = &self.kind {
            debug!(channel = %self.base.id, group = %name, "creating group for new channel");
            ctx.account.add_group(name);
            self.group_requested = true;
        }
        let delta = self.full_delta(ctx);
        self.base.apply_initial(ctx, delta);
    }

    fn full_delta(&self, ctx: &mut ChannelCtx<'_>) -> MembersDelta {
        let mut delta = MembersDelta::new();
        let contacts = ctx.account.contacts();
        for contact in &contacts {
            if let Some(placement) = self.kind.placement(contact) {
                delta = delta.place(ctx.handles.contact(&contact.key), Some(placement));
            }
        }
        let stale: Vec<Handle> = self
            .base
            .roster
            .everyone()
            .filter(|h| {
                h.contact_key()
                    .is_none_or(|key| !contacts.iter().any(|c| &c.key == key))
            })
            .cloned()
            .collect();
        for handle in stale {
            delta = delta.remove(handle);
        }
        delta
    }

    /// Recompute one contact after an address-book event.
    pub fn contact_changed(&mut self, ctx: &mut ChannelCtx<'_>, key: &ContactKey) {
        let placement = ctx
            .account
            .contact(key)
            .and_then(|contact| self.kind.placement(&contact));
        let handle = ctx.handles.contact(key);
        if placement.is_none() && self.base.roster.placement(handle.id()).is_none() {
            return;
        }
        self.base
            .apply(ctx, MembersDelta::new().place(handle, placement));
    }

    /// The address book created a group; adopt it if it is ours.
    pub fn group_added(&mut self, ctx: &mut ChannelCtx<'_>, group: &GroupId, name: &str) -> bool {
        let ListKind::Group { id, name: ours } = &mut self.kind else {
            return false;
        };
        if id.is_some() || !ours.eq_ignore_ascii_case(name) {
            return false;
        }
        *id = Some(group.clone());
        self.group_requested = false;
        debug!(channel = %self.base.id, group = %group, queued = self.queued.len(), "group created");
        for key in std::mem::take(&mut self.queued) {
            ctx.account.add_contact_to_group(group, &key);
        }
        let delta = self.full_delta(ctx);
        self.base.apply(ctx, delta);
        true
    }

    fn reject_self(ctx: &ChannelCtx<'_>, handles: &[Handle]) -> GatewayResult<()> {
        if handles.iter().any(|h| ctx.handles.is_self(h)) {
            return Err(GatewayError::permission_denied(
                "the local user cannot be listed",
            ));
        }
        Ok(())
    }
}

fn contact_keys(handles: &[Handle]) -> Vec<ContactKey> {
    handles
        .iter()
        .filter_map(Handle::contact_key)
        .cloned()
        .collect()
}

impl Groupable for ContactListChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn group_flags(&self) -> GroupFlags {
        match self.kind {
            ListKind::List(ListName::Subscribe) => {
                GroupFlags::CAN_ADD | GroupFlags::CAN_REMOVE | GroupFlags::CAN_RESCIND
            }
            _ => GroupFlags::CAN_ADD | GroupFlags::CAN_REMOVE,
        }
    }

    fn add_members(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        handles: &[Handle],
        _message: &str,
    ) -> GatewayResult<()> {
        super::require_contacts(handles)?;
        Self::reject_self(ctx, handles)?;
        let keys = contact_keys(handles);
        match &self.kind {
            ListKind::List(ListName::Subscribe) => {
                for key in &keys {
                    ctx.account.add_contact(key);
                }
            }
            ListKind::List(ListName::Publish) => {
                let placements: Vec<Option<Placement>> = handles
                    .iter()
                    .map(|h| self.base.roster.placement(h.id()))
                    .collect();
                if let Some(i) = placements
                    .iter()
                    .position(|p| !matches!(p, Some(Placement::LocalPending | Placement::Member)))
                {
                    return Err(GatewayError::permission_denied(format!(
                        "{} has not asked to see our presence",
                        handles[i]
                    )));
                }
                for (key, placement) in keys.iter().zip(placements) {
                    if placement == Some(Placement::LocalPending) {
                        ctx.account.accept_contact_invitation(key);
                    }
                }
            }
            ListKind::List(ListName::Deny) => {
                for key in &keys {
                    ctx.account.block_contact(key);
                }
            }
            ListKind::Group { id: Some(id), .. } => {
                for key in &keys {
                    ctx.account.add_contact_to_group(id, key);
                }
            }
            ListKind::Group { id: None, name } => {
                if !self.group_requested {
                    ctx.account.add_group(name);
                    self.group_requested = true;
                }
                for key in keys {
                    if !self.queued.contains(&key) {
                        self.queued.push(key);
                    }
                }
            }
        }
        Ok(())
    }

    fn remove_members(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        handles: &[Handle],
        _message: &str,
    ) -> GatewayResult<()> {
        super::require_contacts(handles)?;
        Self::reject_self(ctx, handles)?;
        let keys = contact_keys(handles);
        match &self.kind {
            ListKind::List(ListName::Subscribe) => {
                for key in &keys {
                    ctx.account.delete_contact(key);
                }
            }
            ListKind::List(ListName::Publish) => {
                for (handle, key) in handles.iter().zip(&keys) {
                    match self.base.roster.placement(handle.id()) {
                        Some(Placement::LocalPending) => ctx.account.decline_contact_invitation(key),
                        Some(Placement::Member) => ctx.account.block_contact(key),
                        _ => warn!(channel = %self.base.id, contact = %key, "not on the publish list"),
                    }
                }
            }
            ListKind::List(ListName::Deny) => {
                for key in &keys {
                    ctx.account.unblock_contact(key);
                }
            }
            ListKind::Group { id: Some(id), .. } => {
                for key in &keys {
                    ctx.account.remove_contact_from_group(id, key);
                }
            }
            ListKind::Group { id: None, .. } => {
                self.queued.retain(|queued| !keys.contains(queued));
            }
        }
        Ok(())
    }
}
