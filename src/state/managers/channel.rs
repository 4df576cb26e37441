//! Channel table and dispatcher.
//!
//! The `ChannelManager` owns every live channel of one connection. It is
//! responsible for:
//! - Building channels from classified requests and inbound sessions.
//! - Keeping at most one channel per identity (one text channel per contact,
//!   one list channel per list or group handle, one outgoing call per peer).
//! - Moving conversations between channels (merge and split).
//! - Closing channels, including the ones that asked to be closed while
//!   handling an event.

use std::collections::{BTreeMap, HashMap};

use imgate_account::{CallId, ContactKey, ConversationId, GroupId, Presence, TransferInfo};
use tracing::{debug, info};

use super::request::ChannelRequest;
use crate::error::{GatewayError, GatewayResult};
use crate::state::channels::{
    Channel, ChannelBase, ChannelCtx, ChannelId, ChannelKind, ChannelSummary,
    ContactListChannel, FileTransferChannel, ListKind, MediaChannel, TextChannel,
};
use crate::state::handle::{Handle, HandleId};
use crate::state::signal::Signal;

/// What makes two requests equivalent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Identity {
    ContactList(HandleId),
    Text(HandleId),
    Media(HandleId),
}

pub struct ChannelManager {
    path_prefix: String,
    next_id: u64,
    channels: BTreeMap<ChannelId, Channel>,
    identities: HashMap<Identity, ChannelId>,
}

impl ChannelManager {
    pub fn new(path_prefix: impl Into<String>) -> Self {
        Self {
            path_prefix: path_prefix.into(),
            next_id: 1,
            channels: BTreeMap::new(),
            identities: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn get(&self, id: ChannelId) -> GatewayResult<&Channel> {
        self.channels
            .get(&id)
            .ok_or_else(|| GatewayError::invalid_argument(format!("no channel {id}")))
    }

    pub fn get_mut(&mut self, id: ChannelId) -> GatewayResult<&mut Channel> {
        self.channels
            .get_mut(&id)
            .ok_or_else(|| GatewayError::invalid_argument(format!("no channel {id}")))
    }

    pub fn summaries(&self) -> Vec<ChannelSummary> {
        self.channels.values().map(Channel::summary).collect()
    }

    pub fn ids(&self) -> Vec<ChannelId> {
        self.channels.keys().copied().collect()
    }

    pub fn list_channel_ids(&self) -> Vec<ChannelId> {
        self.channels
            .iter()
            .filter(|(_, c)| c.kind() == ChannelKind::ContactList)
            .map(|(id, _)| *id)
            .collect()
    }

    /// The 1:1 text channel addressed at `contact`, if one is open.
    pub fn text_channel_for(&self, contact: HandleId) -> Option<ChannelId> {
        self.identities.get(&Identity::Text(contact)).copied()
    }

    pub fn group_channel(&self, group: &GroupId) -> Option<ChannelId> {
        self.channels.iter().find_map(|(id, channel)| match channel {
            Channel::List(list) if list.group_id() == Some(group) => Some(*id),
            _ => None,
        })
    }

    fn allocate(
        &mut self,
        kind: ChannelKind,
        target: Option<Handle>,
        initiator: Option<Handle>,
        requested: bool,
    ) -> ChannelBase {
        let id = ChannelId(self.next_id);
        self.next_id += 1;
        let path = format!("{}/{}{}", self.path_prefix, kind.as_str(), id);
        ChannelBase::new(id, kind, path, target, initiator, requested)
    }

    /// Register, announce, then populate. Observers always see
    /// `NewChannels` before anything the channel emits.
    fn insert(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        channel: Channel,
        identity: Option<Identity>,
    ) -> ChannelId {
        let id = channel.id();
        let summary = channel.summary();
        info!(
            channel = %id,
            kind = summary.kind.as_str(),
            target = %summary.target_id,
            requested = summary.requested,
            "channel created"
        );
        self.channels.insert(id, channel);
        if let Some(identity) = identity {
            self.identities.insert(identity, id);
        }
        ctx.emit(Signal::NewChannels(vec![summary]));
        if let Some(channel) = self.channels.get_mut(&id) {
            channel.populate(ctx);
        }
        id
    }

    /// Return the live channel equivalent to `request`, or build one.
    /// The flag is true when the channel was created by this call.
    pub fn ensure(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        request: ChannelRequest,
        requested: bool,
    ) -> GatewayResult<(bool, ChannelId)> {
        let me = ctx.self_handle();
        let initiator = requested.then(|| me.clone());
        match request {
            ChannelRequest::List(handle) => {
                let identity = Identity::ContactList(handle.id());
                if let Some(id) = self.identities.get(&identity) {
                    return Ok((false, *id));
                }
                let kind = match handle.list_name() {
                    Some(list) => ListKind::List(list),
                    None => {
                        let existing = ctx
                            .account
                            .groups()
                            .into_iter()
                            .find(|g| g.name.eq_ignore_ascii_case(handle.name()));
                        ListKind::Group {
                            id: existing.map(|g| g.id),
                            name: handle.name().to_string(),
                        }
                    }
                };
                let base = self.allocate(ChannelKind::ContactList, Some(handle), initiator, requested);
                let channel = Channel::List(ContactListChannel::new(base, kind));
                Ok((true, self.insert(ctx, channel, Some(identity))))
            }
            ChannelRequest::Text(contact) => {
                reject_self(&me, &contact)?;
                let identity = Identity::Text(contact.id());
                if let Some(id) = self.identities.get(&identity) {
                    return Ok((false, *id));
                }
                let base = self.allocate(ChannelKind::Text, Some(contact), initiator, requested);
                let channel = Channel::Text(TextChannel::new(base, None));
                Ok((true, self.insert(ctx, channel, Some(identity))))
            }
            ChannelRequest::Conference { donors, invitees } => {
                let id = self.merge(ctx, &donors, &invitees, requested)?;
                Ok((true, id))
            }
            ChannelRequest::Media { peer, initial } => {
                reject_self(&me, &peer)?;
                let identity = Identity::Media(peer.id());
                if let Some(id) = self.identities.get(&identity) {
                    return Ok((false, *id));
                }
                require_online(ctx, &peer)?;
                let base = self.allocate(
                    ChannelKind::StreamedMedia,
                    Some(peer.clone()),
                    initiator,
                    requested,
                );
                let channel = Channel::Media(MediaChannel::outgoing(base, peer, initial));
                Ok((true, self.insert(ctx, channel, Some(identity))))
            }
            ChannelRequest::FileTransfer {
                peer,
                filename,
                size,
                content_type,
                description,
            } => {
                reject_self(&me, &peer)?;
                require_online(ctx, &peer)?;
                let key = peer
                    .contact_key()
                    .cloned()
                    .ok_or_else(|| GatewayError::InvalidHandle(peer.to_string()))?;
                let transfer = ctx.account.send_file(&key, &filename, size);
                let info = TransferInfo {
                    id: transfer,
                    peer: key,
                    filename,
                    size,
                    incoming: false,
                };
                let base = self.allocate(
                    ChannelKind::FileTransfer,
                    Some(peer.clone()),
                    initiator,
                    requested,
                );
                let channel = Channel::Transfer(FileTransferChannel::new(
                    base,
                    peer,
                    &info,
                    content_type,
                    description,
                ));
                Ok((true, self.insert(ctx, channel, None)))
            }
        }
    }

    /// Build a conference from the sessions of `donors` plus `invitees`.
    ///
    /// The first donor with a live session gives it up to the new channel;
    /// other donor sessions are left. Every donor ends up without a session
    /// before the conference exists.
    fn merge(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        donors: &[ChannelId],
        invitees: &[Handle],
        requested: bool,
    ) -> GatewayResult<ChannelId> {
        crate::state::channels::require_contacts(invitees)?;
        for id in donors {
            if self.channels.get(id).and_then(Channel::as_text).is_none() {
                return Err(GatewayError::invalid_argument(format!(
                    "initial channel {id} is not a text channel"
                )));
            }
        }

        let me = ctx.self_handle();
        let mut participants: Vec<Handle> = Vec::new();
        let donor_members = donors
            .iter()
            .filter_map(|id| self.channels.get(id))
            .flat_map(|channel| channel.base().roster.members().cloned().collect::<Vec<_>>());
        for handle in donor_members.chain(invitees.iter().cloned()) {
            if handle != me && !participants.contains(&handle) {
                participants.push(handle);
            }
        }

        let mut conversation = None;
        for id in donors {
            let Some(text) = self.channels.get_mut(id).and_then(Channel::as_text_mut) else {
                continue;
            };
            let Some(stolen) = text.detach(ctx) else {
                continue;
            };
            if conversation.is_none() {
                debug!(donor = %id, conversation = %stolen, "session stolen for conference");
                conversation = Some(stolen);
            } else {
                ctx.account.leave_conversation(stolen);
            }
        }

        let keys: Vec<ContactKey> = participants
            .iter()
            .filter_map(Handle::contact_key)
            .cloned()
            .collect();
        let conversation = match conversation {
            Some(conversation) => {
                let present = ctx.account.conversation_participants(conversation);
                for key in keys.iter().filter(|k| !present.contains(k)) {
                    ctx.account.invite_user(conversation, key);
                }
                Some(conversation)
            }
            None if !keys.is_empty() => Some(ctx.account.create_conversation(&keys)),
            None => None,
        };

        let base = self.allocate(ChannelKind::Text, None, Some(me), requested);
        let id = self.insert(ctx, Channel::Text(TextChannel::new(base, conversation)), None);
        if let Some(text) = self.channels.get_mut(&id).and_then(Channel::as_text_mut) {
            text.invited(ctx, participants);
        }
        Ok(id)
    }

    /// The channel an inbound conversation belongs to, created on demand.
    ///
    /// A conversation with a single peer goes to that peer's text channel,
    /// replacing whatever session it had.
    pub fn channel_for_conversation(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        conversation: ConversationId,
        initiator: &Handle,
    ) -> ChannelId {
        if let Some(id) = ctx.routes.conversation(conversation) {
            return id;
        }
        let mut peers = Vec::new();
        for key in ctx.account.conversation_participants(conversation) {
            let handle = ctx.handles.contact(&key);
            if !ctx.handles.is_self(&handle) && !peers.contains(&handle) {
                peers.push(handle);
            }
        }
        if peers.len() > 1 {
            let base = self.allocate(ChannelKind::Text, None, Some(initiator.clone()), false);
            let channel = Channel::Text(TextChannel::new(base, Some(conversation)));
            return self.insert(ctx, channel, None);
        }

        let peer = peers.pop().unwrap_or_else(|| initiator.clone());
        let identity = Identity::Text(peer.id());
        if let Some(id) = self.identities.get(&identity).copied()
            && let Some(text) = self.channels.get_mut(&id).and_then(Channel::as_text_mut)
        {
            text.attach(ctx, conversation);
            return id;
        }
        let base = self.allocate(ChannelKind::Text, Some(peer), Some(initiator.clone()), false);
        let channel = Channel::Text(TextChannel::new(base, Some(conversation)));
        self.insert(ctx, channel, Some(identity))
    }

    /// Move the session of 1:1 channel `from` to a new conference because
    /// `joiner` entered it. `from` is left addressed at its own peer.
    pub fn split(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        from: ChannelId,
        joiner: &Handle,
    ) -> Option<ChannelId> {
        let text = self.channels.get_mut(&from).and_then(Channel::as_text_mut)?;
        let conversation = text.detach(ctx)?;
        debug!(from = %from, conversation = %conversation, joiner = %joiner, "splitting conversation");
        let base = self.allocate(ChannelKind::Text, None, Some(joiner.clone()), false);
        let channel = Channel::Text(TextChannel::new(base, Some(conversation)));
        Some(self.insert(ctx, channel, None))
    }

    pub fn incoming_call(&mut self, ctx: &mut ChannelCtx<'_>, call: CallId, peer: Handle) -> ChannelId {
        let base = self.allocate(
            ChannelKind::StreamedMedia,
            Some(peer.clone()),
            Some(peer.clone()),
            false,
        );
        // A live media channel to the same peer keeps its identity.
        let identity = Identity::Media(peer.id());
        let identity = (!self.identities.contains_key(&identity)).then_some(identity);
        let channel = Channel::Media(MediaChannel::incoming(base, peer, call));
        self.insert(ctx, channel, identity)
    }

    pub fn incoming_transfer(&mut self, ctx: &mut ChannelCtx<'_>, info: &TransferInfo) -> ChannelId {
        let peer = ctx.handles.contact(&info.peer);
        let base = self.allocate(
            ChannelKind::FileTransfer,
            Some(peer.clone()),
            Some(peer.clone()),
            false,
        );
        let channel = Channel::Transfer(FileTransferChannel::new(
            base,
            peer,
            info,
            "application/octet-stream".to_string(),
            String::new(),
        ));
        self.insert(ctx, channel, None)
    }

    /// Close one channel. The channel leaves the table in the same turn it
    /// emits `Closed`, so a later equivalent request builds a new one.
    /// Closing an id that was already closed is a no-op.
    pub fn close(&mut self, ctx: &mut ChannelCtx<'_>, id: ChannelId) -> GatewayResult<()> {
        let Some(mut channel) = self.channels.remove(&id) else {
            if id.0 >= 1 && id.0 < self.next_id {
                return Ok(());
            }
            return Err(GatewayError::invalid_argument(format!("no channel {id}")));
        };
        self.identities.retain(|_, owner| *owner != id);
        channel.close(ctx);
        info!(channel = %id, kind = channel.kind().as_str(), "channel closed");
        Ok(())
    }

    /// Close every channel that asked for it while handling the last event.
    pub fn reap(&mut self, ctx: &mut ChannelCtx<'_>) {
        loop {
            let closing = ctx.routes.take_closing();
            if closing.is_empty() {
                break;
            }
            for id in closing {
                if let Err(err) = self.close(ctx, id) {
                    debug!(channel = %id, error = %err, "reaping unknown channel");
                }
            }
        }
    }

    /// Close everything and forget every route.
    pub fn close_all(&mut self, ctx: &mut ChannelCtx<'_>) {
        for id in self.ids() {
            if let Err(err) = self.close(ctx, id) {
                debug!(channel = %id, error = %err, "channel vanished during teardown");
            }
        }
        self.identities.clear();
        ctx.routes.clear();
    }
}

fn reject_self(me: &Handle, target: &Handle) -> GatewayResult<()> {
    if me == target {
        return Err(GatewayError::invalid_argument(
            "cannot open a channel to the local user",
        ));
    }
    Ok(())
}

fn require_online(ctx: &ChannelCtx<'_>, peer: &Handle) -> GatewayResult<()> {
    let online = ctx
        .contact(peer)
        .is_some_and(|contact| contact.presence != Presence::Offline);
    if online {
        Ok(())
    } else {
        Err(GatewayError::not_available(format!("{} is offline", peer.name())))
    }
}
