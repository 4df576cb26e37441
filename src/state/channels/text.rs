//! Text conversation channels.
//!
//! A text channel is either addressed at one contact (`target` set) or is a
//! multi-party conference (`target` none). Either way it borrows at most one
//! live conversation from the account client:
//!
//! ```text
//!   NO_SESSION ──attach──▶ ATTACHED ──close──▶ CLOSED
//!        ▲                    │
//!        └──last peer left────┘  (or session stolen by a merge)
//! ```
//!
//! NO_SESSION is a degraded state: the next `send` reopens a session if the
//! peer is online, or falls back to an offline message.

use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use imgate_account::{ContactKey, ConversationId, Presence};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChannelBase, ChannelCtx, ChatStateful, GroupFlags, Groupable, MessagesCapable};
use crate::error::{GatewayError, GatewayResult};
use crate::state::handle::{Handle, HandleId};
use crate::state::roster::{ChangeReason, MembersDelta};
use crate::state::signal::Signal;
use crate::state::timers::{TimerEvent, TimerId};

/// Action text that sends a nudge instead of a message.
pub const NUDGE: &str = "nudge";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Normal,
    Action,
    Notice,
    AutoReply,
    DeliveryReport,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatState {
    Gone,
    Inactive,
    #[default]
    Active,
    Paused,
    Composing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    NoSession,
    Attached,
    Closed,
}

/// A received message waiting for acknowledgement.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PendingMessage {
    pub id: u32,
    pub timestamp: i64,
    pub sender: HandleId,
    pub kind: MessageKind,
    pub text: String,
    /// Delivered from the offline store rather than a live session.
    pub offline: bool,
    #[serde(skip)]
    pub offline_id: Option<String>,
}

enum Outgoing {
    Text,
    Nudge,
}

#[derive(Debug)]
pub struct TextChannel {
    pub(super) base: ChannelBase,
    conversation: Option<ConversationId>,
    /// Where a fresh session or an offline message goes while sessionless.
    fallback: Option<Handle>,
    recv_id: u32,
    pending: BTreeMap<u32, PendingMessage>,
    own_state: ChatState,
    remote_states: HashMap<HandleId, ChatState>,
    resend_timer: Option<TimerId>,
    idle_timers: HashMap<HandleId, TimerId>,
    sessionless_timer: Option<TimerId>,
}

impl TextChannel {
    /// Build a channel, optionally on top of an already-live conversation.
    /// Nothing is emitted until [`populate`](Self::populate).
    pub fn new(base: ChannelBase, conversation: Option<ConversationId>) -> Self {
        let fallback = base.target.clone();
        Self {
            base,
            conversation,
            fallback,
            recv_id: 0,
            pending: BTreeMap::new(),
            own_state: ChatState::Active,
            remote_states: HashMap::new(),
            resend_timer: None,
            idle_timers: HashMap::new(),
            sessionless_timer: None,
        }
    }

    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation
    }

    pub fn state(&self) -> SessionState {
        if self.base.is_closed() {
            SessionState::Closed
        } else if self.conversation.is_some() {
            SessionState::Attached
        } else {
            SessionState::NoSession
        }
    }

    pub fn is_one_to_one(&self) -> bool {
        self.base.target.is_some()
    }

    pub(super) fn populate(&mut self, ctx: &mut ChannelCtx<'_>) {
        let mut delta = MembersDelta::new().add(ctx.self_handle());
        match self.conversation {
            Some(conv) => {
                ctx.routes.bind_conversation(conv, self.base.id);
                delta = delta.add_all(participants(ctx, conv));
            }
            None => {
                if let Some(target) = self.base.target.clone() {
                    delta = delta.add(target);
                }
                if !self.is_one_to_one() {
                    self.schedule_sessionless(ctx);
                }
            }
        }
        if let Some(initiator) = self.base.initiator.clone() {
            delta = delta.actor(initiator);
        }
        self.base.apply(ctx, delta);
    }

    /// Attach `conversation`, leaving any different session held before.
    pub fn attach(&mut self, ctx: &mut ChannelCtx<'_>, conversation: ConversationId) {
        if self.conversation == Some(conversation) {
            return;
        }
        if let Some(old) = self.conversation.take() {
            debug!(channel = %self.base.id, conversation = %old, "leaving replaced session");
            ctx.routes.unbind_conversation(old);
            ctx.account.leave_conversation(old);
        }
        self.conversation = Some(conversation);
        ctx.routes.bind_conversation(conversation, self.base.id);
        if let Some(timer) = self.sessionless_timer.take() {
            ctx.timers.cancel(timer);
        }
        let joined = participants(ctx, conversation);
        self.base.apply(ctx, MembersDelta::new().add_all(joined));
    }

    /// Record contacts the local user brought into a conference.
    pub fn invited(&mut self, ctx: &mut ChannelCtx<'_>, invitees: Vec<Handle>) {
        let delta = MembersDelta::new()
            .add_all(invitees)
            .actor(ctx.self_handle())
            .reason(ChangeReason::Invited);
        self.base.apply(ctx, delta);
    }

    /// Give up the session without leaving it, so another channel can
    /// take it over. Routing stops before this returns.
    pub fn detach(&mut self, ctx: &mut ChannelCtx<'_>) -> Option<ConversationId> {
        let conversation = self.conversation.take()?;
        ctx.routes.unbind_conversation(conversation);
        self.reset_typing(ctx);
        if !self.is_one_to_one() {
            let me = ctx.self_handle();
            let others: Vec<Handle> = self
                .base
                .roster
                .members()
                .filter(|h| **h != me)
                .cloned()
                .collect();
            self.fallback = match others.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            };
            self.schedule_sessionless(ctx);
        }
        debug!(channel = %self.base.id, conversation = %conversation, "session detached");
        Some(conversation)
    }

    /// Leave the attached session for good.
    pub(super) fn release_session(&mut self, ctx: &mut ChannelCtx<'_>) {
        self.reset_typing(ctx);
        if let Some(conversation) = self.conversation.take() {
            ctx.routes.unbind_conversation(conversation);
            ctx.account.leave_conversation(conversation);
        }
    }

    fn schedule_sessionless(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.sessionless_timer.is_none() {
            let at = ctx.now + ctx.settings.sessionless_timeout;
            self.sessionless_timer = Some(ctx.timers.schedule(
                at,
                TimerEvent::SessionlessChannel {
                    channel: self.base.id,
                },
            ));
        }
    }

    fn reset_typing(&mut self, ctx: &mut ChannelCtx<'_>) {
        if let Some(timer) = self.resend_timer.take() {
            ctx.timers.cancel(timer);
        }
        for (_, timer) in self.idle_timers.drain() {
            ctx.timers.cancel(timer);
        }
        self.remote_states.clear();
    }

    /// Open a session towards the fallback contact if it is online.
    fn try_open_session(&mut self, ctx: &mut ChannelCtx<'_>) -> bool {
        let Some(key) = self.fallback.as_ref().and_then(Handle::contact_key).cloned() else {
            return false;
        };
        let online = ctx
            .account
            .contact(&key)
            .is_some_and(|c| c.presence != Presence::Offline);
        if !online {
            return false;
        }
        let conversation = ctx.account.create_conversation(std::slice::from_ref(&key));
        debug!(channel = %self.base.id, conversation = %conversation, "session opened");
        self.attach(ctx, conversation);
        true
    }

    fn set_remote_state(&mut self, ctx: &mut ChannelCtx<'_>, contact: &Handle, state: ChatState) {
        let previous = self
            .remote_states
            .insert(contact.id(), state)
            .unwrap_or_default();
        if previous != state {
            ctx.emit(Signal::ChatStateChanged {
                channel: self.base.id,
                contact: contact.id(),
                state,
            });
        }
    }

    pub fn user_joined(&mut self, ctx: &mut ChannelCtx<'_>, contact: &ContactKey) {
        let handle = ctx.handles.contact(contact);
        if ctx.handles.is_self(&handle) {
            return;
        }
        if let Some(timer) = self.sessionless_timer.take() {
            ctx.timers.cancel(timer);
        }
        let delta = MembersDelta::new().add(handle.clone()).actor(handle);
        self.base.apply(ctx, delta);
    }

    pub fn user_left(&mut self, ctx: &mut ChannelCtx<'_>, contact: &ContactKey) {
        let handle = ctx.handles.contact(contact);
        if ctx.handles.is_self(&handle) {
            return;
        }
        if let Some(timer) = self.idle_timers.remove(&handle.id()) {
            ctx.timers.cancel(timer);
        }
        let me = ctx.self_handle();
        let others: Vec<Handle> = self
            .base
            .roster
            .members()
            .filter(|h| **h != me)
            .cloned()
            .collect();
        if others.len() == 1 && others[0] == handle {
            // Last peer gone: the session is dead but the channel stays
            // addressed at that contact.
            self.set_remote_state(ctx, &handle, ChatState::Gone);
            self.detach(ctx);
            self.fallback = Some(handle);
            return;
        }
        self.remote_states.remove(&handle.id());
        let delta = MembersDelta::new().remove(handle.clone()).actor(handle);
        self.base.apply(ctx, delta);
    }

    pub fn user_typing(&mut self, ctx: &mut ChannelCtx<'_>, contact: &ContactKey) {
        let handle = ctx.handles.contact(contact);
        self.set_remote_state(ctx, &handle, ChatState::Composing);
        if let Some(timer) = self.idle_timers.remove(&handle.id()) {
            ctx.timers.cancel(timer);
        }
        let timer = ctx.timers.schedule(
            ctx.now + ctx.settings.typing_idle,
            TimerEvent::TypingStopped {
                channel: self.base.id,
                contact: handle.id(),
            },
        );
        self.idle_timers.insert(handle.id(), timer);
    }

    /// Queue an inbound message and announce it. Returns its pending id.
    pub fn message_received(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        sender: &Handle,
        kind: MessageKind,
        text: &str,
        timestamp: i64,
        offline_id: Option<String>,
    ) -> u32 {
        if let Some(timer) = self.idle_timers.remove(&sender.id()) {
            ctx.timers.cancel(timer);
        }
        if self.remote_states.get(&sender.id()) == Some(&ChatState::Composing) {
            self.set_remote_state(ctx, sender, ChatState::Active);
        }
        let id = self.recv_id;
        self.recv_id = self.recv_id.wrapping_add(1);
        let message = PendingMessage {
            id,
            timestamp,
            sender: sender.id(),
            kind,
            text: text.to_string(),
            offline: offline_id.is_some(),
            offline_id,
        };
        self.pending.insert(id, message.clone());
        ctx.emit(Signal::Received {
            channel: self.base.id,
            message,
        });
        id
    }

    pub fn nudge_received(&mut self, ctx: &mut ChannelCtx<'_>, sender: &Handle) -> u32 {
        let now = Utc::now().timestamp();
        self.message_received(ctx, sender, MessageKind::Action, NUDGE, now, None)
    }

    pub(super) fn on_timer(&mut self, ctx: &mut ChannelCtx<'_>, event: &TimerEvent) {
        match *event {
            TimerEvent::TypingResend { .. } => {
                self.resend_timer = None;
                if self.own_state != ChatState::Composing {
                    return;
                }
                if let Some(conversation) = self.conversation {
                    ctx.account.send_typing(conversation);
                }
                self.schedule_resend(ctx);
            }
            TimerEvent::TypingStopped { contact, .. } => {
                self.idle_timers.remove(&contact);
                if self.remote_states.get(&contact) == Some(&ChatState::Composing) {
                    self.remote_states.insert(contact, ChatState::Paused);
                    ctx.emit(Signal::ChatStateChanged {
                        channel: self.base.id,
                        contact,
                        state: ChatState::Paused,
                    });
                }
            }
            TimerEvent::SessionlessChannel { .. } => {
                self.sessionless_timer = None;
                if self.conversation.is_none() {
                    debug!(channel = %self.base.id, "closing conference without a session");
                    ctx.routes.request_close(self.base.id);
                }
            }
        }
    }

    fn schedule_resend(&mut self, ctx: &mut ChannelCtx<'_>) {
        let at = ctx.now + ctx.settings.typing_resend;
        self.resend_timer = Some(ctx.timers.schedule(
            at,
            TimerEvent::TypingResend {
                channel: self.base.id,
            },
        ));
    }
}

fn participants(ctx: &mut ChannelCtx<'_>, conversation: ConversationId) -> Vec<Handle> {
    let mut handles = Vec::new();
    for key in ctx.account.conversation_participants(conversation) {
        let handle = ctx.handles.contact(&key);
        if !ctx.handles.is_self(&handle) {
            handles.push(handle);
        }
    }
    handles
}

impl MessagesCapable for TextChannel {
    fn send(&mut self, ctx: &mut ChannelCtx<'_>, kind: MessageKind, text: &str) -> GatewayResult<()> {
        let outgoing = match kind {
            MessageKind::Normal => Outgoing::Text,
            MessageKind::Action if text == NUDGE => Outgoing::Nudge,
            other => {
                return Err(GatewayError::unimplemented(format!(
                    "{other:?} messages are not supported"
                )));
            }
        };
        if self.conversation.is_none() {
            self.try_open_session(ctx);
        }
        match (self.conversation, outgoing) {
            (Some(conversation), Outgoing::Text) => ctx.account.send_text(conversation, text),
            (Some(conversation), Outgoing::Nudge) => ctx.account.send_nudge(conversation),
            (None, outgoing) => {
                let Some(key) = self.fallback.as_ref().and_then(Handle::contact_key) else {
                    return Err(GatewayError::not_available("conversation has no session"));
                };
                if matches!(outgoing, Outgoing::Nudge) {
                    return Err(GatewayError::unimplemented("nudges cannot be sent offline"));
                }
                debug!(channel = %self.base.id, recipient = %key, "sending offline message");
                ctx.account.send_offline_message(key, text);
            }
        }
        ctx.emit(Signal::Sent {
            channel: self.base.id,
            timestamp: Utc::now().timestamp(),
            kind,
            text: text.to_string(),
        });
        Ok(())
    }

    fn acknowledge_pending(&mut self, ctx: &mut ChannelCtx<'_>, ids: &[u32]) -> GatewayResult<()> {
        if let Some(unknown) = ids.iter().find(|id| !self.pending.contains_key(id)) {
            return Err(GatewayError::invalid_argument(format!(
                "message {unknown} is not pending"
            )));
        }
        let offline: Vec<String> = ids
            .iter()
            .filter_map(|id| self.pending.remove(id))
            .filter_map(|m| m.offline_id)
            .collect();
        if !offline.is_empty() {
            ctx.account.delete_offline_messages(&offline);
        }
        Ok(())
    }

    fn list_pending(&mut self, ctx: &mut ChannelCtx<'_>, clear: bool) -> Vec<PendingMessage> {
        let listed: Vec<PendingMessage> = self.pending.values().cloned().collect();
        if clear {
            let ids: Vec<u32> = listed.iter().map(|m| m.id).collect();
            if let Err(err) = self.acknowledge_pending(ctx, &ids) {
                warn!(channel = %self.base.id, error = %err, "clearing pending messages failed");
            }
        }
        listed
    }
}

impl ChatStateful for TextChannel {
    fn set_chat_state(&mut self, ctx: &mut ChannelCtx<'_>, state: ChatState) -> GatewayResult<()> {
        if state == ChatState::Gone {
            return Err(GatewayError::invalid_argument(
                "gone is implied by closing the channel",
            ));
        }
        let previous = std::mem::replace(&mut self.own_state, state);
        if state == ChatState::Composing {
            if let Some(conversation) = self.conversation {
                ctx.account.send_typing(conversation);
            }
            if self.resend_timer.is_none() {
                self.schedule_resend(ctx);
            }
        } else if let Some(timer) = self.resend_timer.take() {
            ctx.timers.cancel(timer);
        }
        if previous != state {
            let me = ctx.self_handle().id();
            ctx.emit(Signal::ChatStateChanged {
                channel: self.base.id,
                contact: me,
                state,
            });
        }
        Ok(())
    }
}

impl Groupable for TextChannel {
    fn base(&self) -> &ChannelBase {
        &self.base
    }

    fn group_flags(&self) -> GroupFlags {
        if self.is_one_to_one() {
            GroupFlags::CAN_REMOVE
        } else {
            GroupFlags::CAN_ADD | GroupFlags::CAN_REMOVE
        }
    }

    fn add_members(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        handles: &[Handle],
        message: &str,
    ) -> GatewayResult<()> {
        if self.is_one_to_one() {
            return Err(GatewayError::permission_denied(
                "cannot invite into a one-to-one channel",
            ));
        }
        super::require_contacts(handles)?;
        let Some(conversation) = self.conversation else {
            return Err(GatewayError::not_available("conversation has no session"));
        };
        let me = ctx.self_handle();
        let invitees: Vec<Handle> = handles
            .iter()
            .filter(|h| **h != me && !self.base.roster.is_member(h.id()))
            .cloned()
            .collect();
        for invitee in &invitees {
            if let Some(key) = invitee.contact_key() {
                ctx.account.invite_user(conversation, key);
            }
        }
        let delta = MembersDelta::new()
            .add_all(invitees)
            .actor(me)
            .reason(ChangeReason::Invited)
            .message(message);
        self.base.apply(ctx, delta);
        Ok(())
    }

    fn remove_members(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        handles: &[Handle],
        _message: &str,
    ) -> GatewayResult<()> {
        let me = ctx.self_handle();
        if handles.iter().any(|h| *h != me) {
            return Err(GatewayError::permission_denied(
                "only the local user can be removed from a text channel",
            ));
        }
        if !handles.is_empty() {
            ctx.routes.request_close(self.base.id);
        }
        Ok(())
    }
}
