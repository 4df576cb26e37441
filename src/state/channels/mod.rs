//! Channels: typed communication contexts with a membership roster.
//!
//! # Architecture
//!
//! - **Arena ownership**: channels live in the [`ChannelManager`]'s table
//!   and never point back at the connection. Every operation receives a
//!   [`ChannelCtx`] carrying the account client, handle registry, outbox,
//!   timers and session routes for the duration of the call.
//! - **Closed set of kinds**: [`Channel`] is an enum over the four channel
//!   structs. Cross-cutting behaviour goes through the capability traits
//!   [`Groupable`], [`MessagesCapable`] and [`ChatStateful`].
//! - **Sessions by id**: conversations, calls and transfers are owned by
//!   the account client. A channel stores the id and registers it in
//!   [`Routes`] so inbound events find their way back.
//!
//! [`ChannelManager`]: crate::state::managers::ChannelManager

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use imgate_account::{AccountClient, CallId, Contact, ConversationId, TransferId};
use serde::{Deserialize, Serialize};

use crate::config::TimersConfig;
use crate::error::{GatewayError, GatewayResult};
use crate::state::handle::{Handle, HandleId, HandleRegistry, HandleType};
use crate::state::roster::{MembersDelta, Roster};
use crate::state::signal::{Outbox, Signal};
use crate::state::timers::{TimerEvent, TimerQueue};

pub mod contact_list;
pub mod media;
pub mod text;
pub mod transfer;

pub use contact_list::{ContactListChannel, ListKind};
pub use media::MediaChannel;
pub use text::TextChannel;
pub use transfer::FileTransferChannel;

/// Channel identity. Ids are never reused within a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    ContactList,
    Text,
    StreamedMedia,
    FileTransfer,
}

impl ChannelKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ContactList => "contact_list",
            Self::Text => "text",
            Self::StreamedMedia => "streamed_media",
            Self::FileTransfer => "file_transfer",
        }
    }
}

impl FromStr for ChannelKind {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "contact_list" => Ok(Self::ContactList),
            "text" => Ok(Self::Text),
            "streamed_media" => Ok(Self::StreamedMedia),
            "file_transfer" => Ok(Self::FileTransfer),
            other => Err(GatewayError::unimplemented(format!(
                "unknown channel type '{other}'"
            ))),
        }
    }
}

/// Which membership operations a channel accepts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct GroupFlags(u32);

impl GroupFlags {
    pub const NONE: Self = Self(0);
    pub const CAN_ADD: Self = Self(1);
    pub const CAN_REMOVE: Self = Self(2);
    pub const CAN_RESCIND: Self = Self(4);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for GroupFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What `get_channels` and `NewChannels` report about a channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelSummary {
    pub id: ChannelId,
    pub path: String,
    pub kind: ChannelKind,
    pub target_type: HandleType,
    pub target: HandleId,
    pub target_id: String,
    pub requested: bool,
    pub initiator: HandleId,
}

/// Roster view returned by `get_members`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct MembersSnapshot {
    pub members: Vec<HandleId>,
    pub local_pending: Vec<HandleId>,
    pub remote_pending: Vec<HandleId>,
    pub self_handle: HandleId,
    pub flags: GroupFlags,
}

/// Timer intervals channels work with.
#[derive(Clone, Debug)]
pub struct ChannelSettings {
    pub typing_resend: Duration,
    pub typing_idle: Duration,
    pub sessionless_timeout: Duration,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::from(&TimersConfig::default())
    }
}

impl From<&TimersConfig> for ChannelSettings {
    fn from(timers: &TimersConfig) -> Self {
        Self {
            typing_resend: timers.typing_resend(),
            typing_idle: timers.typing_idle(),
            sessionless_timeout: timers.empty_channel(),
        }
    }
}

/// Maps account-side sessions to the channel they are attached to.
#[derive(Debug, Default)]
pub struct Routes {
    conversations: HashMap<ConversationId, ChannelId>,
    calls: HashMap<CallId, ChannelId>,
    transfers: HashMap<TransferId, ChannelId>,
    closing: Vec<ChannelId>,
}

impl Routes {
    pub fn bind_conversation(&mut self, conversation: ConversationId, channel: ChannelId) {
        self.conversations.insert(conversation, channel);
    }

    pub fn unbind_conversation(&mut self, conversation: ConversationId) {
        self.conversations.remove(&conversation);
    }

    pub fn conversation(&self, conversation: ConversationId) -> Option<ChannelId> {
        self.conversations.get(&conversation).copied()
    }

    pub fn bind_call(&mut self, call: CallId, channel: ChannelId) {
        self.calls.insert(call, channel);
    }

    pub fn call(&self, call: CallId) -> Option<ChannelId> {
        self.calls.get(&call).copied()
    }

    pub fn bind_transfer(&mut self, transfer: TransferId, channel: ChannelId) {
        self.transfers.insert(transfer, channel);
    }

    pub fn transfer(&self, transfer: TransferId) -> Option<ChannelId> {
        self.transfers.get(&transfer).copied()
    }

    /// Forget every session routed to `channel`.
    pub fn unbind_channel(&mut self, channel: ChannelId) {
        self.conversations.retain(|_, c| *c != channel);
        self.calls.retain(|_, c| *c != channel);
        self.transfers.retain(|_, c| *c != channel);
    }

    /// Ask for `channel` to be closed once the current operation returns.
    pub fn request_close(&mut self, channel: ChannelId) {
        if !self.closing.contains(&channel) {
            self.closing.push(channel);
        }
    }

    pub fn take_closing(&mut self) -> Vec<ChannelId> {
        std::mem::take(&mut self.closing)
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.calls.clear();
        self.transfers.clear();
        self.closing.clear();
    }
}

/// Connection services lent to a channel for one operation.
pub struct ChannelCtx<'a> {
    pub account: &'a mut dyn AccountClient,
    pub handles: &'a mut HandleRegistry,
    pub outbox: &'a mut Outbox,
    pub timers: &'a mut TimerQueue,
    pub routes: &'a mut Routes,
    pub settings: &'a ChannelSettings,
    pub now: Instant,
}

impl ChannelCtx<'_> {
    pub fn self_handle(&self) -> Handle {
        self.handles.self_handle()
    }

    pub fn emit(&mut self, signal: Signal) {
        self.outbox.push(signal);
    }

    /// Address-book snapshot of a contact handle.
    pub fn contact(&self, handle: &Handle) -> Option<Contact> {
        handle.contact_key().and_then(|key| self.account.contact(key))
    }
}

/// State every channel kind shares.
#[derive(Debug)]
pub struct ChannelBase {
    pub id: ChannelId,
    pub kind: ChannelKind,
    pub path: String,
    pub target: Option<Handle>,
    pub initiator: Option<Handle>,
    pub requested: bool,
    pub roster: Roster,
    closed: bool,
}

impl ChannelBase {
    pub fn new(
        id: ChannelId,
        kind: ChannelKind,
        path: String,
        target: Option<Handle>,
        initiator: Option<Handle>,
        requested: bool,
    ) -> Self {
        Self {
            id,
            kind,
            path,
            target,
            initiator,
            requested,
            roster: Roster::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Apply a roster delta, emitting `MembersChanged` if anything moved.
    pub fn apply(&mut self, ctx: &mut ChannelCtx<'_>, delta: MembersDelta) -> bool {
        let change = self.roster.apply(delta);
        if change.is_empty() {
            return false;
        }
        ctx.emit(Signal::MembersChanged {
            channel: self.id,
            change,
        });
        true
    }

    /// Apply the construction-time delta; always emitted, even when empty.
    pub fn apply_initial(&mut self, ctx: &mut ChannelCtx<'_>, delta: MembersDelta) {
        let change = self.roster.apply(delta);
        ctx.emit(Signal::MembersChanged {
            channel: self.id,
            change,
        });
    }

    /// Mark closed and emit `Closed`. Returns false if already closed.
    pub fn mark_closed(&mut self, ctx: &mut ChannelCtx<'_>) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        ctx.emit(Signal::Closed { channel: self.id });
        true
    }

    pub fn summary(&self) -> ChannelSummary {
        ChannelSummary {
            id: self.id,
            path: self.path.clone(),
            kind: self.kind,
            target_type: self
                .target
                .as_ref()
                .map_or(HandleType::None, Handle::handle_type),
            target: self.target.as_ref().map_or(HandleId::NONE, Handle::id),
            target_id: self
                .target
                .as_ref()
                .map(|t| t.name().to_string())
                .unwrap_or_default(),
            requested: self.requested,
            initiator: self.initiator.as_ref().map_or(HandleId::NONE, Handle::id),
        }
    }

    fn snapshot(&self, self_handle: HandleId, flags: GroupFlags) -> MembersSnapshot {
        MembersSnapshot {
            members: self.roster.member_ids(),
            local_pending: self.roster.local_pending_ids(),
            remote_pending: self.roster.remote_pending_ids(),
            self_handle,
            flags,
        }
    }
}

/// Membership operations.
pub trait Groupable {
    fn base(&self) -> &ChannelBase;

    fn group_flags(&self) -> GroupFlags;

    fn add_members(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        handles: &[Handle],
        message: &str,
    ) -> GatewayResult<()>;

    fn remove_members(
        &mut self,
        ctx: &mut ChannelCtx<'_>,
        handles: &[Handle],
        message: &str,
    ) -> GatewayResult<()>;

    fn members(&self, self_handle: HandleId) -> MembersSnapshot {
        self.base().snapshot(self_handle, self.group_flags())
    }
}

/// Message sending and the pending-message queue.
pub trait MessagesCapable {
    fn send(&mut self, ctx: &mut ChannelCtx<'_>, kind: text::MessageKind, text: &str)
    -> GatewayResult<()>;

    fn acknowledge_pending(&mut self, ctx: &mut ChannelCtx<'_>, ids: &[u32]) -> GatewayResult<()>;

    fn list_pending(&mut self, ctx: &mut ChannelCtx<'_>, clear: bool) -> Vec<text::PendingMessage>;
}

/// Typing notifications.
pub trait ChatStateful {
    fn set_chat_state(&mut self, ctx: &mut ChannelCtx<'_>, state: text::ChatState)
    -> GatewayResult<()>;
}

#[derive(Debug)]
pub enum Channel {
    List(ContactListChannel),
    Text(TextChannel),
    Media(MediaChannel),
    Transfer(FileTransferChannel),
}

impl Channel {
    pub fn base(&self) -> &ChannelBase {
        self.groupable().base()
    }

    pub fn id(&self) -> ChannelId {
        self.base().id
    }

    pub fn kind(&self) -> ChannelKind {
        self.base().kind
    }

    pub fn summary(&self) -> ChannelSummary {
        self.base().summary()
    }

    pub fn groupable(&self) -> &dyn Groupable {
        match self {
            Self::List(c) => c,
            Self::Text(c) => c,
            Self::Media(c) => c,
            Self::Transfer(c) => c,
        }
    }

    pub fn groupable_mut(&mut self) -> &mut dyn Groupable {
        match self {
            Self::List(c) => c,
            Self::Text(c) => c,
            Self::Media(c) => c,
            Self::Transfer(c) => c,
        }
    }

    pub fn messages_mut(&mut self) -> GatewayResult<&mut dyn MessagesCapable> {
        match self {
            Self::Text(c) => Ok(c),
            other => Err(GatewayError::unimplemented(format!(
                "{} channels do not carry messages",
                other.kind().as_str()
            ))),
        }
    }

    pub fn chat_state_mut(&mut self) -> GatewayResult<&mut dyn ChatStateful> {
        match self {
            Self::Text(c) => Ok(c),
            other => Err(GatewayError::unimplemented(format!(
                "{} channels have no chat state",
                other.kind().as_str()
            ))),
        }
    }

    pub fn as_text_mut(&mut self) -> Option<&mut TextChannel> {
        match self {
            Self::Text(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&TextChannel> {
        match self {
            Self::Text(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_media_mut(&mut self) -> Option<&mut MediaChannel> {
        match self {
            Self::Media(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_transfer_mut(&mut self) -> Option<&mut FileTransferChannel> {
        match self {
            Self::Transfer(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_list_mut(&mut self) -> Option<&mut ContactListChannel> {
        match self {
            Self::List(c) => Some(c),
            _ => None,
        }
    }

    /// Emit the construction-time roster and start kind-specific work.
    pub fn populate(&mut self, ctx: &mut ChannelCtx<'_>) {
        match self {
            Self::List(c) => c.populate(ctx),
            Self::Text(c) => c.populate(ctx),
            Self::Media(c) => c.populate(ctx),
            Self::Transfer(c) => c.populate(ctx),
        }
    }

    /// Release the attached session, cancel timers and emit `Closed`.
    /// Closing twice emits nothing the second time.
    pub fn close(&mut self, ctx: &mut ChannelCtx<'_>) {
        if self.base().is_closed() {
            return;
        }
        match self {
            Self::List(_) => {}
            Self::Text(c) => c.release_session(ctx),
            Self::Media(c) => c.end_call(ctx),
            Self::Transfer(c) => c.cancel(ctx),
        }
        let id = self.id();
        ctx.timers.cancel_channel(id);
        ctx.routes.unbind_channel(id);
        let base = match self {
            Self::List(c) => &mut c.base,
            Self::Text(c) => &mut c.base,
            Self::Media(c) => &mut c.base,
            Self::Transfer(c) => &mut c.base,
        };
        base.mark_closed(ctx);
    }

    pub fn on_timer(&mut self, ctx: &mut ChannelCtx<'_>, event: &TimerEvent) {
        if let Self::Text(c) = self {
            c.on_timer(ctx, event);
        }
    }
}

/// Only contact handles may join a channel roster through the control surface.
pub(crate) fn require_contacts(handles: &[Handle]) -> GatewayResult<()> {
    match handles
        .iter()
        .find(|h| h.handle_type() != HandleType::Contact)
    {
        Some(bad) => Err(GatewayError::InvalidHandle(format!(
            "{bad} is not a contact"
        ))),
        None => Ok(()),
    }
}
