//! The per-connection core.
//!
//! `Connection` is sans-IO: it never awaits. The actor feeds it account
//! events, timer expiries and control calls one at a time and drains the
//! signals each of them produced. Keeping the core synchronous is what
//! makes every handler run to completion before the next one starts.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Instant;

use chrono::Utc;
use imgate_account::{
    AccountClient, AccountEvent, CallId, ClientState, ContactKey, ConversationId, DisplayPicture,
    LoginParams, MediaKind, OfflineMessage, StreamDirection, TransferId,
};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::aliasing::{self, Aliasing};
use super::avatars::{self, AvatarRequirements, Avatars};
use super::capabilities::{Capabilities, Capability, CapabilityChange};
use super::channels::media::StreamInfo;
use super::channels::text::{ChatState, MessageKind, PendingMessage};
use super::channels::transfer::TransferDetails;
use super::contacts::{ContactAttributes, ContactInterface};
use super::channels::{
    Channel, ChannelCtx, ChannelId, ChannelKind, ChannelSettings, ChannelSummary, MediaChannel,
    MembersSnapshot, Routes, TextChannel, FileTransferChannel,
};
use super::handle::{Handle, HandleId, HandleRegistry, HandleType, ListName};
use super::lifecycle::{ConnectionStatus, Lifecycle, StatusReason, Transition};
use super::mail::{self, MailNotification, MailUrl};
use super::managers::{ChannelManager, ChannelRequest, RequestProperties, classify};
use super::presence::{self, PresenceRequest, SimplePresence};
use super::signal::{Outbox, Signal};
use super::timers::TimerQueue;
use crate::error::{GatewayError, GatewayResult};
use crate::network::ConnectionParams;
use crate::telemetry::spans;

/// Events the account client pushes; the actor owns the receiving end.
pub type AccountEvents = mpsc::UnboundedReceiver<AccountEvent>;

/// Everything a channel may touch while it handles one call.
struct Services {
    account: Box<dyn AccountClient>,
    handles: HandleRegistry,
    outbox: Outbox,
    timers: TimerQueue,
    routes: Routes,
    settings: ChannelSettings,
}

impl Services {
    fn ctx(&mut self, now: Instant) -> ChannelCtx<'_> {
        ChannelCtx {
            account: self.account.as_mut(),
            handles: &mut self.handles,
            outbox: &mut self.outbox,
            timers: &mut self.timers,
            routes: &mut self.routes,
            settings: &self.settings,
            now,
        }
    }
}

pub struct Connection {
    services: Services,
    channels: ChannelManager,
    lifecycle: Lifecycle,
    login: LoginParams,
    /// Presence set before the connection opened.
    deferred_presence: Option<(imgate_account::Presence, String)>,
    aliasing: Aliasing,
    capabilities: Capabilities,
    avatars: Avatars,
    mail: MailNotification,
}

fn object_path(account: &str) -> String {
    let escaped: String = account
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("/{}/{escaped}", crate::network::PROTOCOL)
}

impl Connection {
    /// Wire `account` to a fresh core. The returned receiver carries the
    /// account's events and must be fed back through
    /// [`handle_account_event`](Self::handle_account_event).
    pub fn new(
        mut account: Box<dyn AccountClient>,
        params: &ConnectionParams,
        settings: ChannelSettings,
    ) -> GatewayResult<(Self, AccountEvents)> {
        let key: ContactKey = params.account.parse()?;
        let (tx, rx) = mpsc::unbounded_channel();
        account.set_event_sink(tx);
        let connection = Self {
            services: Services {
                account,
                handles: HandleRegistry::new(key),
                outbox: Outbox::new(),
                timers: TimerQueue::new(),
                routes: Routes::default(),
                settings,
            },
            channels: ChannelManager::new(object_path(&params.account)),
            lifecycle: Lifecycle::new(),
            login: params.login_params(),
            deferred_presence: None,
            aliasing: Aliasing::new(),
            capabilities: Capabilities::new(),
            avatars: Avatars::new(),
            mail: MailNotification::new(),
        };
        Ok((connection, rx))
    }

    pub fn account_name(&self) -> &str {
        &self.login.account
    }

    pub fn status(&self) -> ConnectionStatus {
        self.lifecycle.status()
    }

    pub fn self_handle(&self) -> HandleId {
        self.services.handles.self_handle().id()
    }

    /// Signals produced since the last drain, in emission order.
    pub fn drain_signals(&mut self) -> Vec<Signal> {
        self.services.outbox.drain()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.services.timers.next_deadline()
    }

    fn require_connected(&self) -> GatewayResult<()> {
        if self.lifecycle.is_connected() {
            Ok(())
        } else {
            Err(GatewayError::Disconnected)
        }
    }

    /// Close every channel that asked for it during the last operation.
    fn reap(&mut self, now: Instant) {
        let mut ctx = self.services.ctx(now);
        self.channels.reap(&mut ctx);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start logging in. A no-op unless disconnected.
    pub fn connect(&mut self) -> GatewayResult<()> {
        if !self.lifecycle.begin_connect() {
            debug!(account = %self.login.account, "connect ignored; already connecting");
            return Ok(());
        }
        info!(account = %self.login.account, server = %self.login.server, "connecting");
        self.services.account.login(&self.login);
        Ok(())
    }

    /// Log out and tear down right away.
    pub fn disconnect(&mut self) -> GatewayResult<()> {
        if self.lifecycle.status() == ConnectionStatus::Disconnected {
            if self.lifecycle.login_requested() {
                self.lifecycle.cancel_connect();
                self.lifecycle.latch(StatusReason::Requested);
                self.services.account.logout();
            }
            return Ok(());
        }
        self.lifecycle.latch(StatusReason::Requested);
        self.services.account.logout();
        self.client_state(ClientState::Closed);
        Ok(())
    }

    fn client_state(&mut self, state: ClientState) {
        match self.lifecycle.on_client_state(state) {
            Transition::Connecting => {
                info!(account = %self.login.account, "status connecting");
                self.services.outbox.push(Signal::StatusChanged {
                    status: ConnectionStatus::Connecting,
                    reason: StatusReason::Requested,
                });
            }
            Transition::Synchronized => self.synchronized(),
            Transition::Open => self.opened(),
            Transition::Closed => self.teardown(),
            Transition::Ignore => {
                debug!(state = ?state, status = ?self.lifecycle.status(), "client state ignored");
            }
        }
    }

    /// The address book is available: announce subscribe, publish and
    /// one channel per group.
    fn synchronized(&mut self) {
        let now = Instant::now();
        let mut requests = vec![
            ChannelRequest::List(self.services.handles.list(ListName::Subscribe)),
            ChannelRequest::List(self.services.handles.list(ListName::Publish)),
        ];
        for group in self.services.account.groups() {
            requests.push(ChannelRequest::List(self.services.handles.group(&group.name)));
        }
        let mut ctx = self.services.ctx(now);
        for request in requests {
            if let Err(err) = self.channels.ensure(&mut ctx, request, false) {
                warn!(error = %err, "failed to create contact list channel");
            }
        }
        self.channels.reap(&mut ctx);
        info!(lists = self.channels.list_channel_ids().len(), "address book synchronized");
    }

    fn opened(&mut self) {
        info!(account = %self.login.account, "status connected");
        self.services.outbox.push(Signal::StatusChanged {
            status: ConnectionStatus::Connected,
            reason: StatusReason::Requested,
        });

        if let Some((presence, message)) = self.deferred_presence.take() {
            self.services.account.set_presence(presence, &message);
        }

        let mut changes: Vec<CapabilityChange> = Vec::new();
        for contact in self.services.account.contacts() {
            let handle = self.services.handles.published_contact(&contact.key);
            changes.extend(self.capabilities.update(handle.id(), Some(&contact)));
        }
        if !changes.is_empty() {
            self.services.outbox.push(Signal::CapabilitiesChanged(changes));
        }

        if self.services.account.profile().email_enabled {
            self.mail.enable(self.services.account.unread_mail_count());
        }
    }

    /// DISCONNECTED goes out before any channel reports `Closed`.
    fn teardown(&mut self) {
        let reason = self.lifecycle.take_reason();
        info!(account = %self.login.account, reason = ?reason, "status disconnected");
        self.services.outbox.push(Signal::StatusChanged {
            status: ConnectionStatus::Disconnected,
            reason,
        });
        let mut ctx = self.services.ctx(Instant::now());
        self.channels.close_all(&mut ctx);
        self.deferred_presence = None;
        self.aliasing.clear();
        self.capabilities.clear();
        self.avatars.clear();
        self.mail.clear();
        self.services.handles.forget_published();
        let reclaimed = self.services.handles.sweep();
        debug!(reclaimed, "handles swept after disconnect");
    }

    // ------------------------------------------------------------------
    // Inbound events
    // ------------------------------------------------------------------

    /// Route one account event.
    pub fn handle_account_event(&mut self, event: AccountEvent) {
        let _span = spans::account_event(event.name()).entered();
        let now = Instant::now();
        match event {
            AccountEvent::StateChanged(state) => {
                self.client_state(state);
                return;
            }
            AccountEvent::Error(err) => {
                warn!(error = %err, "account error");
                self.lifecycle.latch(StatusReason::from(&err));
                return;
            }
            _ if self.lifecycle.status() == ConnectionStatus::Disconnected => {
                debug!("event while disconnected dropped");
                return;
            }
            _ => {}
        }

        match event {
            AccountEvent::StateChanged(_) | AccountEvent::Error(_) => {}

            AccountEvent::ProfilePresenceChanged => {
                let profile = self.services.account.profile();
                self.services.outbox.push(Signal::PresencesChanged(vec![(
                    self.self_handle(),
                    SimplePresence::of_profile(&profile),
                )]));
            }
            AccountEvent::ContactPresenceChanged(key) => {
                let handle = self.services.handles.published_contact(&key);
                let presence = self
                    .services
                    .account
                    .contact(&key)
                    .map_or_else(SimplePresence::offline, |c| SimplePresence::of_contact(&c));
                self.services
                    .outbox
                    .push(Signal::PresencesChanged(vec![(handle.id(), presence)]));
            }
            AccountEvent::ContactAliasChanged(key) => {
                let handle = self.services.handles.published_contact(&key);
                let contact = self.services.account.contact(&key);
                let alias = aliasing::contact_alias(&key, contact.as_ref());
                self.services
                    .outbox
                    .push(Signal::AliasesChanged(vec![(handle.id(), alias)]));
            }
            AccountEvent::ContactCapabilitiesChanged(key) => self.refresh_capabilities(&key),
            AccountEvent::ContactAvatarChanged(key) => {
                let handle = self.services.handles.published_contact(&key);
                let token = self
                    .services
                    .account
                    .contact(&key)
                    .and_then(|c| c.avatar_token)
                    .unwrap_or_default();
                self.services.outbox.push(Signal::AvatarUpdated {
                    contact: handle.id(),
                    token,
                });
            }
            AccountEvent::AvatarRetrieved { contact, picture } => {
                let handle = self.services.handles.published_contact(&contact);
                self.avatar_retrieved(handle.id(), picture);
            }
            AccountEvent::ContactMembershipsChanged(key)
            | AccountEvent::ContactAdded(key)
            | AccountEvent::ContactDeleted(key)
            | AccountEvent::ContactBlocked(key)
            | AccountEvent::ContactUnblocked(key) => self.memberships_changed(now, &key),

            AccountEvent::GroupAdded(group) => {
                let mut ctx = self.services.ctx(now);
                let mut adopted = false;
                for id in self.channels.list_channel_ids() {
                    if let Ok(channel) = self.channels.get_mut(id)
                        && let Some(list) = channel.as_list_mut()
                    {
                        adopted |= list.group_added(&mut ctx, &group.id, &group.name);
                    }
                }
                if !adopted {
                    let handle = ctx.handles.group(&group.name);
                    if let Err(err) = self.channels.ensure(&mut ctx, ChannelRequest::List(handle), false) {
                        warn!(group = %group.name, error = %err, "failed to announce group");
                    }
                }
            }
            AccountEvent::GroupDeleted(group) => {
                if let Some(id) = self.channels.group_channel(&group.id) {
                    let mut ctx = self.services.ctx(now);
                    if let Err(err) = self.channels.close(&mut ctx, id) {
                        debug!(channel = %id, error = %err, "group channel already gone");
                    }
                }
            }
            AccountEvent::GroupRenamed(group) => {
                debug!(group = %group.id, name = %group.name, "group renamed");
            }
            AccountEvent::GroupContactAdded { group, contact }
            | AccountEvent::GroupContactDeleted { group, contact } => {
                if let Some(id) = self.channels.group_channel(&group) {
                    let mut ctx = self.services.ctx(now);
                    if let Ok(channel) = self.channels.get_mut(id)
                        && let Some(list) = channel.as_list_mut()
                    {
                        list.contact_changed(&mut ctx, &contact);
                    }
                }
            }

            AccountEvent::ConversationInvited(conversation) => {
                let initiator = self.conversation_initiator(conversation);
                let mut ctx = self.services.ctx(now);
                self.channels
                    .channel_for_conversation(&mut ctx, conversation, &initiator);
            }
            AccountEvent::UserJoined {
                conversation,
                contact,
            } => self.user_joined(now, conversation, &contact),
            AccountEvent::UserLeft {
                conversation,
                contact,
            } => self.on_conversation(now, conversation, |text, ctx| text.user_left(ctx, &contact)),
            AccountEvent::UserTyping {
                conversation,
                contact,
            } => {
                self.on_conversation(now, conversation, |text, ctx| text.user_typing(ctx, &contact))
            }
            AccountEvent::MessageReceived {
                conversation,
                sender,
                text,
            } => self.incoming(now, conversation, &sender, |channel, ctx, handle| {
                channel.message_received(
                    ctx,
                    handle,
                    MessageKind::Normal,
                    &text,
                    Utc::now().timestamp(),
                    None,
                );
            }),
            AccountEvent::NudgeReceived {
                conversation,
                sender,
            } => self.incoming(now, conversation, &sender, |channel, ctx, handle| {
                channel.nudge_received(ctx, handle);
            }),
            AccountEvent::OfflineMessagesReceived(messages) => {
                self.offline_messages(now, messages)
            }

            AccountEvent::CallInvited { call, peer } => {
                let mut ctx = self.services.ctx(now);
                let peer = ctx.handles.contact(&peer);
                self.channels.incoming_call(&mut ctx, call, peer);
            }
            AccountEvent::CallRinging(call) => self.on_call(now, call, |m, ctx| m.on_ringing(ctx)),
            AccountEvent::CallAccepted(call) => {
                self.on_call(now, call, |m, ctx| m.on_accepted(ctx))
            }
            AccountEvent::CallRejected(call) => {
                self.on_call(now, call, |m, ctx| m.on_rejected(ctx))
            }
            AccountEvent::CallEnded(call) => self.on_call(now, call, |m, ctx| m.on_ended(ctx)),
            AccountEvent::StreamCreated {
                call,
                stream,
                kind,
                direction,
            } => self.on_call(now, call, |m, ctx| {
                m.on_stream_created(ctx, stream, kind, direction)
            }),
            AccountEvent::StreamRemoved { call, stream } => {
                self.on_call(now, call, |m, ctx| m.on_stream_removed(ctx, stream))
            }
            AccountEvent::StreamDirectionChanged {
                call,
                stream,
                direction,
            } => self.on_call(now, call, |m, ctx| {
                m.on_stream_direction(ctx, stream, direction)
            }),
            AccountEvent::StreamStateChanged {
                call,
                stream,
                connected,
            } => self.on_call(now, call, |m, ctx| {
                m.on_stream_state(ctx, stream, connected)
            }),

            AccountEvent::TransferInvited(info) => {
                let mut ctx = self.services.ctx(now);
                self.channels.incoming_transfer(&mut ctx, &info);
            }
            AccountEvent::TransferAccepted(transfer) => {
                self.on_transfer(now, transfer, |t, ctx| t.on_remote_accepted(ctx))
            }
            AccountEvent::TransferProgressed {
                transfer,
                transferred,
            } => self.on_transfer(now, transfer, |t, ctx| t.on_progress(ctx, transferred)),
            AccountEvent::TransferCompleted(transfer) => {
                self.on_transfer(now, transfer, |t, ctx| t.on_completed(ctx))
            }
            AccountEvent::TransferCancelled(transfer) => {
                self.on_transfer(now, transfer, |t, ctx| t.on_remote_cancelled(ctx))
            }

            AccountEvent::MailboxUnreadChanged(count) => {
                if self.mail.is_enabled() && self.mail.set_unread(count) {
                    self.services
                        .outbox
                        .push(Signal::UnreadMailsChanged { count });
                }
            }
            AccountEvent::MailReceived(message) => {
                if self.mail.is_enabled() {
                    self.services
                        .outbox
                        .push(Signal::MailsReceived(vec![message.into()]));
                }
            }
            AccountEvent::InboxUrlReady(url) => self.mail.inbox_ready(MailUrl::from(url)),
        }
        self.reap(now);
    }

    fn avatar_retrieved(&mut self, contact: HandleId, picture: DisplayPicture) {
        debug!(contact = %contact, token = %picture.token, bytes = picture.data.len(), "avatar retrieved");
        self.services.outbox.push(Signal::AvatarRetrieved {
            contact,
            token: picture.token,
            mime_type: avatars::sniff_mime_type(&picture.data).to_string(),
            data: picture.data,
        });
    }

    fn refresh_capabilities(&mut self, key: &ContactKey) {
        let handle = self.services.handles.published_contact(key);
        let contact = self.services.account.contact(key);
        let changes = self.capabilities.update(handle.id(), contact.as_ref());
        if !changes.is_empty() {
            self.services
                .outbox
                .push(Signal::CapabilitiesChanged(changes));
        }
    }

    fn memberships_changed(&mut self, now: Instant, key: &ContactKey) {
        {
            let mut ctx = self.services.ctx(now);
            for id in self.channels.list_channel_ids() {
                if let Ok(channel) = self.channels.get_mut(id)
                    && let Some(list) = channel.as_list_mut()
                {
                    list.contact_changed(&mut ctx, key);
                }
            }
        }
        self.aliasing
            .memberships_changed(self.services.account.as_mut(), key);
        if self.lifecycle.is_connected() {
            self.refresh_capabilities(key);
        }
    }

    fn conversation_initiator(&mut self, conversation: ConversationId) -> Handle {
        let me = self.services.handles.self_handle();
        self.services
            .account
            .conversation_participants(conversation)
            .iter()
            .map(|key| self.services.handles.contact(key))
            .find(|h| *h != me)
            .unwrap_or(me)
    }

    fn on_conversation(
        &mut self,
        now: Instant,
        conversation: ConversationId,
        f: impl FnOnce(&mut TextChannel, &mut ChannelCtx<'_>),
    ) {
        let Some(id) = self.services.routes.conversation(conversation) else {
            debug!(conversation = %conversation, "event for unrouted conversation");
            return;
        };
        let mut ctx = self.services.ctx(now);
        if let Ok(channel) = self.channels.get_mut(id)
            && let Some(text) = channel.as_text_mut()
        {
            f(text, &mut ctx);
        }
    }

    fn on_call(
        &mut self,
        now: Instant,
        call: CallId,
        f: impl FnOnce(&mut MediaChannel, &mut ChannelCtx<'_>),
    ) {
        let Some(id) = self.services.routes.call(call) else {
            debug!(call = %call, "event for unrouted call");
            return;
        };
        let mut ctx = self.services.ctx(now);
        if let Ok(channel) = self.channels.get_mut(id)
            && let Some(media) = channel.as_media_mut()
        {
            f(media, &mut ctx);
        }
    }

    fn on_transfer(
        &mut self,
        now: Instant,
        transfer: TransferId,
        f: impl FnOnce(&mut FileTransferChannel, &mut ChannelCtx<'_>),
    ) {
        let Some(id) = self.services.routes.transfer(transfer) else {
            debug!(transfer = %transfer, "event for unrouted transfer");
            return;
        };
        let mut ctx = self.services.ctx(now);
        if let Ok(channel) = self.channels.get_mut(id)
            && let Some(t) = channel.as_transfer_mut()
        {
            f(t, &mut ctx);
        }
    }

    /// A contact entered a conversation. A third party joining a 1:1
    /// session moves the session to a new conference.
    fn user_joined(&mut self, now: Instant, conversation: ConversationId, contact: &ContactKey) {
        let mut ctx = self.services.ctx(now);
        let joiner = ctx.handles.contact(contact);
        let Some(id) = ctx.routes.conversation(conversation) else {
            self.channels
                .channel_for_conversation(&mut ctx, conversation, &joiner);
            return;
        };
        let splits = match self.channels.get(id) {
            Ok(channel) => {
                channel.as_text().is_some_and(TextChannel::is_one_to_one)
                    && channel.base().target.as_ref() != Some(&joiner)
                    && !ctx.handles.is_self(&joiner)
            }
            Err(_) => false,
        };
        let target = if splits {
            match self.channels.split(&mut ctx, id, &joiner) {
                Some(conference) => conference,
                None => return,
            }
        } else {
            id
        };
        if let Ok(channel) = self.channels.get_mut(target)
            && let Some(text) = channel.as_text_mut()
        {
            text.user_joined(&mut ctx, contact);
        }
    }

    /// Deliver something a contact said, creating the channel first so
    /// observers see it announced before the message.
    fn incoming(
        &mut self,
        now: Instant,
        conversation: ConversationId,
        sender: &ContactKey,
        f: impl FnOnce(&mut TextChannel, &mut ChannelCtx<'_>, &Handle),
    ) {
        let mut ctx = self.services.ctx(now);
        let handle = ctx.handles.contact(sender);
        let id = self
            .channels
            .channel_for_conversation(&mut ctx, conversation, &handle);
        if let Ok(channel) = self.channels.get_mut(id)
            && let Some(text) = channel.as_text_mut()
        {
            f(text, &mut ctx, &handle);
        }
    }

    /// Offline messages go to each sender's text channel, oldest first.
    fn offline_messages(&mut self, now: Instant, messages: Vec<OfflineMessage>) {
        let mut by_sender: BTreeMap<ContactKey, Vec<OfflineMessage>> = BTreeMap::new();
        for message in messages {
            by_sender
                .entry(message.sender.clone())
                .or_default()
                .push(message);
        }
        let mut ctx = self.services.ctx(now);
        for (sender, mut messages) in by_sender {
            messages.sort_by_key(|m| m.date);
            let handle = ctx.handles.contact(&sender);
            let id = match self
                .channels
                .ensure(&mut ctx, ChannelRequest::Text(handle.clone()), false)
            {
                Ok((_, id)) => id,
                Err(err) => {
                    warn!(sender = %sender, error = %err, "dropping offline messages");
                    continue;
                }
            };
            let Ok(channel) = self.channels.get_mut(id) else {
                continue;
            };
            let Some(text) = channel.as_text_mut() else {
                continue;
            };
            debug!(sender = %sender, count = messages.len(), "delivering offline messages");
            for message in messages {
                text.message_received(
                    &mut ctx,
                    &handle,
                    MessageKind::Normal,
                    &message.text,
                    message.date.timestamp(),
                    Some(message.id),
                );
            }
        }
    }

    /// Run every timer due at `now`.
    pub fn fire_timers(&mut self, now: Instant) {
        let due = self.services.timers.pop_due(now);
        if due.is_empty() {
            return;
        }
        let mut ctx = self.services.ctx(now);
        for (_, event) in due {
            let id = event.channel();
            match self.channels.get_mut(id) {
                Ok(channel) => channel.on_timer(&mut ctx, &event),
                Err(_) => debug!(channel = %id, "timer for closed channel"),
            }
        }
        self.channels.reap(&mut ctx);
    }

    /// A client connected to a transfer listener.
    pub fn transfer_socket(&mut self, channel: ChannelId, socket: TcpStream) {
        let now = Instant::now();
        let mut ctx = self.services.ctx(now);
        match self.channels.get_mut(channel) {
            Ok(Channel::Transfer(transfer)) => transfer.socket_connected(&mut ctx, socket),
            _ => debug!(channel = %channel, "socket for vanished transfer dropped"),
        }
    }

    // ------------------------------------------------------------------
    // Handles
    // ------------------------------------------------------------------

    pub fn request_handles(&mut self, kind: HandleType, names: &[String]) -> GatewayResult<Vec<HandleId>> {
        self.require_connected()?;
        let handles = names
            .iter()
            .map(|name| self.services.handles.parse(kind, name))
            .collect::<GatewayResult<Vec<_>>>()?;
        for handle in &handles {
            self.services.handles.hold(handle);
        }
        Ok(handles.iter().map(Handle::id).collect())
    }

    pub fn inspect_handles(&self, kind: HandleType, ids: &[HandleId]) -> GatewayResult<Vec<String>> {
        self.require_connected()?;
        ids.iter()
            .map(|id| {
                self.services
                    .handles
                    .resolve(kind, *id)
                    .map(|h| h.name().to_string())
            })
            .collect()
    }

    pub fn release_handles(&mut self, kind: HandleType, ids: &[HandleId]) -> GatewayResult<()> {
        self.require_connected()?;
        for id in ids {
            self.services.handles.release(kind, *id)?;
        }
        Ok(())
    }

    fn contacts(&self, ids: &[HandleId]) -> GatewayResult<Vec<Handle>> {
        ids.iter()
            .map(|id| self.services.handles.resolve(HandleType::Contact, *id))
            .collect()
    }

    // ------------------------------------------------------------------
    // Channel requests
    // ------------------------------------------------------------------

    /// Request a channel the old way: type plus target handle.
    pub fn request_channel(
        &mut self,
        kind: ChannelKind,
        target_type: HandleType,
        target: HandleId,
    ) -> GatewayResult<ChannelId> {
        let props = RequestProperties::targeted(kind, target_type, target);
        self.ensure_channel(&props).map(|(_, summary)| summary.id)
    }

    /// Return an equivalent live channel or create one. The flag is true
    /// when the channel was created by this call.
    pub fn ensure_channel(&mut self, props: &RequestProperties) -> GatewayResult<(bool, ChannelSummary)> {
        self.require_connected()?;
        let request = classify(&mut self.services.handles, props)?;
        let now = Instant::now();
        let mut ctx = self.services.ctx(now);
        let result = self.channels.ensure(&mut ctx, request, true);
        self.channels.reap(&mut ctx);
        let (created, id) = result?;
        let summary = self.channels.get(id)?.summary();
        Ok((created, summary))
    }

    pub fn get_channels(&self) -> GatewayResult<Vec<ChannelSummary>> {
        self.require_connected()?;
        Ok(self.channels.summaries())
    }

    fn with_channel<T>(
        &mut self,
        id: ChannelId,
        f: impl FnOnce(&mut Channel, &mut ChannelCtx<'_>) -> GatewayResult<T>,
    ) -> GatewayResult<T> {
        self.require_connected()?;
        let mut ctx = self.services.ctx(Instant::now());
        let result = f(self.channels.get_mut(id)?, &mut ctx);
        self.channels.reap(&mut ctx);
        result
    }

    pub fn close_channel(&mut self, id: ChannelId) -> GatewayResult<()> {
        self.require_connected()?;
        let mut ctx = self.services.ctx(Instant::now());
        let result = self.channels.close(&mut ctx, id);
        self.channels.reap(&mut ctx);
        result
    }

    // Text

    pub fn send(&mut self, id: ChannelId, kind: MessageKind, text: &str) -> GatewayResult<()> {
        self.with_channel(id, |channel, ctx| channel.messages_mut()?.send(ctx, kind, text))
    }

    pub fn acknowledge_pending(&mut self, id: ChannelId, ids: &[u32]) -> GatewayResult<()> {
        self.with_channel(id, |channel, ctx| {
            channel.messages_mut()?.acknowledge_pending(ctx, ids)
        })
    }

    pub fn list_pending(&mut self, id: ChannelId, clear: bool) -> GatewayResult<Vec<PendingMessage>> {
        self.with_channel(id, |channel, ctx| {
            Ok(channel.messages_mut()?.list_pending(ctx, clear))
        })
    }

    pub fn set_chat_state(&mut self, id: ChannelId, state: ChatState) -> GatewayResult<()> {
        self.with_channel(id, |channel, ctx| {
            channel.chat_state_mut()?.set_chat_state(ctx, state)
        })
    }

    // Membership

    pub fn get_members(&self, id: ChannelId) -> GatewayResult<MembersSnapshot> {
        self.require_connected()?;
        Ok(self
            .channels
            .get(id)?
            .groupable()
            .members(self.self_handle()))
    }

    pub fn add_members(&mut self, id: ChannelId, ids: &[HandleId], message: &str) -> GatewayResult<()> {
        let handles = self.contacts(ids)?;
        self.with_channel(id, |channel, ctx| {
            channel.groupable_mut().add_members(ctx, &handles, message)
        })
    }

    pub fn remove_members(
        &mut self,
        id: ChannelId,
        ids: &[HandleId],
        message: &str,
    ) -> GatewayResult<()> {
        let handles = self.contacts(ids)?;
        self.with_channel(id, |channel, ctx| {
            channel.groupable_mut().remove_members(ctx, &handles, message)
        })
    }

    // Media

    fn media<T>(
        &mut self,
        id: ChannelId,
        f: impl FnOnce(&mut MediaChannel, &mut ChannelCtx<'_>) -> GatewayResult<T>,
    ) -> GatewayResult<T> {
        self.with_channel(id, |channel, ctx| match channel.as_media_mut() {
            Some(media) => f(media, ctx),
            None => Err(GatewayError::unimplemented("not a streamed media channel")),
        })
    }

    pub fn list_streams(&mut self, id: ChannelId) -> GatewayResult<Vec<StreamInfo>> {
        self.media(id, |media, _| Ok(media.list_streams()))
    }

    pub fn request_streams(
        &mut self,
        id: ChannelId,
        contact: HandleId,
        kinds: &[MediaKind],
    ) -> GatewayResult<Vec<StreamInfo>> {
        let contact = self.services.handles.resolve(HandleType::Contact, contact)?;
        self.media(id, |media, ctx| media.request_streams(ctx, &contact, kinds))
    }

    pub fn remove_streams(&mut self, id: ChannelId, streams: &[u32]) -> GatewayResult<()> {
        self.media(id, |media, ctx| media.remove_streams(ctx, streams))
    }

    pub fn request_stream_direction(
        &mut self,
        id: ChannelId,
        stream: u32,
        direction: StreamDirection,
    ) -> GatewayResult<()> {
        self.media(id, |media, ctx| {
            media.request_stream_direction(ctx, stream, direction)
        })
    }

    // File transfer

    fn transfer<T>(
        &mut self,
        id: ChannelId,
        f: impl FnOnce(&mut FileTransferChannel, &mut ChannelCtx<'_>) -> GatewayResult<T>,
    ) -> GatewayResult<T> {
        self.with_channel(id, |channel, ctx| match channel.as_transfer_mut() {
            Some(transfer) => f(transfer, ctx),
            None => Err(GatewayError::unimplemented("not a file transfer channel")),
        })
    }

    pub fn transfer_details(&mut self, id: ChannelId) -> GatewayResult<TransferDetails> {
        self.transfer(id, |transfer, _| Ok(transfer.details().clone()))
    }

    /// Accept an incoming file; the client reads it from `address`.
    pub fn accept_file(&mut self, id: ChannelId, offset: u64, address: SocketAddr) -> GatewayResult<SocketAddr> {
        self.transfer(id, |transfer, ctx| transfer.accept_file(ctx, offset, address))
    }

    /// Offer the file of an outgoing transfer at `address`.
    pub fn provide_file(&mut self, id: ChannelId, address: SocketAddr) -> GatewayResult<SocketAddr> {
        self.transfer(id, |transfer, ctx| transfer.provide_file(ctx, address))
    }

    // ------------------------------------------------------------------
    // Presence, aliases, capabilities
    // ------------------------------------------------------------------

    pub fn get_statuses(&self) -> Vec<&'static str> {
        presence::STATUSES.iter().map(|s| s.name).collect()
    }

    /// Going `offline` disconnects. Before the connection opens the
    /// presence is kept and applied once it does.
    pub fn set_presence(&mut self, status: &str, message: &str) -> GatewayResult<()> {
        match presence::parse_request(status, message)? {
            PresenceRequest::Disconnect => self.disconnect(),
            PresenceRequest::Set { presence, message } => {
                if self.lifecycle.is_connected() {
                    self.services.account.set_presence(presence, &message);
                } else {
                    debug!(status, "presence deferred until connected");
                    self.deferred_presence = Some((presence, message));
                }
                Ok(())
            }
        }
    }

    pub fn get_presences(&self, ids: &[HandleId]) -> GatewayResult<Vec<(HandleId, SimplePresence)>> {
        self.require_connected()?;
        let handles = self.contacts(ids)?;
        Ok(handles
            .iter()
            .map(|handle| {
                let presence = if self.services.handles.is_self(handle) {
                    SimplePresence::of_profile(&self.services.account.profile())
                } else {
                    handle
                        .contact_key()
                        .and_then(|key| self.services.account.contact(key))
                        .map_or_else(SimplePresence::offline, |c| SimplePresence::of_contact(&c))
                };
                (handle.id(), presence)
            })
            .collect())
    }

    pub fn get_aliases(&self, ids: &[HandleId]) -> GatewayResult<Vec<(HandleId, String)>> {
        self.require_connected()?;
        let handles = self.contacts(ids)?;
        Ok(handles
            .iter()
            .map(|handle| {
                let alias = if self.services.handles.is_self(handle) {
                    aliasing::self_alias(&self.services.account.profile())
                } else {
                    match handle.contact_key() {
                        Some(key) => {
                            aliasing::contact_alias(key, self.services.account.contact(key).as_ref())
                        }
                        None => handle.name().to_string(),
                    }
                };
                (handle.id(), alias)
            })
            .collect())
    }

    pub fn set_aliases(&mut self, aliases: &[(HandleId, String)]) -> GatewayResult<()> {
        self.require_connected()?;
        let ids: Vec<HandleId> = aliases.iter().map(|(id, _)| *id).collect();
        let handles = self.contacts(&ids)?;
        for (handle, (_, alias)) in handles.iter().zip(aliases) {
            if self.services.handles.is_self(handle) {
                self.services.account.set_display_name(alias);
                self.services
                    .outbox
                    .push(Signal::AliasesChanged(vec![(handle.id(), alias.clone())]));
            } else if let Some(key) = handle.contact_key() {
                self.aliasing
                    .set_contact(self.services.account.as_mut(), key, alias);
            }
        }
        Ok(())
    }

    pub fn get_capabilities(&self, ids: &[HandleId]) -> GatewayResult<Vec<Capability>> {
        self.require_connected()?;
        let handles = self.contacts(ids)?;
        Ok(handles
            .iter()
            .flat_map(|handle| self.capabilities.get(handle.id()))
            .collect())
    }

    // ------------------------------------------------------------------
    // Avatars
    // ------------------------------------------------------------------

    pub fn avatar_requirements(&self) -> AvatarRequirements {
        AvatarRequirements::default()
    }

    /// Tokens of the given contacts. Contacts without a picture are left
    /// out until the local user's own picture is known.
    pub fn get_known_avatar_tokens(&self, ids: &[HandleId]) -> GatewayResult<Vec<(HandleId, String)>> {
        self.require_connected()?;
        let handles = self.contacts(ids)?;
        Ok(handles
            .iter()
            .filter_map(|handle| {
                self.avatars
                    .known_token(self.avatar_token(handle))
                    .map(|token| (handle.id(), token))
            })
            .collect())
    }

    fn avatar_token(&self, handle: &Handle) -> Option<String> {
        if self.services.handles.is_self(handle) {
            self.services.account.profile().avatar_token
        } else {
            handle
                .contact_key()
                .and_then(|key| self.services.account.contact(key))
                .and_then(|c| c.avatar_token)
        }
    }

    /// Ask for the pictures of `ids`. Each one arrives as an
    /// `AvatarRetrieved` signal; contacts without a picture are skipped.
    pub fn request_avatars(&mut self, ids: &[HandleId]) -> GatewayResult<()> {
        self.require_connected()?;
        let handles = self.contacts(ids)?;
        for handle in &handles {
            if self.services.handles.is_self(handle) {
                if let Some(picture) = self.avatars.own().cloned() {
                    self.avatar_retrieved(handle.id(), picture);
                }
                continue;
            }
            let Some(key) = handle.contact_key() else {
                continue;
            };
            if let Some(token) = self.avatar_token(handle) {
                self.services.account.request_avatar(key, &token);
            }
        }
        Ok(())
    }

    /// Publish a new picture for the local user and return its token.
    pub fn set_avatar(&mut self, data: Vec<u8>, mime_type: &str) -> GatewayResult<String> {
        self.require_connected()?;
        self.avatars.validate(&data, mime_type)?;
        let token = self.services.account.set_avatar(&data);
        info!(token = %token, bytes = data.len(), "avatar set");
        let me = self.self_handle();
        self.services.outbox.push(Signal::AvatarUpdated {
            contact: me,
            token: token.clone(),
        });
        let picture = DisplayPicture {
            token: token.clone(),
            data,
        };
        self.avatars.set_own(picture.clone());
        self.avatar_retrieved(me, picture);
        Ok(token)
    }

    pub fn clear_avatar(&mut self) -> GatewayResult<()> {
        self.require_connected()?;
        self.services.account.clear_avatar();
        self.avatars.clear_own();
        self.services.outbox.push(Signal::AvatarUpdated {
            contact: self.self_handle(),
            token: String::new(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Contact attributes
    // ------------------------------------------------------------------

    pub fn contact_attribute_interfaces(&self) -> &'static [ContactInterface] {
        &ContactInterface::ALL
    }

    /// Everything the requested interfaces know about `ids`. The contact id
    /// is always included. With `hold` the handles are held for the caller
    /// as `request_handles` would.
    pub fn get_contact_attributes(
        &mut self,
        ids: &[HandleId],
        interfaces: &[ContactInterface],
        hold: bool,
    ) -> GatewayResult<Vec<ContactAttributes>> {
        self.require_connected()?;
        let handles = self.contacts(ids)?;
        let wants = |interface| interfaces.contains(&interface);

        let presences = if wants(ContactInterface::Presence) {
            Some(self.get_presences(ids)?)
        } else {
            None
        };
        let aliases = if wants(ContactInterface::Aliasing) {
            Some(self.get_aliases(ids)?)
        } else {
            None
        };
        let tokens = if wants(ContactInterface::Avatars) {
            Some(self.get_known_avatar_tokens(ids)?)
        } else {
            None
        };

        let mut result = Vec::with_capacity(handles.len());
        for handle in &handles {
            let id = handle.id();
            let mut attrs = ContactAttributes::new(id, handle.name());
            attrs.presence = presences
                .as_ref()
                .and_then(|all| all.iter().find(|(h, _)| *h == id))
                .map(|(_, p)| p.clone());
            attrs.alias = aliases
                .as_ref()
                .and_then(|all| all.iter().find(|(h, _)| *h == id))
                .map(|(_, a)| a.clone());
            attrs.avatar_token = tokens
                .as_ref()
                .and_then(|all| all.iter().find(|(h, _)| *h == id))
                .map(|(_, t)| t.clone());
            if wants(ContactInterface::Capabilities) {
                attrs.capabilities = Some(self.capabilities.get(id));
            }
            if hold {
                self.services.handles.hold(handle);
            }
            result.push(attrs);
        }
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Mail notification
    // ------------------------------------------------------------------

    fn require_mail(&self) -> GatewayResult<()> {
        self.require_connected()?;
        if self.mail.is_enabled() {
            Ok(())
        } else {
            Err(GatewayError::not_available("mail notification is disabled"))
        }
    }

    pub fn mail_capabilities(&self) -> GatewayResult<u32> {
        self.require_connected()?;
        Ok(self.mail.capabilities())
    }

    pub fn unread_mail_count(&self) -> GatewayResult<u32> {
        self.require_mail()?;
        Ok(self.mail.unread())
    }

    /// The reply arrives once the account reports the inbox URL.
    pub fn request_inbox_url(&mut self, reply: oneshot::Sender<MailUrl>) -> GatewayResult<()> {
        self.require_mail()?;
        if self.mail.wait_inbox(reply) {
            self.services.account.request_inbox_url();
        }
        Ok(())
    }

    pub fn request_mail_url(&self, id: &str, url_data: &str) -> GatewayResult<MailUrl> {
        self.require_mail()?;
        mail::mail_url(id, url_data)
    }
}
