//! Cloneable front for a connection actor.

use std::net::SocketAddr;

use imgate_account::{MediaKind, StreamDirection};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::types::{ConnectionCommand, ConnectionId, Reply};
use crate::error::{GatewayError, GatewayResult};
use crate::state::capabilities::Capability;
use crate::state::contacts::{ContactAttributes, ContactInterface};
use crate::state::channels::media::StreamInfo;
use crate::state::channels::text::{ChatState, MessageKind, PendingMessage};
use crate::state::channels::transfer::TransferDetails;
use crate::state::channels::{ChannelId, ChannelKind, ChannelSummary, MembersSnapshot};
use crate::state::handle::{HandleId, HandleType};
use crate::state::lifecycle::ConnectionStatus;
use crate::state::mail::MailUrl;
use crate::state::managers::RequestProperties;
use crate::state::presence::SimplePresence;
use crate::state::signal::Signal;

/// Handle to a running connection actor.
///
/// Every method is one round trip through the actor's command queue. A
/// stopped actor answers everything with [`GatewayError::Disconnected`].
#[derive(Clone, Debug)]
pub struct ConnectionHandle {
    id: ConnectionId,
    account: String,
    commands: mpsc::Sender<ConnectionCommand>,
    signals: broadcast::Sender<Signal>,
}

impl ConnectionHandle {
    pub(super) fn new(
        id: ConnectionId,
        account: String,
        commands: mpsc::Sender<ConnectionCommand>,
        signals: broadcast::Sender<Signal>,
    ) -> Self {
        Self {
            id,
            account,
            commands,
            signals,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Subscribe to signals emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.signals.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> ConnectionCommand) -> GatewayResult<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(build(reply_tx))
            .await
            .map_err(|_| GatewayError::Disconnected)?;
        reply_rx.await.map_err(|_| GatewayError::Disconnected)?
    }

    pub async fn connect(&self) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::Connect { reply_tx })
            .await
    }

    pub async fn disconnect(&self) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::Disconnect { reply_tx })
            .await
    }

    pub async fn status(&self) -> GatewayResult<ConnectionStatus> {
        self.call(|reply_tx| ConnectionCommand::Status { reply_tx })
            .await
    }

    pub async fn self_handle(&self) -> GatewayResult<HandleId> {
        self.call(|reply_tx| ConnectionCommand::SelfHandle { reply_tx })
            .await
    }

    pub async fn request_handles(&self, kind: HandleType, names: Vec<String>) -> GatewayResult<Vec<HandleId>> {
        self.call(|reply_tx| ConnectionCommand::RequestHandles {
            kind,
            names,
            reply_tx,
        })
        .await
    }

    pub async fn inspect_handles(&self, kind: HandleType, ids: Vec<HandleId>) -> GatewayResult<Vec<String>> {
        self.call(|reply_tx| ConnectionCommand::InspectHandles { kind, ids, reply_tx })
            .await
    }

    pub async fn release_handles(&self, kind: HandleType, ids: Vec<HandleId>) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::ReleaseHandles { kind, ids, reply_tx })
            .await
    }

    pub async fn request_channel(
        &self,
        kind: ChannelKind,
        target_type: HandleType,
        target: HandleId,
    ) -> GatewayResult<ChannelId> {
        self.call(|reply_tx| ConnectionCommand::RequestChannel {
            kind,
            target_type,
            target,
            reply_tx,
        })
        .await
    }

    /// Returns whether this call created the channel, plus its summary.
    pub async fn ensure_channel(&self, props: RequestProperties) -> GatewayResult<(bool, ChannelSummary)> {
        self.call(|reply_tx| ConnectionCommand::EnsureChannel { props, reply_tx })
            .await
    }

    pub async fn get_channels(&self) -> GatewayResult<Vec<ChannelSummary>> {
        self.call(|reply_tx| ConnectionCommand::GetChannels { reply_tx })
            .await
    }

    pub async fn close(&self, channel: ChannelId) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::Close { channel, reply_tx })
            .await
    }

    pub async fn send(&self, channel: ChannelId, kind: MessageKind, text: String) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::Send {
            channel,
            kind,
            text,
            reply_tx,
        })
        .await
    }

    pub async fn set_chat_state(&self, channel: ChannelId, state: ChatState) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::SetChatState {
            channel,
            state,
            reply_tx,
        })
        .await
    }

    pub async fn acknowledge_pending(&self, channel: ChannelId, ids: Vec<u32>) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::AcknowledgePending {
            channel,
            ids,
            reply_tx,
        })
        .await
    }

    pub async fn list_pending(&self, channel: ChannelId, clear: bool) -> GatewayResult<Vec<PendingMessage>> {
        self.call(|reply_tx| ConnectionCommand::ListPending {
            channel,
            clear,
            reply_tx,
        })
        .await
    }

    pub async fn get_members(&self, channel: ChannelId) -> GatewayResult<MembersSnapshot> {
        self.call(|reply_tx| ConnectionCommand::GetMembers { channel, reply_tx })
            .await
    }

    pub async fn add_members(&self, channel: ChannelId, handles: Vec<HandleId>, message: String) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::AddMembers {
            channel,
            handles,
            message,
            reply_tx,
        })
        .await
    }

    pub async fn remove_members(
        &self,
        channel: ChannelId,
        handles: Vec<HandleId>,
        message: String,
    ) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::RemoveMembers {
            channel,
            handles,
            message,
            reply_tx,
        })
        .await
    }

    pub async fn list_streams(&self, channel: ChannelId) -> GatewayResult<Vec<StreamInfo>> {
        self.call(|reply_tx| ConnectionCommand::ListStreams { channel, reply_tx })
            .await
    }

    pub async fn request_streams(
        &self,
        channel: ChannelId,
        contact: HandleId,
        kinds: Vec<MediaKind>,
    ) -> GatewayResult<Vec<StreamInfo>> {
        self.call(|reply_tx| ConnectionCommand::RequestStreams {
            channel,
            contact,
            kinds,
            reply_tx,
        })
        .await
    }

    pub async fn remove_streams(&self, channel: ChannelId, streams: Vec<u32>) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::RemoveStreams {
            channel,
            streams,
            reply_tx,
        })
        .await
    }

    pub async fn request_stream_direction(
        &self,
        channel: ChannelId,
        stream: u32,
        direction: StreamDirection,
    ) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::RequestStreamDirection {
            channel,
            stream,
            direction,
            reply_tx,
        })
        .await
    }

    pub async fn transfer_details(&self, channel: ChannelId) -> GatewayResult<TransferDetails> {
        self.call(|reply_tx| ConnectionCommand::TransferDetails { channel, reply_tx })
            .await
    }

    /// Returns the local address the client should connect to.
    pub async fn accept_file(&self, channel: ChannelId, offset: u64) -> GatewayResult<SocketAddr> {
        self.call(|reply_tx| ConnectionCommand::AcceptFile {
            channel,
            offset,
            reply_tx,
        })
        .await
    }

    pub async fn provide_file(&self, channel: ChannelId) -> GatewayResult<SocketAddr> {
        self.call(|reply_tx| ConnectionCommand::ProvideFile { channel, reply_tx })
            .await
    }

    pub async fn set_presence(&self, status: String, message: String) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::SetPresence {
            status,
            message,
            reply_tx,
        })
        .await
    }

    pub async fn get_presences(&self, handles: Vec<HandleId>) -> GatewayResult<Vec<(HandleId, SimplePresence)>> {
        self.call(|reply_tx| ConnectionCommand::GetPresences { handles, reply_tx })
            .await
    }

    pub async fn get_aliases(&self, handles: Vec<HandleId>) -> GatewayResult<Vec<(HandleId, String)>> {
        self.call(|reply_tx| ConnectionCommand::GetAliases { handles, reply_tx })
            .await
    }

    pub async fn set_aliases(&self, aliases: Vec<(HandleId, String)>) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::SetAliases { aliases, reply_tx })
            .await
    }

    pub async fn get_capabilities(&self, handles: Vec<HandleId>) -> GatewayResult<Vec<Capability>> {
        self.call(|reply_tx| ConnectionCommand::GetCapabilities { handles, reply_tx })
            .await
    }

    pub async fn get_known_avatar_tokens(
        &self,
        handles: Vec<HandleId>,
    ) -> GatewayResult<Vec<(HandleId, String)>> {
        self.call(|reply_tx| ConnectionCommand::GetKnownAvatarTokens { handles, reply_tx })
            .await
    }

    /// Pictures arrive later as `AvatarRetrieved` signals.
    pub async fn request_avatars(&self, handles: Vec<HandleId>) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::RequestAvatars { handles, reply_tx })
            .await
    }

    pub async fn set_avatar(&self, data: Vec<u8>, mime_type: String) -> GatewayResult<String> {
        self.call(|reply_tx| ConnectionCommand::SetAvatar {
            data,
            mime_type,
            reply_tx,
        })
        .await
    }

    pub async fn clear_avatar(&self) -> GatewayResult<()> {
        self.call(|reply_tx| ConnectionCommand::ClearAvatar { reply_tx })
            .await
    }

    pub async fn get_contact_attributes(
        &self,
        handles: Vec<HandleId>,
        interfaces: Vec<ContactInterface>,
        hold: bool,
    ) -> GatewayResult<Vec<ContactAttributes>> {
        self.call(|reply_tx| ConnectionCommand::GetContactAttributes {
            handles,
            interfaces,
            hold,
            reply_tx,
        })
        .await
    }

    pub async fn mail_capabilities(&self) -> GatewayResult<u32> {
        self.call(|reply_tx| ConnectionCommand::MailCapabilities { reply_tx })
            .await
    }

    pub async fn unread_mail_count(&self) -> GatewayResult<u32> {
        self.call(|reply_tx| ConnectionCommand::UnreadMailCount { reply_tx })
            .await
    }

    /// Resolves once the account has fetched the inbox URL.
    pub async fn request_inbox_url(&self) -> GatewayResult<MailUrl> {
        self.call(|reply_tx| ConnectionCommand::RequestInboxUrl { reply_tx })
            .await
    }

    pub async fn request_mail_url(&self, id: String, url_data: String) -> GatewayResult<MailUrl> {
        self.call(|reply_tx| ConnectionCommand::RequestMailUrl {
            id,
            url_data,
            reply_tx,
        })
        .await
    }

    /// Disconnect if needed and stop the actor. Succeeds on a stopped actor.
    pub async fn shutdown(&self) {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self
            .commands
            .send(ConnectionCommand::Shutdown { reply_tx })
            .await
            .is_ok()
        {
            let _ = reply_rx.await;
        }
    }
}
