//! The account-client interface consumed by the gateway core.

use tokio::net::TcpStream;
use tokio::sync::mpsc;

use crate::event::AccountEvent;
use crate::types::{
    CallId, Contact, ContactKey, ConversationId, Group, GroupId, MediaKind, MediaStreamId,
    Presence, Profile, StreamDirection, TransferId,
};

/// Queue the client pushes its [`AccountEvent`]s into.
pub type EventSink = mpsc::UnboundedSender<AccountEvent>;

/// Login parameters handed to [`AccountClient::login`].
#[derive(Clone, Debug, Default)]
pub struct LoginParams {
    pub account: String,
    pub password: String,
    pub server: String,
    pub port: u16,
    pub proxies: Vec<ProxyInfo>,
}

/// An HTTP(S) proxy the client should tunnel through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyInfo {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProxyScheme {
    Http,
    Https,
}

/// A logged-in (or logging-in) messenger account.
///
/// Commands are fire-and-forget: their outcome comes back later as
/// events on the [`EventSink`]. Queries read the client's current snapshot
/// and never block.
pub trait AccountClient: Send {
    /// Register the queue events are delivered to.
    fn set_event_sink(&mut self, sink: EventSink);

    fn login(&mut self, params: &LoginParams);
    fn logout(&mut self);

    // Snapshot queries
    fn profile(&self) -> Profile;
    fn contacts(&self) -> Vec<Contact>;
    fn contact(&self, key: &ContactKey) -> Option<Contact>;
    fn groups(&self) -> Vec<Group>;
    fn conversation_participants(&self, conversation: ConversationId) -> Vec<ContactKey>;
    fn unread_mail_count(&self) -> u32;

    // Profile
    fn set_presence(&mut self, presence: Presence, message: &str);
    fn set_display_name(&mut self, name: &str);

    // Address book
    fn add_contact(&mut self, contact: &ContactKey);
    fn delete_contact(&mut self, contact: &ContactKey);
    fn block_contact(&mut self, contact: &ContactKey);
    fn unblock_contact(&mut self, contact: &ContactKey);
    fn accept_contact_invitation(&mut self, contact: &ContactKey);
    fn decline_contact_invitation(&mut self, contact: &ContactKey);
    fn set_contact_alias(&mut self, contact: &ContactKey, alias: &str);
    fn add_group(&mut self, name: &str);
    fn rename_group(&mut self, group: &GroupId, name: &str);
    fn delete_group(&mut self, group: &GroupId);
    fn add_contact_to_group(&mut self, group: &GroupId, contact: &ContactKey);
    fn remove_contact_from_group(&mut self, group: &GroupId, contact: &ContactKey);

    // Conversations
    fn create_conversation(&mut self, participants: &[ContactKey]) -> ConversationId;
    fn send_text(&mut self, conversation: ConversationId, text: &str);
    fn send_nudge(&mut self, conversation: ConversationId);
    fn send_typing(&mut self, conversation: ConversationId);
    fn invite_user(&mut self, conversation: ConversationId, contact: &ContactKey);
    fn leave_conversation(&mut self, conversation: ConversationId);
    fn send_offline_message(&mut self, recipient: &ContactKey, text: &str);
    fn delete_offline_messages(&mut self, ids: &[String]);

    // Calls
    fn create_call(&mut self, peer: &ContactKey) -> CallId;
    fn accept_call(&mut self, call: CallId);
    fn reject_call(&mut self, call: CallId);
    fn end_call(&mut self, call: CallId);
    fn create_stream(
        &mut self,
        call: CallId,
        kind: MediaKind,
        direction: StreamDirection,
    ) -> MediaStreamId;
    fn remove_stream(&mut self, call: CallId, stream: MediaStreamId);
    fn set_stream_direction(
        &mut self,
        call: CallId,
        stream: MediaStreamId,
        direction: StreamDirection,
    );

    // File transfers
    fn send_file(&mut self, peer: &ContactKey, filename: &str, size: u64) -> TransferId;
    fn accept_transfer(&mut self, transfer: TransferId);
    fn cancel_transfer(&mut self, transfer: TransferId);
    /// Hand over the local socket the transfer's bytes flow through.
    fn attach_transfer_socket(&mut self, transfer: TransferId, socket: TcpStream);

    // Mailbox
    /// Answered later by [`AccountEvent::InboxUrlReady`].
    fn request_inbox_url(&mut self);

    // Display pictures
    /// Fetch the picture named by `token`. Answered later by
    /// [`AccountEvent::AvatarRetrieved`] when the peer sends it.
    fn request_avatar(&mut self, contact: &ContactKey, token: &str);
    /// Publish a new display picture for the local user; returns its token.
    fn set_avatar(&mut self, data: &[u8]) -> String;
    fn clear_avatar(&mut self);
}
