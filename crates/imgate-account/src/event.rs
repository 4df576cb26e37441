//! Inbound events produced by an account client.

use crate::state::{ClientError, ClientState};
use crate::types::{
    CallId, ContactKey, ConversationId, DisplayPicture, Group, GroupId, InboxUrl, MailMessage,
    MediaKind, MediaStreamId, OfflineMessage, StreamDirection, TransferId, TransferInfo,
};

/// Everything an account client reports back to the gateway.
///
/// Events only carry identifiers; the current state of a contact or
/// conversation is read from the client's snapshot queries when the event
/// is handled.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", content = "data", rename_all = "snake_case"))]
pub enum AccountEvent {
    StateChanged(ClientState),
    Error(ClientError),

    // Contacts and profile
    ProfilePresenceChanged,
    ContactPresenceChanged(ContactKey),
    ContactAliasChanged(ContactKey),
    ContactCapabilitiesChanged(ContactKey),
    ContactMembershipsChanged(ContactKey),
    /// The contact switched to another display picture, or dropped theirs.
    ContactAvatarChanged(ContactKey),
    AvatarRetrieved {
        contact: ContactKey,
        picture: DisplayPicture,
    },

    // Address book
    ContactAdded(ContactKey),
    ContactDeleted(ContactKey),
    ContactBlocked(ContactKey),
    ContactUnblocked(ContactKey),
    GroupAdded(Group),
    GroupDeleted(Group),
    GroupRenamed(Group),
    GroupContactAdded { group: GroupId, contact: ContactKey },
    GroupContactDeleted { group: GroupId, contact: ContactKey },

    // Conversations
    ConversationInvited(ConversationId),
    UserJoined {
        conversation: ConversationId,
        contact: ContactKey,
    },
    UserLeft {
        conversation: ConversationId,
        contact: ContactKey,
    },
    UserTyping {
        conversation: ConversationId,
        contact: ContactKey,
    },
    MessageReceived {
        conversation: ConversationId,
        sender: ContactKey,
        text: String,
    },
    NudgeReceived {
        conversation: ConversationId,
        sender: ContactKey,
    },
    OfflineMessagesReceived(Vec<OfflineMessage>),

    // Calls
    CallInvited { call: CallId, peer: ContactKey },
    CallRinging(CallId),
    CallAccepted(CallId),
    CallRejected(CallId),
    CallEnded(CallId),
    StreamCreated {
        call: CallId,
        stream: MediaStreamId,
        kind: MediaKind,
        direction: StreamDirection,
    },
    StreamRemoved {
        call: CallId,
        stream: MediaStreamId,
    },
    StreamDirectionChanged {
        call: CallId,
        stream: MediaStreamId,
        direction: StreamDirection,
    },
    StreamStateChanged {
        call: CallId,
        stream: MediaStreamId,
        connected: bool,
    },

    // File transfers
    TransferInvited(TransferInfo),
    TransferAccepted(TransferId),
    /// Cumulative byte count.
    TransferProgressed { transfer: TransferId, transferred: u64 },
    TransferCompleted(TransferId),
    TransferCancelled(TransferId),

    // Mailbox
    MailboxUnreadChanged(u32),
    MailReceived(MailMessage),
    InboxUrlReady(InboxUrl),
}

impl AccountEvent {
    /// Short name used in log fields.
    pub fn name(&self) -> &'static str {
        match self {
            Self::StateChanged(_) => "state_changed",
            Self::Error(_) => "error",
            Self::ProfilePresenceChanged => "profile_presence_changed",
            Self::ContactPresenceChanged(_) => "contact_presence_changed",
            Self::ContactAliasChanged(_) => "contact_alias_changed",
            Self::ContactCapabilitiesChanged(_) => "contact_capabilities_changed",
            Self::ContactMembershipsChanged(_) => "contact_memberships_changed",
            Self::ContactAvatarChanged(_) => "contact_avatar_changed",
            Self::AvatarRetrieved { .. } => "avatar_retrieved",
            Self::ContactAdded(_) => "contact_added",
            Self::ContactDeleted(_) => "contact_deleted",
            Self::ContactBlocked(_) => "contact_blocked",
            Self::ContactUnblocked(_) => "contact_unblocked",
            Self::GroupAdded(_) => "group_added",
            Self::GroupDeleted(_) => "group_deleted",
            Self::GroupRenamed(_) => "group_renamed",
            Self::GroupContactAdded { .. } => "group_contact_added",
            Self::GroupContactDeleted { .. } => "group_contact_deleted",
            Self::ConversationInvited(_) => "conversation_invited",
            Self::UserJoined { .. } => "user_joined",
            Self::UserLeft { .. } => "user_left",
            Self::UserTyping { .. } => "user_typing",
            Self::MessageReceived { .. } => "message_received",
            Self::NudgeReceived { .. } => "nudge_received",
            Self::OfflineMessagesReceived(_) => "offline_messages_received",
            Self::CallInvited { .. } => "call_invited",
            Self::CallRinging(_) => "call_ringing",
            Self::CallAccepted(_) => "call_accepted",
            Self::CallRejected(_) => "call_rejected",
            Self::CallEnded(_) => "call_ended",
            Self::StreamCreated { .. } => "stream_created",
            Self::StreamRemoved { .. } => "stream_removed",
            Self::StreamDirectionChanged { .. } => "stream_direction_changed",
            Self::StreamStateChanged { .. } => "stream_state_changed",
            Self::TransferInvited(_) => "transfer_invited",
            Self::TransferAccepted(_) => "transfer_accepted",
            Self::TransferProgressed { .. } => "transfer_progressed",
            Self::TransferCompleted(_) => "transfer_completed",
            Self::TransferCancelled(_) => "transfer_cancelled",
            Self::MailboxUnreadChanged(_) => "mailbox_unread_changed",
            Self::MailReceived(_) => "mail_received",
            Self::InboxUrlReady(_) => "inbox_url_ready",
        }
    }
}
