use std::fmt;
use std::str::FromStr;

use imgate_account::{MediaKind, StreamDirection};
use tokio::sync::oneshot;
use uuid::Uuid;

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

/// Identifier the gateway assigns to each connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ConnectionId {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| GatewayError::invalid_argument(format!("bad connection id '{s}'")))
    }
}

/// Reply channel for the result of one command.
pub type Reply<T> = oneshot::Sender<GatewayResult<T>>;

/// Commands that can be sent to a connection actor.
#[derive(Debug)]
pub enum ConnectionCommand {
    Connect {
        reply_tx: Reply<()>,
    },
    Disconnect {
        reply_tx: Reply<()>,
    },
    Status {
        reply_tx: Reply<ConnectionStatus>,
    },
    SelfHandle {
        reply_tx: Reply<HandleId>,
    },

    // Handles
    RequestHandles {
        kind: HandleType,
        names: Vec<String>,
        reply_tx: Reply<Vec<HandleId>>,
    },
    InspectHandles {
        kind: HandleType,
        ids: Vec<HandleId>,
        reply_tx: Reply<Vec<String>>,
    },
    ReleaseHandles {
        kind: HandleType,
        ids: Vec<HandleId>,
        reply_tx: Reply<()>,
    },

    // Channel requests
    RequestChannel {
        kind: ChannelKind,
        target_type: HandleType,
        target: HandleId,
        reply_tx: Reply<ChannelId>,
    },
    EnsureChannel {
        props: RequestProperties,
        reply_tx: Reply<(bool, ChannelSummary)>,
    },
    GetChannels {
        reply_tx: Reply<Vec<ChannelSummary>>,
    },
    Close {
        channel: ChannelId,
        reply_tx: Reply<()>,
    },

    // Text
    Send {
        channel: ChannelId,
        kind: MessageKind,
        text: String,
        reply_tx: Reply<()>,
    },
    SetChatState {
        channel: ChannelId,
        state: ChatState,
        reply_tx: Reply<()>,
    },
    AcknowledgePending {
        channel: ChannelId,
        ids: Vec<u32>,
        reply_tx: Reply<()>,
    },
    ListPending {
        channel: ChannelId,
        clear: bool,
        reply_tx: Reply<Vec<PendingMessage>>,
    },

    // Membership
    GetMembers {
        channel: ChannelId,
        reply_tx: Reply<MembersSnapshot>,
    },
    AddMembers {
        channel: ChannelId,
        handles: Vec<HandleId>,
        message: String,
        reply_tx: Reply<()>,
    },
    RemoveMembers {
        channel: ChannelId,
        handles: Vec<HandleId>,
        message: String,
        reply_tx: Reply<()>,
    },

    // Media
    ListStreams {
        channel: ChannelId,
        reply_tx: Reply<Vec<StreamInfo>>,
    },
    RequestStreams {
        channel: ChannelId,
        contact: HandleId,
        kinds: Vec<MediaKind>,
        reply_tx: Reply<Vec<StreamInfo>>,
    },
    RemoveStreams {
        channel: ChannelId,
        streams: Vec<u32>,
        reply_tx: Reply<()>,
    },
    RequestStreamDirection {
        channel: ChannelId,
        stream: u32,
        direction: StreamDirection,
        reply_tx: Reply<()>,
    },

    // File transfer
    TransferDetails {
        channel: ChannelId,
        reply_tx: Reply<TransferDetails>,
    },
    AcceptFile {
        channel: ChannelId,
        offset: u64,
        reply_tx: Reply<std::net::SocketAddr>,
    },
    ProvideFile {
        channel: ChannelId,
        reply_tx: Reply<std::net::SocketAddr>,
    },

    // Presence, aliases, capabilities
    SetPresence {
        status: String,
        message: String,
        reply_tx: Reply<()>,
    },
    GetPresences {
        handles: Vec<HandleId>,
        reply_tx: Reply<Vec<(HandleId, SimplePresence)>>,
    },
    GetAliases {
        handles: Vec<HandleId>,
        reply_tx: Reply<Vec<(HandleId, String)>>,
    },
    SetAliases {
        aliases: Vec<(HandleId, String)>,
        reply_tx: Reply<()>,
    },
    GetCapabilities {
        handles: Vec<HandleId>,
        reply_tx: Reply<Vec<Capability>>,
    },

    // Avatars and contact attributes
    GetKnownAvatarTokens {
        handles: Vec<HandleId>,
        reply_tx: Reply<Vec<(HandleId, String)>>,
    },
    RequestAvatars {
        handles: Vec<HandleId>,
        reply_tx: Reply<()>,
    },
    SetAvatar {
        data: Vec<u8>,
        mime_type: String,
        reply_tx: Reply<String>,
    },
    ClearAvatar {
        reply_tx: Reply<()>,
    },
    GetContactAttributes {
        handles: Vec<HandleId>,
        interfaces: Vec<ContactInterface>,
        hold: bool,
        reply_tx: Reply<Vec<ContactAttributes>>,
    },

    // Mail
    MailCapabilities {
        reply_tx: Reply<u32>,
    },
    UnreadMailCount {
        reply_tx: Reply<u32>,
    },
    RequestInboxUrl {
        reply_tx: Reply<MailUrl>,
    },
    RequestMailUrl {
        id: String,
        url_data: String,
        reply_tx: Reply<MailUrl>,
    },

    /// Disconnect if needed and stop the actor.
    Shutdown {
        reply_tx: oneshot::Sender<()>,
    },
}
