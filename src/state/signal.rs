//! Signals emitted to observers.
//!
//! Handlers never talk to observers directly: they push [`Signal`]s into the
//! connection's [`Outbox`] and the actor drains it after each event, so
//! observers see signals in exactly the order the core produced them.

use imgate_account::{MediaKind, StreamDirection};
use serde::Serialize;

use super::channels::media::{CallPhase, PendingSend, StreamState};
use super::channels::text::{ChatState, MessageKind, PendingMessage};
use super::channels::transfer::{TransferState, TransferStateReason};
use super::channels::{ChannelId, ChannelSummary};
use super::handle::HandleId;
use super::lifecycle::{ConnectionStatus, StatusReason};
use super::mail::Mail;
use super::presence::SimplePresence;
use super::roster::MembersChange;
use super::capabilities::CapabilityChange;

/// Everything observers can see happen.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Signal {
    StatusChanged {
        status: ConnectionStatus,
        reason: StatusReason,
    },
    NewChannels(Vec<ChannelSummary>),
    Closed {
        channel: ChannelId,
    },
    MembersChanged {
        channel: ChannelId,
        #[serde(flatten)]
        change: MembersChange,
    },

    // Text
    Sent {
        channel: ChannelId,
        timestamp: i64,
        kind: MessageKind,
        text: String,
    },
    Received {
        channel: ChannelId,
        #[serde(flatten)]
        message: PendingMessage,
    },
    ChatStateChanged {
        channel: ChannelId,
        contact: HandleId,
        state: ChatState,
    },

    // Media
    CallStateChanged {
        channel: ChannelId,
        contact: HandleId,
        state: CallPhase,
    },
    StreamAdded {
        channel: ChannelId,
        stream: u32,
        contact: HandleId,
        kind: MediaKind,
    },
    StreamRemoved {
        channel: ChannelId,
        stream: u32,
    },
    StreamDirectionChanged {
        channel: ChannelId,
        stream: u32,
        direction: StreamDirection,
        pending_send: PendingSend,
    },
    StreamStateChanged {
        channel: ChannelId,
        stream: u32,
        state: StreamState,
    },

    // File transfer
    FileTransferStateChanged {
        channel: ChannelId,
        state: TransferState,
        reason: TransferStateReason,
    },
    TransferredBytesChanged {
        channel: ChannelId,
        count: u64,
    },
    InitialOffsetDefined {
        channel: ChannelId,
        offset: u64,
    },

    // Connection-wide
    PresencesChanged(Vec<(HandleId, SimplePresence)>),
    AliasesChanged(Vec<(HandleId, String)>),
    CapabilitiesChanged(Vec<CapabilityChange>),
    /// A contact's picture token changed; empty when they dropped it.
    AvatarUpdated {
        contact: HandleId,
        token: String,
    },
    AvatarRetrieved {
        contact: HandleId,
        token: String,
        #[serde(serialize_with = "crate::state::avatars::serialize_bytes")]
        data: Vec<u8>,
        mime_type: String,
    },
    UnreadMailsChanged {
        count: u32,
    },
    MailsReceived(Vec<Mail>),
}

impl Signal {
    /// The channel a signal belongs to, if any.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Self::Closed { channel }
            | Self::MembersChanged { channel, .. }
            | Self::Sent { channel, .. }
            | Self::Received { channel, .. }
            | Self::ChatStateChanged { channel, .. }
            | Self::CallStateChanged { channel, .. }
            | Self::StreamAdded { channel, .. }
            | Self::StreamRemoved { channel, .. }
            | Self::StreamDirectionChanged { channel, .. }
            | Self::StreamStateChanged { channel, .. }
            | Self::FileTransferStateChanged { channel, .. }
            | Self::TransferredBytesChanged { channel, .. }
            | Self::InitialOffsetDefined { channel, .. } => Some(*channel),
            _ => None,
        }
    }
}

/// Ordered buffer of signals produced while handling one event.
#[derive(Debug, Default)]
pub struct Outbox {
    signals: Vec<Signal>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signal: Signal) {
        self.signals.push(signal);
    }

    pub fn drain(&mut self) -> Vec<Signal> {
        std::mem::take(&mut self.signals)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Signal> {
        self.signals.iter()
    }

    pub fn len(&self) -> usize {
        self.signals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.is_empty()
    }
}
