//! # imgate-account
//!
//! The account-client surface of the imgate gateway.
//!
//! The gateway never speaks a messenger wire protocol itself. It drives an
//! [`AccountClient`]: an object that logs in, exposes a queryable snapshot
//! of the address book, conversations, mailbox and display pictures, accepts fire-and-forget
//! commands, and reports everything that happens as [`AccountEvent`]s on an
//! [`EventSink`].
//!
//! [`MemoryAccount`] is a complete in-process implementation used by the
//! test-suite and by the daemon's loopback mode.

#![deny(clippy::all)]

pub mod client;
pub mod error;
pub mod event;
pub mod memory;
pub mod state;
pub mod types;

pub use self::client::{AccountClient, EventSink, LoginParams, ProxyInfo, ProxyScheme};
pub use self::error::AccountError;
pub use self::event::AccountEvent;
pub use self::memory::{MemoryAccount, Outbound};
pub use self::state::{ClientError, ClientState};
pub use self::types::{
    CallId, ClientCapabilities, Contact, ContactKey, ConversationId, DisplayPicture, Group,
    GroupId, InboxUrl, MailMessage, MediaKind, MediaStreamId, Memberships, NetworkId,
    OfflineMessage, Presence, Profile, StreamDirection, TransferId, TransferInfo, picture_token,
};
