//! State management module.
//!
//! Contains the per-connection core, its channels and the actor that owns
//! it.

pub mod actor;
pub mod aliasing;
pub mod avatars;
pub mod capabilities;
pub mod channels;
mod connection;
pub mod contacts;
pub mod handle;
pub mod lifecycle;
pub mod mail;
pub mod managers;
pub mod presence;
pub mod roster;
pub mod signal;
pub mod timers;

pub use actor::{ConnectionActor, ConnectionCommand, ConnectionHandle, ConnectionId};
pub use channels::{ChannelId, ChannelKind, ChannelSettings, ChannelSummary};
pub use connection::{AccountEvents, Connection};
pub use handle::{HandleId, HandleType};
pub use lifecycle::{ConnectionStatus, StatusReason};
pub use signal::Signal;
