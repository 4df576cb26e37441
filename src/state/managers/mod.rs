//! Per-connection managers.
//!
//! `channel` owns the channel table and dispatch; `request` turns property
//! maps into typed channel requests.

pub mod channel;
pub mod request;

pub use channel::ChannelManager;
pub use request::{ChannelRequest, PropertyValue, RequestProperties, classify, props};
