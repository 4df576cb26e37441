//! imgate - instant-messaging account gateway.
//!
//! Exposes a messenger account's presence, contact lists, conversations,
//! audio/video calls and file transfers as typed channels driven through a
//! control surface.

pub mod config;
pub mod control;
pub mod error;
pub mod network;
pub mod state;
pub mod telemetry;

pub use error::{GatewayError, GatewayResult};
