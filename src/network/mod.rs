//! Network module.
//!
//! Contains the Gateway (connection manager), connection parameters and
//! file-transfer rendezvous sockets.

mod gateway;
pub mod params;
pub mod transfer;

pub use gateway::{AccountFactory, Gateway, LoopbackFactory};
pub use params::{ConnectionParams, PROTOCOL, ParamSpec, ParamValue};
