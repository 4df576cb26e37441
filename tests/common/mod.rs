//! Integration test common infrastructure.
//!
//! Provides an in-process connection core driven by a loopback account,
//! and a gateway-level observer for asserting on signal flows.

pub mod connection;
pub mod gateway;

#[allow(unused_imports)]
pub use connection::TestConnection;
#[allow(unused_imports)]
pub use gateway::{SharedFactory, TestObserver};
