//! Gateway - the connection manager.
//!
//! The Gateway validates connection parameters, builds an account client
//! through an [`AccountFactory`], spawns a [`ConnectionActor`] per account
//! and keeps the table of live connections. A connection leaves the table
//! on its own once its actor stops.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use imgate_account::{AccountClient, MemoryAccount};
use tracing::{info, instrument, warn};

use super::params::{self, ConnectionParams, ParamSpec, ParamValue};
use crate::config::Config;
use crate::error::{GatewayError, GatewayResult};
use crate::state::{ChannelSettings, Connection, ConnectionActor, ConnectionHandle, ConnectionId};

/// Builds the account client a new connection drives.
pub trait AccountFactory: Send + Sync {
    fn create(&self, params: &ConnectionParams) -> Box<dyn AccountClient>;
}

/// Factory for in-memory accounts that answer their own commands.
#[derive(Debug, Default)]
pub struct LoopbackFactory;

impl AccountFactory for LoopbackFactory {
    fn create(&self, params: &ConnectionParams) -> Box<dyn AccountClient> {
        Box::new(MemoryAccount::loopback(params.account.clone()))
    }
}

/// The connection manager.
#[derive(Clone)]
pub struct Gateway {
    connections: Arc<DashMap<ConnectionId, ConnectionHandle>>,
    factory: Arc<dyn AccountFactory>,
    settings: ChannelSettings,
    transfer_ip: IpAddr,
}

impl Gateway {
    pub fn new(factory: Arc<dyn AccountFactory>, config: &Config) -> Self {
        Self {
            connections: Arc::new(DashMap::new()),
            factory,
            settings: ChannelSettings::from(&config.timers),
            transfer_ip: config.transfer.bind_address,
        }
    }

    /// Gateway on top of [`LoopbackFactory`].
    pub fn loopback(config: &Config) -> Self {
        Self::new(Arc::new(LoopbackFactory), config)
    }

    /// Describe the parameters `protocol` accepts.
    pub fn parameters(&self, protocol: &str) -> GatewayResult<&'static [ParamSpec]> {
        params::parameters(protocol)
    }

    /// Validate `params`, then create and register a connection. The
    /// connection starts disconnected.
    #[instrument(skip(self, params))]
    pub fn request_connection(
        &self,
        protocol: &str,
        params: &BTreeMap<String, ParamValue>,
    ) -> GatewayResult<ConnectionHandle> {
        params::parameters(protocol)?;
        let params = ConnectionParams::from_map(params)?;

        if self
            .connections
            .iter()
            .any(|entry| entry.value().account() == params.account)
        {
            return Err(GatewayError::not_available(format!(
                "a connection for '{}' already exists",
                params.account
            )));
        }

        let account = self.factory.create(&params);
        let (core, events) = Connection::new(account, &params, self.settings.clone())?;
        let id = ConnectionId::new();
        let (handle, task) = ConnectionActor::spawn(id, core, events, self.transfer_ip);
        self.connections.insert(id, handle.clone());

        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                warn!(connection = %id, error = %e, "connection actor failed");
            }
            if connections.remove(&id).is_some() {
                info!(connection = %id, "connection removed");
            }
        });

        info!(connection = %id, account = %params.account, "connection created");
        Ok(handle)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.get(id).map(|entry| entry.value().clone())
    }

    pub fn connections(&self) -> Vec<ConnectionHandle> {
        self.connections
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Forget a connection. Its actor keeps running until it stops.
    pub fn disconnected(&self, id: &ConnectionId) -> Option<ConnectionHandle> {
        self.connections.remove(id).map(|(_, handle)| handle)
    }

    /// Disconnect every connection and stop its actor.
    pub async fn quit(&self) {
        let handles = self.connections();
        info!(count = handles.len(), "disconnecting all connections");
        for handle in handles {
            handle.shutdown().await;
            self.connections.remove(&handle.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_params(account: &str) -> BTreeMap<String, ParamValue> {
        BTreeMap::from([
            ("account".to_string(), ParamValue::from(account)),
            ("password".to_string(), ParamValue::from("secret")),
        ])
    }

    #[tokio::test]
    async fn request_connection_registers_handle() {
        let gateway = Gateway::loopback(&Config::default());
        let handle = gateway
            .request_connection("msn", &account_params("me@example.com"))
            .unwrap();
        assert_eq!(handle.account(), "me@example.com");
        assert!(gateway.get(&handle.id()).is_some());
        assert_eq!(gateway.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_account_is_not_available() {
        let gateway = Gateway::loopback(&Config::default());
        gateway
            .request_connection("msn", &account_params("me@example.com"))
            .unwrap();
        let err = gateway
            .request_connection("msn", &account_params("me@example.com"))
            .unwrap_err();
        assert_eq!(err.error_code(), "not_available");
    }

    #[tokio::test]
    async fn unknown_protocol_is_unimplemented() {
        let gateway = Gateway::loopback(&Config::default());
        let err = gateway
            .request_connection("irc", &account_params("me@example.com"))
            .unwrap_err();
        assert_eq!(err.error_code(), "not_implemented");
    }

    #[tokio::test]
    async fn missing_password_is_invalid() {
        let gateway = Gateway::loopback(&Config::default());
        let params = BTreeMap::from([("account".to_string(), ParamValue::from("me@example.com"))]);
        let err = gateway.request_connection("msn", &params).unwrap_err();
        assert_eq!(err.error_code(), "invalid_argument");
    }

    #[tokio::test]
    async fn quit_empties_the_table() {
        let gateway = Gateway::loopback(&Config::default());
        let handle = gateway
            .request_connection("msn", &account_params("me@example.com"))
            .unwrap();
        handle.connect().await.unwrap();
        gateway.quit().await;
        assert!(gateway.is_empty());
        assert!(handle.status().await.is_err());
    }
}
