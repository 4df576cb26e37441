//! Gateway-level test helpers.
//!
//! [`SharedFactory`] hands the gateway a loopback account the test keeps a
//! clone of; [`TestObserver`] waits on a connection's signal stream.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use imgate::config::Config;
use imgate::network::{AccountFactory, ConnectionParams, Gateway, ParamValue};
use imgate::state::{ConnectionHandle, Signal};
use imgate_account::{AccountClient, MemoryAccount};
use tokio::sync::broadcast;
use tokio::time::timeout;

/// Every connection the gateway creates drives the same account state.
pub struct SharedFactory(pub MemoryAccount);

impl AccountFactory for SharedFactory {
    fn create(&self, _params: &ConnectionParams) -> Box<dyn AccountClient> {
        Box::new(self.0.clone())
    }
}

/// A gateway over a shared loopback account, plus that account.
pub fn shared_gateway(account: &str) -> (Gateway, MemoryAccount) {
    let memory = MemoryAccount::loopback(account);
    let gateway = Gateway::new(
        Arc::new(SharedFactory(memory.clone())),
        &Config::default(),
    );
    (gateway, memory)
}

pub fn account_params(account: &str) -> BTreeMap<String, ParamValue> {
    BTreeMap::from([
        ("account".to_string(), ParamValue::from(account)),
        ("password".to_string(), ParamValue::from("secret")),
    ])
}

/// Signal subscriber with timeouts.
pub struct TestObserver {
    signals: broadcast::Receiver<Signal>,
}

impl TestObserver {
    pub fn new(handle: &ConnectionHandle) -> Self {
        Self {
            signals: handle.subscribe(),
        }
    }

    /// Receive a single signal.
    pub async fn recv(&mut self) -> anyhow::Result<Signal> {
        self.recv_timeout(Duration::from_secs(5)).await
    }

    pub async fn recv_timeout(&mut self, dur: Duration) -> anyhow::Result<Signal> {
        Ok(timeout(dur, self.signals.recv()).await??)
    }

    /// Receive signals until the predicate matches; returns all of them.
    pub async fn recv_until<F>(&mut self, mut predicate: F) -> anyhow::Result<Vec<Signal>>
    where
        F: FnMut(&Signal) -> bool,
    {
        let mut signals = Vec::new();
        loop {
            let signal = self.recv().await?;
            let done = predicate(&signal);
            signals.push(signal);
            if done {
                return Ok(signals);
            }
        }
    }
}
