//! Connection core test harness.
//!
//! Wraps a [`Connection`] around a loopback [`MemoryAccount`] and pumps
//! the account's events back into the core, collecting every signal.

use std::collections::BTreeMap;

use imgate::network::{ConnectionParams, ParamValue};
use imgate::state::{
    AccountEvents, ChannelId, ChannelSettings, ChannelSummary, Connection, HandleId, HandleType,
    Signal,
};
use imgate_account::{
    AccountEvent, Contact, ContactKey, MemoryAccount, Memberships, Outbound, Presence,
};

pub const ACCOUNT: &str = "me@example.com";

pub struct TestConnection {
    /// Shares state with the client the core owns.
    pub account: MemoryAccount,
    pub conn: Connection,
    events: AccountEvents,
    signals: Vec<Signal>,
}

impl TestConnection {
    /// A disconnected core on a fresh loopback account.
    pub fn new() -> Self {
        Self::with_account(MemoryAccount::loopback(ACCOUNT))
    }

    pub fn with_account(account: MemoryAccount) -> Self {
        let params = BTreeMap::from([
            ("account".to_string(), ParamValue::from(ACCOUNT)),
            ("password".to_string(), ParamValue::from("secret")),
        ]);
        let params = ConnectionParams::from_map(&params).expect("valid parameters");
        let (conn, events) = Connection::new(
            Box::new(account.clone()),
            &params,
            ChannelSettings::default(),
        )
        .expect("connection");
        Self {
            account,
            conn,
            events,
            signals: Vec::new(),
        }
    }

    /// Log in and process the whole login walk.
    pub fn connected() -> Self {
        let mut t = Self::new();
        t.connect();
        t
    }

    pub fn connect(&mut self) {
        self.conn.connect().expect("connect");
        self.pump();
    }

    /// Feed queued account events to the core until none are left.
    /// Returns the signals produced since the last pump.
    pub fn pump(&mut self) -> Vec<Signal> {
        let mut produced = self.conn.drain_signals();
        while let Ok(event) = self.events.try_recv() {
            self.conn.handle_account_event(event);
            produced.extend(self.conn.drain_signals());
        }
        self.signals.extend(produced.iter().cloned());
        produced
    }

    /// Inject an event as if the service had sent it, then pump.
    pub fn emit(&mut self, event: AccountEvent) -> Vec<Signal> {
        self.account.emit(event);
        self.pump()
    }

    /// Every signal seen so far, draining the log.
    pub fn take_signals(&mut self) -> Vec<Signal> {
        self.pump();
        std::mem::take(&mut self.signals)
    }

    pub fn take_outbound(&self) -> Vec<Outbound> {
        self.account.take_outbound()
    }

    pub fn key(name: &str) -> ContactKey {
        ContactKey::native(name)
    }

    /// Handle id for a contact, holding it for the test.
    pub fn contact(&mut self, name: &str) -> HandleId {
        self.handle(HandleType::Contact, name)
    }

    pub fn handle(&mut self, kind: HandleType, name: &str) -> HandleId {
        self.conn
            .request_handles(kind, &[name.to_string()])
            .expect("request handle")[0]
    }

    /// Put a contact in the address book.
    pub fn add_contact(&self, name: &str, presence: Presence, memberships: Memberships) {
        self.account.insert_contact(
            Contact::new(Self::key(name))
                .with_presence(presence)
                .with_memberships(memberships),
        );
    }

    /// An online contact we subscribe to, with its handle.
    pub fn online_contact(&mut self, name: &str) -> HandleId {
        self.add_contact(name, Presence::Online, Memberships::FORWARD | Memberships::ALLOW);
        self.contact(name)
    }

    /// The channels announced by `signals`, in order.
    pub fn announced(signals: &[Signal]) -> Vec<ChannelSummary> {
        signals
            .iter()
            .filter_map(|s| match s {
                Signal::NewChannels(channels) => Some(channels.clone()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    /// Signals that belong to `channel`.
    pub fn for_channel(signals: &[Signal], channel: ChannelId) -> Vec<Signal> {
        signals
            .iter()
            .filter(|s| s.channel() == Some(channel))
            .cloned()
            .collect()
    }
}

impl Default for TestConnection {
    fn default() -> Self {
        Self::new()
    }
}
