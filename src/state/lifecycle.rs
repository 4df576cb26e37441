//! Connection status and disconnect-reason latch.
//!
//! The public status only moves forward (disconnected, connecting,
//! connected) except for the terminal drop back to disconnected. The
//! synchronized step is internal: it creates the contact-list channels but
//! is never reported to observers.

use imgate_account::{ClientError, ClientState};
use serde::Serialize;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    #[default]
    Disconnected,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusReason {
    #[default]
    NoneSpecified,
    Requested,
    NetworkError,
    AuthenticationFailed,
    NameInUse,
}

impl From<&ClientError> for StatusReason {
    fn from(err: &ClientError) -> Self {
        match err {
            ClientError::Network(_) => Self::NetworkError,
            ClientError::Authentication => Self::AuthenticationFailed,
            ClientError::OtherClient => Self::NameInUse,
            ClientError::Protocol(_) => Self::NoneSpecified,
        }
    }
}

/// What the connection has to do after a client state change.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Report CONNECTING.
    Connecting,
    /// Create the contact-list channels.
    Synchronized,
    /// Apply deferred settings and report CONNECTED.
    Open,
    /// Report DISCONNECTED and tear down.
    Closed,
    /// Nothing to do.
    Ignore,
}

/// Sans-IO lifecycle tracker.
#[derive(Debug, Default)]
pub struct Lifecycle {
    status: ConnectionStatus,
    /// Login issued but not yet echoed as CONNECTING.
    login_requested: bool,
    synchronized: bool,
    reason: StatusReason,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }

    pub fn reason(&self) -> StatusReason {
        self.reason
    }

    /// A connect call is only honoured from DISCONNECTED with no login in
    /// flight; it clears the reason left over from the previous attempt.
    pub fn begin_connect(&mut self) -> bool {
        if self.status != ConnectionStatus::Disconnected || self.login_requested {
            return false;
        }
        self.login_requested = true;
        self.reason = StatusReason::NoneSpecified;
        true
    }

    pub fn login_requested(&self) -> bool {
        self.login_requested
    }

    /// Forget a login that never reached CONNECTING.
    pub fn cancel_connect(&mut self) {
        self.login_requested = false;
    }

    /// Latch why the connection is going down.
    pub fn latch(&mut self, reason: StatusReason) {
        self.reason = reason;
    }

    /// Feed a client state change; returns what has to happen.
    pub fn on_client_state(&mut self, state: ClientState) -> Transition {
        use ConnectionStatus::*;
        if matches!(state, ClientState::Connecting | ClientState::Closed) {
            self.login_requested = false;
        }
        match (state, self.status) {
            (ClientState::Connecting, Disconnected) => {
                self.status = Connecting;
                self.synchronized = false;
                Transition::Connecting
            }
            (ClientState::Synchronized, Connecting) if !self.synchronized => {
                self.synchronized = true;
                Transition::Synchronized
            }
            (ClientState::Open, Connecting) => {
                self.status = Connected;
                Transition::Open
            }
            (ClientState::Closed, Connecting | Connected) => {
                self.status = Disconnected;
                self.synchronized = false;
                Transition::Closed
            }
            _ => Transition::Ignore,
        }
    }

    /// Hand out the latched reason once and reset it.
    pub fn take_reason(&mut self) -> StatusReason {
        std::mem::take(&mut self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_session_walk() {
        let mut lc = Lifecycle::new();
        assert!(lc.begin_connect());
        assert_eq!(lc.on_client_state(ClientState::Connecting), Transition::Connecting);
        assert_eq!(lc.on_client_state(ClientState::Authenticating), Transition::Ignore);
        assert_eq!(
            lc.on_client_state(ClientState::Synchronized),
            Transition::Synchronized
        );
        assert_eq!(lc.status(), ConnectionStatus::Connecting);
        assert_eq!(lc.on_client_state(ClientState::Open), Transition::Open);
        assert!(lc.is_connected());
        assert_eq!(lc.on_client_state(ClientState::Closed), Transition::Closed);
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn out_of_order_states_are_ignored() {
        let mut lc = Lifecycle::new();
        assert_eq!(lc.on_client_state(ClientState::Open), Transition::Ignore);
        assert_eq!(lc.on_client_state(ClientState::Closed), Transition::Ignore);
        lc.on_client_state(ClientState::Connecting);
        lc.on_client_state(ClientState::Synchronized);
        assert_eq!(lc.on_client_state(ClientState::Synchronized), Transition::Ignore);
    }

    #[test]
    fn connect_only_from_disconnected() {
        let mut lc = Lifecycle::new();
        lc.latch(StatusReason::NetworkError);
        assert!(lc.begin_connect());
        assert_eq!(lc.reason(), StatusReason::NoneSpecified);
        lc.on_client_state(ClientState::Connecting);
        assert!(!lc.begin_connect());
    }

    #[test]
    fn second_connect_before_the_echo_is_refused() {
        let mut lc = Lifecycle::new();
        assert!(lc.begin_connect());
        assert_eq!(lc.status(), ConnectionStatus::Disconnected);
        assert!(!lc.begin_connect());

        // A login that fails before CONNECTING frees the slot again.
        assert_eq!(lc.on_client_state(ClientState::Closed), Transition::Ignore);
        assert!(!lc.login_requested());
        assert!(lc.begin_connect());
        lc.cancel_connect();
        assert!(lc.begin_connect());
    }

    #[test]
    fn reason_is_reported_once() {
        let mut lc = Lifecycle::new();
        lc.latch(StatusReason::AuthenticationFailed);
        assert_eq!(lc.take_reason(), StatusReason::AuthenticationFailed);
        assert_eq!(lc.take_reason(), StatusReason::NoneSpecified);
    }

    #[test]
    fn client_errors_map_to_reasons() {
        assert_eq!(
            StatusReason::from(&ClientError::OtherClient),
            StatusReason::NameInUse
        );
        assert_eq!(
            StatusReason::from(&ClientError::Network("reset".into())),
            StatusReason::NetworkError
        );
    }
}
