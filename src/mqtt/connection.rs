//! Pure connection state management for the MQTT worker.
//!
//! The lifecycle is modeled as a state enum plus an explicit transition
//! function returning the side effects the worker must perform. Nothing in
//! here touches a socket, which keeps the reconnect and handshake rules
//! testable without a broker.

use std::fmt;
use std::time::Duration;

/// Reconnects are capped; the counter resets only on reaching `Ready`.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Fixed delay before a scheduled reconnect, matching the device firmware's
/// expectations. Not an exponential backoff.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Transport dial timeout. A dial exceeding this feeds the reconnect path.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Why a connection attempt ended in `Failed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// Broker refused the CONNECT with a non-zero return code. Fatal for
    /// the attempt; the operator must call `connect()` again after fixing
    /// credentials, so bad credentials never hot-loop.
    Auth { code: u8 },

    /// All reconnect attempts were used up without reaching `Ready`.
    ReconnectExhausted,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Auth { code } => {
                write!(
                    f,
                    "authentication failed: {} (code {})",
                    connack_error_description(*code),
                    code
                )
            }
            FailureReason::ReconnectExhausted => write!(f, "reconnect attempts exhausted"),
        }
    }
}

/// Connection lifecycle states. Exactly one instance exists, owned by the
/// worker task; observers see it through a watch channel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    /// Dialing or waiting out the reconnect delay, with the attempt number.
    Connecting(u32),
    /// CONNECT sent, waiting for CONNACK.
    Handshaking,
    /// CONNACK accepted, SUBSCRIBE frames going out.
    SubscribingTopics,
    /// Session established, receive loop running.
    Ready,
    Failed(FailureReason),
    /// Torn down by an explicit `disconnect()` while something was active.
    Cancelled,
}

impl ConnectionState {
    /// One-line status text for the presentation layer.
    pub fn status_text(&self) -> String {
        match self {
            ConnectionState::Disconnected => "disconnected".to_string(),
            ConnectionState::Connecting(attempt) => {
                format!("connecting... ({}/{})", attempt, MAX_RECONNECT_ATTEMPTS)
            }
            ConnectionState::Handshaking => "performing MQTT handshake".to_string(),
            ConnectionState::SubscribingTopics => "subscribing to topics".to_string(),
            ConnectionState::Ready => "connected".to_string(),
            ConnectionState::Failed(reason) => reason.to_string(),
            ConnectionState::Cancelled => "connection cancelled".to_string(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

/// Inputs to the state machine, produced by operator commands, the
/// transport and the reconnect timer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    ConnectRequested,
    DisconnectRequested,
    /// TCP stream established.
    TransportReady,
    /// Dial failure, dial timeout, stream error or EOF.
    TransportFailed,
    /// CONNACK received with its return code.
    ConnAck(u8),
    /// Both SUBSCRIBE frames have been written (fire-and-forget, SUBACK is
    /// never awaited).
    SubscriptionsSent,
    /// The fixed reconnect delay elapsed.
    ReconnectDue,
}

/// Side effects the worker has to carry out after a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Open the TCP transport (bounded by [`CONNECT_TIMEOUT`]).
    Dial,
    SendConnect,
    SendSubscriptions,
    /// Start the fixed [`RECONNECT_DELAY`] timer.
    ScheduleReconnect,
    /// Cancel a pending reconnect timer, if any.
    CancelReconnect,
    /// Close the transport and stop the receive loop.
    Teardown,
}

/// State value plus the attempt counter that survives across the
/// `Failed -> Connecting` reconnect edge.
#[derive(Debug, Default)]
pub struct ConnectionMachine {
    state: ConnectionState,
    attempts: u32,
}

impl ConnectionMachine {
    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Applies one event and returns the side effects to perform. Events
    /// that make no sense in the current state (a stale CONNACK, a timer
    /// from a superseded attempt) are dropped without changing state.
    pub fn handle(&mut self, event: ConnectionEvent) -> Vec<Action> {
        match (&self.state, event) {
            // Operator starts a fresh attempt cycle. Also the manual
            // recovery path out of Failed.
            (
                ConnectionState::Disconnected
                | ConnectionState::Cancelled
                | ConnectionState::Failed(_),
                ConnectionEvent::ConnectRequested,
            ) => {
                self.attempts = 1;
                self.state = ConnectionState::Connecting(1);
                vec![Action::Dial]
            }
            // connect() while something is already running is a no-op.
            (_, ConnectionEvent::ConnectRequested) => vec![],

            (ConnectionState::Disconnected, ConnectionEvent::DisconnectRequested) => {
                vec![Action::CancelReconnect]
            }
            (ConnectionState::Cancelled, ConnectionEvent::DisconnectRequested) => {
                self.state = ConnectionState::Disconnected;
                vec![Action::CancelReconnect]
            }
            (_, ConnectionEvent::DisconnectRequested) => {
                self.state = ConnectionState::Cancelled;
                vec![Action::CancelReconnect, Action::Teardown]
            }

            (ConnectionState::Connecting(_), ConnectionEvent::TransportReady) => {
                self.state = ConnectionState::Handshaking;
                vec![Action::SendConnect]
            }

            (ConnectionState::Connecting(_), ConnectionEvent::ReconnectDue) => {
                vec![Action::Dial]
            }

            (ConnectionState::Handshaking, ConnectionEvent::ConnAck(0)) => {
                self.state = ConnectionState::SubscribingTopics;
                vec![Action::SendSubscriptions]
            }
            // Non-zero return code: fatal for this attempt, no auto-retry.
            (ConnectionState::Handshaking, ConnectionEvent::ConnAck(code)) => {
                self.state = ConnectionState::Failed(FailureReason::Auth { code });
                vec![Action::Teardown]
            }

            (ConnectionState::SubscribingTopics, ConnectionEvent::SubscriptionsSent) => {
                self.attempts = 0;
                self.state = ConnectionState::Ready;
                vec![]
            }

            (
                ConnectionState::Connecting(_)
                | ConnectionState::Handshaking
                | ConnectionState::SubscribingTopics
                | ConnectionState::Ready,
                ConnectionEvent::TransportFailed,
            ) => {
                if self.attempts < MAX_RECONNECT_ATTEMPTS {
                    self.attempts += 1;
                    self.state = ConnectionState::Connecting(self.attempts);
                    vec![Action::Teardown, Action::ScheduleReconnect]
                } else {
                    self.state = ConnectionState::Failed(FailureReason::ReconnectExhausted);
                    vec![Action::Teardown]
                }
            }

            // Everything else is stale input for the current state.
            (_, event) => {
                tracing::debug!("ignoring {:?} in state {:?}", event, self.state);
                vec![]
            }
        }
    }
}

/// Human-readable description for a CONNACK return code.
pub fn connack_error_description(code: u8) -> &'static str {
    match code {
        0 => "connection accepted",
        1 => "unacceptable protocol version",
        2 => "client identifier rejected",
        3 => "server unavailable",
        4 => "bad user name or password",
        5 => "not authorized",
        _ => "unknown error",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connect(machine: &mut ConnectionMachine) {
        let actions = machine.handle(ConnectionEvent::ConnectRequested);
        assert_eq!(actions, vec![Action::Dial]);
    }

    #[test]
    fn accepted_connack_walks_to_ready() {
        let mut machine = ConnectionMachine::default();
        connect(&mut machine);

        assert_eq!(
            machine.handle(ConnectionEvent::TransportReady),
            vec![Action::SendConnect]
        );
        assert_eq!(machine.state(), &ConnectionState::Handshaking);

        // CONNACK [0x20, 0x02, 0x00, 0x00] decodes to return code 0.
        assert_eq!(
            machine.handle(ConnectionEvent::ConnAck(0)),
            vec![Action::SendSubscriptions]
        );
        assert_eq!(machine.state(), &ConnectionState::SubscribingTopics);

        machine.handle(ConnectionEvent::SubscriptionsSent);
        assert_eq!(machine.state(), &ConnectionState::Ready);
        assert_eq!(machine.attempts(), 0, "counter resets on Ready");
    }

    #[test]
    fn rejected_connack_is_fatal_without_retry() {
        let mut machine = ConnectionMachine::default();
        connect(&mut machine);
        machine.handle(ConnectionEvent::TransportReady);

        let actions = machine.handle(ConnectionEvent::ConnAck(5));
        assert_eq!(
            machine.state(),
            &ConnectionState::Failed(FailureReason::Auth { code: 5 })
        );
        assert!(
            !actions.contains(&Action::ScheduleReconnect),
            "auth failure must not hot-loop"
        );
        assert_eq!(
            machine.state().status_text(),
            "authentication failed: not authorized (code 5)"
        );
    }

    #[test]
    fn five_transport_failures_exhaust_reconnects() {
        let mut machine = ConnectionMachine::default();
        connect(&mut machine);

        for failure in 1..MAX_RECONNECT_ATTEMPTS {
            let actions = machine.handle(ConnectionEvent::TransportFailed);
            assert!(actions.contains(&Action::ScheduleReconnect));
            assert_eq!(machine.state(), &ConnectionState::Connecting(failure + 1));
            machine.handle(ConnectionEvent::ReconnectDue);
        }

        // Fifth consecutive failure: terminal, no sixth timer.
        let actions = machine.handle(ConnectionEvent::TransportFailed);
        assert!(!actions.contains(&Action::ScheduleReconnect));
        assert_eq!(
            machine.state(),
            &ConnectionState::Failed(FailureReason::ReconnectExhausted)
        );

        // A late timer from the previous attempt is ignored.
        assert_eq!(machine.handle(ConnectionEvent::ReconnectDue), vec![]);

        // Manual connect() starts a fresh cycle.
        connect(&mut machine);
        assert_eq!(machine.state(), &ConnectionState::Connecting(1));
        assert_eq!(machine.attempts(), 1);
    }

    #[test]
    fn failure_mid_session_schedules_reconnect() {
        let mut machine = ConnectionMachine::default();
        connect(&mut machine);
        machine.handle(ConnectionEvent::TransportReady);
        machine.handle(ConnectionEvent::ConnAck(0));
        machine.handle(ConnectionEvent::SubscriptionsSent);
        assert!(machine.state().is_ready());

        let actions = machine.handle(ConnectionEvent::TransportFailed);
        assert_eq!(actions, vec![Action::Teardown, Action::ScheduleReconnect]);
        assert_eq!(machine.state(), &ConnectionState::Connecting(1));
    }

    #[test]
    fn disconnect_twice_settles_on_disconnected() {
        let mut machine = ConnectionMachine::default();
        connect(&mut machine);
        machine.handle(ConnectionEvent::TransportReady);

        let actions = machine.handle(ConnectionEvent::DisconnectRequested);
        assert_eq!(actions, vec![Action::CancelReconnect, Action::Teardown]);
        assert_eq!(machine.state(), &ConnectionState::Cancelled);

        let actions = machine.handle(ConnectionEvent::DisconnectRequested);
        assert_eq!(actions, vec![Action::CancelReconnect]);
        assert_eq!(machine.state(), &ConnectionState::Disconnected);

        // Idempotent from here on, and never schedules anything.
        let actions = machine.handle(ConnectionEvent::DisconnectRequested);
        assert_eq!(machine.state(), &ConnectionState::Disconnected);
        assert!(!actions.contains(&Action::ScheduleReconnect));
    }

    #[test]
    fn connect_while_active_is_ignored() {
        let mut machine = ConnectionMachine::default();
        connect(&mut machine);
        machine.handle(ConnectionEvent::TransportReady);

        assert_eq!(machine.handle(ConnectionEvent::ConnectRequested), vec![]);
        assert_eq!(machine.state(), &ConnectionState::Handshaking);
    }

    #[test]
    fn stale_connack_outside_handshake_is_dropped() {
        let mut machine = ConnectionMachine::default();
        assert_eq!(machine.handle(ConnectionEvent::ConnAck(0)), vec![]);
        assert_eq!(machine.state(), &ConnectionState::Disconnected);
    }
}
