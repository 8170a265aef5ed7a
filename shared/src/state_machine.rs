//! Link State Machine
//!
//! Defines the valid connection-state transitions for the single terminal
//! link. The connection manager is the only caller; it feeds events in and
//! publishes whatever state comes out.

/// Lifecycle state of the terminal link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Nothing in progress
    #[default]
    Idle,
    /// Radio scan running
    Scanning,
    /// Socket handshake in progress
    Connecting,
    /// Transfer channel live
    Connected,
    /// Manager released, no further transitions
    Disconnected,
}

/// Events that can trigger state transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Discovery started
    ScanStarted,
    /// Discovery stopped by the caller or after a match
    ScanStopped,
    /// Scan-for-name gave up
    ScanTimedOut,
    /// A connect attempt began
    ConnectRequested,
    /// Socket handshake succeeded
    Established,
    /// Socket handshake failed
    ConnectFailed,
    /// Read loop ended without the caller asking
    ChannelLost,
    /// Caller closed the connection
    CloseRequested,
    /// Manager shut down
    Released,
}

/// Result of a state transition attempt
#[derive(Debug, Clone)]
pub enum TransitionResult {
    /// Transition was valid; carries the (possibly unchanged) state
    Success(ConnectionState),
    /// Transition was invalid from current state
    Invalid {
        from: ConnectionState,
        event: LinkEvent,
    },
}

/// The connection state machine
#[derive(Debug, Default)]
pub struct ConnectionStateMachine {
    current_state: ConnectionState,
}

impl ConnectionStateMachine {
    /// Create a new state machine in Idle state
    pub fn new() -> Self {
        Self {
            current_state: ConnectionState::Idle,
        }
    }

    /// Get current state
    pub fn state(&self) -> ConnectionState {
        self.current_state
    }

    /// Process an event and return the transition result
    pub fn process_event(&mut self, event: LinkEvent) -> TransitionResult {
        match self.next_state(&event) {
            Some(state) => {
                self.current_state = state;
                TransitionResult::Success(state)
            }
            None => TransitionResult::Invalid {
                from: self.current_state,
                event,
            },
        }
    }

    /// Get the next state for a given event, if the transition is valid
    fn next_state(&self, event: &LinkEvent) -> Option<ConnectionState> {
        use ConnectionState::*;
        use LinkEvent::*;

        match (self.current_state, event) {
            // Released is terminal
            (Disconnected, _) => None,
            (_, Released) => Some(Disconnected),

            (Idle, ScanStarted) => Some(Scanning),
            (Scanning, ScanStarted) => Some(Scanning),
            (Scanning | Idle, ScanStopped | ScanTimedOut) => Some(Idle),

            // A new attempt supersedes whatever was running
            (Idle | Scanning | Connecting | Connected, ConnectRequested) => Some(Connecting),
            (Connecting, Established) => Some(Connected),
            (Connecting, ConnectFailed) => Some(Idle),

            (Connected, ChannelLost) => Some(Idle),
            (Idle | Connecting | Connected, CloseRequested) => Some(Idle),

            // Invalid transition
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let fsm = ConnectionStateMachine::new();
        assert_eq!(fsm.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_scan_connect_flow() {
        let mut fsm = ConnectionStateMachine::new();

        let result = fsm.process_event(LinkEvent::ScanStarted);
        assert!(matches!(result, TransitionResult::Success(ConnectionState::Scanning)));

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert!(matches!(result, TransitionResult::Success(ConnectionState::Connecting)));

        let result = fsm.process_event(LinkEvent::Established);
        assert!(matches!(result, TransitionResult::Success(ConnectionState::Connected)));

        let result = fsm.process_event(LinkEvent::ChannelLost);
        assert!(matches!(result, TransitionResult::Success(ConnectionState::Idle)));
    }

    #[test]
    fn test_scan_timeout_returns_to_idle() {
        let mut fsm = ConnectionStateMachine::new();
        fsm.process_event(LinkEvent::ScanStarted);

        let result = fsm.process_event(LinkEvent::ScanTimedOut);
        assert!(matches!(result, TransitionResult::Success(ConnectionState::Idle)));
    }

    #[test]
    fn test_connect_failure_returns_to_idle() {
        let mut fsm = ConnectionStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);

        let result = fsm.process_event(LinkEvent::ConnectFailed);
        assert!(matches!(result, TransitionResult::Success(ConnectionState::Idle)));
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut fsm = ConnectionStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::Established);

        fsm.process_event(LinkEvent::CloseRequested);
        let result = fsm.process_event(LinkEvent::CloseRequested);
        assert!(matches!(result, TransitionResult::Success(ConnectionState::Idle)));
    }

    #[test]
    fn test_scan_does_not_leave_connected() {
        let mut fsm = ConnectionStateMachine::new();
        fsm.process_event(LinkEvent::ConnectRequested);
        fsm.process_event(LinkEvent::Established);

        let result = fsm.process_event(LinkEvent::ScanStarted);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_released_is_terminal() {
        let mut fsm = ConnectionStateMachine::new();
        let result = fsm.process_event(LinkEvent::Released);
        assert!(matches!(result, TransitionResult::Success(ConnectionState::Disconnected)));

        let result = fsm.process_event(LinkEvent::ConnectRequested);
        assert!(matches!(result, TransitionResult::Invalid { .. }));
        assert_eq!(fsm.state(), ConnectionState::Disconnected);
    }
}
