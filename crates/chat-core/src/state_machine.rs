use crate::{error::ChatError, types::ConnectionState};

/// Connection lifecycle state machine.
///
/// Every mutation goes through one of the transition methods; each returns the
/// new state or an invalid-state error and leaves the state untouched on error.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    retries_exhausted: bool,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Uninitialized,
            retries_exhausted: false,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether no automatic transition can leave the current state.
    pub fn is_terminal(&self) -> bool {
        match self.state {
            ConnectionState::ExpiredToken | ConnectionState::Ended => true,
            ConnectionState::FailedToConnect => self.retries_exhausted,
            _ => false,
        }
    }

    /// `start()`: begin a new session.
    pub fn start(&mut self) -> Result<ConnectionState, ChatError> {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Online
        ) {
            return Err(ChatError::invalid_state(self.state, "start"));
        }
        self.retries_exhausted = false;
        self.transition(ConnectionState::Connecting);
        Ok(self.state)
    }

    /// Transport reported the connection as ready.
    pub fn on_ready(&mut self) -> Result<ConnectionState, ChatError> {
        self.transition_from_state(
            ConnectionState::Connecting,
            ConnectionState::Online,
            "on_ready",
        )
    }

    /// Connect attempt failed, or an online connection dropped.
    ///
    /// `Online -> FailedToConnect` is the only way a live session reaches the
    /// retry path; the reconnect itself then goes through [`Self::on_retry`].
    pub fn on_connect_failed(&mut self) -> Result<ConnectionState, ChatError> {
        self.transition_from_any_of(
            &[ConnectionState::Connecting, ConnectionState::Online],
            ConnectionState::FailedToConnect,
            "on_connect_failed",
        )
    }

    /// Retry budget spent; `FailedToConnect` becomes terminal.
    pub fn on_retries_exhausted(&mut self) -> Result<ConnectionState, ChatError> {
        if self.state != ConnectionState::FailedToConnect {
            return Err(ChatError::invalid_state(self.state, "on_retries_exhausted"));
        }
        self.retries_exhausted = true;
        Ok(self.state)
    }

    /// A granted retry is about to run.
    pub fn on_retry(&mut self) -> Result<ConnectionState, ChatError> {
        if self.retries_exhausted {
            return Err(ChatError::invalid_state(self.state, "on_retry"));
        }
        self.transition_from_state(
            ConnectionState::FailedToConnect,
            ConnectionState::Connecting,
            "on_retry",
        )
    }

    /// Remote reported authorization expiry.
    pub fn on_authorization_expired(&mut self) -> Result<ConnectionState, ChatError> {
        self.transition_from_state(
            ConnectionState::Online,
            ConnectionState::ExpiredToken,
            "on_authorization_expired",
        )
    }

    /// Remote closed the conversation.
    pub fn on_remote_closed(&mut self) -> Result<ConnectionState, ChatError> {
        self.transition_from_state(
            ConnectionState::Online,
            ConnectionState::Ended,
            "on_remote_closed",
        )
    }

    /// `stop()`: end the session from any state.
    ///
    /// Returns `None` when already `Ended` so callers do not re-announce it.
    pub fn stop(&mut self) -> Option<ConnectionState> {
        if self.state == ConnectionState::Ended {
            return None;
        }
        self.transition(ConnectionState::Ended);
        Some(self.state)
    }

    fn transition(&mut self, next: ConnectionState) {
        self.state = next;
    }

    fn transition_from_state(
        &mut self,
        expected: ConnectionState,
        next: ConnectionState,
        action: &str,
    ) -> Result<ConnectionState, ChatError> {
        if self.state != expected {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.transition(next);
        Ok(next)
    }

    fn transition_from_any_of(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &str,
    ) -> Result<ConnectionState, ChatError> {
        if !expected.contains(&self.state) {
            return Err(ChatError::invalid_state(self.state, action));
        }
        self.transition(next);
        Ok(next)
    }
}
