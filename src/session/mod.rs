//! Session state machine
//!
//! ```text
//! Idle -> Compiling -> StartingCore -> EstablishingTunnel -> Connected
//!            |              |                 |                  |
//!            +------> Failed <----------------+                  |
//!                       |                                        |
//!                       +---------> Disconnecting <--------------+
//!                                        |
//!                                        v
//!                                       Idle
//! ```

pub mod controller;

pub use controller::SessionController;

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Idle,
    Compiling,
    StartingCore,
    EstablishingTunnel,
    Connected,
    Disconnecting,
    Failed,
}

impl SessionState {
    /// States of an in-flight connect
    pub fn is_connecting(self) -> bool {
        matches!(
            self,
            SessionState::Compiling | SessionState::StartingCore | SessionState::EstablishingTunnel
        )
    }

    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            (Idle, Compiling)
            | (Compiling, StartingCore)
            | (StartingCore, EstablishingTunnel)
            | (EstablishingTunnel, Connected)
            | (Disconnecting, Idle) => true,
            (from, Failed) => from.is_connecting(),
            (from, Disconnecting) => !matches!(from, Idle | Disconnecting),
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Compiling => write!(f, "compiling"),
            SessionState::StartingCore => write!(f, "starting-core"),
            SessionState::EstablishingTunnel => write!(f, "establishing-tunnel"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnecting => write!(f, "disconnecting"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Holds the session state and publishes every change
pub struct SessionStateMachine {
    state: SessionState,
    last_error: Option<String>,
    connected_tx: watch::Sender<bool>,
    state_tx: watch::Sender<SessionState>,
}

impl SessionStateMachine {
    pub fn new() -> Self {
        let (connected_tx, _) = watch::channel(false);
        let (state_tx, _) = watch::channel(SessionState::Idle);
        SessionStateMachine {
            state: SessionState::Idle,
            last_error: None,
            connected_tx,
            state_tx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Error that sent the session to `Failed` most recently
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.connected_tx.subscribe()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn transition(&mut self, to: SessionState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: to.to_string(),
            });
        }
        debug!("Session state: {} -> {}", self.state, to);
        self.state = to;
        self.state_tx.send_replace(to);
        match to {
            SessionState::Connected => {
                self.last_error = None;
                self.connected_tx.send_replace(true);
            }
            SessionState::Idle => {
                self.connected_tx.send_replace(false);
            }
            _ => {}
        }
        Ok(())
    }

    /// Enter `Failed`, remembering why
    pub fn fail(&mut self, error: &Error) -> Result<()> {
        self.transition(SessionState::Failed)?;
        self.last_error = Some(error.to_string());
        Ok(())
    }
}

impl Default for SessionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SessionState::*;

    #[test]
    fn test_happy_path() {
        let mut m = SessionStateMachine::new();
        for s in [Compiling, StartingCore, EstablishingTunnel, Connected, Disconnecting, Idle] {
            m.transition(s).unwrap();
        }
        assert_eq!(m.state(), Idle);
    }

    #[test]
    fn test_rejects_skipping_states() {
        let mut m = SessionStateMachine::new();
        let err = m.transition(Connected).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { ref from, ref to } if from == "idle" && to == "connected"));
        assert_eq!(m.state(), Idle);
    }

    #[test]
    fn test_connected_to_idle_needs_disconnecting() {
        assert!(!Connected.can_transition_to(Idle));
        assert!(Connected.can_transition_to(Disconnecting));
        assert!(!Idle.can_transition_to(Disconnecting));
        assert!(!Connected.can_transition_to(Failed));
    }

    #[test]
    fn test_failed_only_from_connecting_states() {
        for s in [Compiling, StartingCore, EstablishingTunnel] {
            assert!(s.can_transition_to(Failed));
        }
        assert!(Failed.can_transition_to(Disconnecting));
        assert!(!Failed.can_transition_to(Idle));
    }

    #[test]
    fn test_fail_records_error() {
        let mut m = SessionStateMachine::new();
        m.transition(Compiling).unwrap();
        m.fail(&Error::malformed("address cannot be empty")).unwrap();
        assert_eq!(m.state(), Failed);
        assert!(m.last_error().unwrap().contains("address cannot be empty"));
    }

    #[tokio::test]
    async fn test_status_channel_replays_and_publishes() {
        let mut m = SessionStateMachine::new();
        let mut rx = m.subscribe_connected();
        assert!(!*rx.borrow());

        for s in [Compiling, StartingCore, EstablishingTunnel, Connected] {
            m.transition(s).unwrap();
        }
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        // late subscribers see the current value immediately
        assert!(*m.subscribe_connected().borrow());
        assert_eq!(*m.subscribe_state().borrow(), Connected);
    }
}
