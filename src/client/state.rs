use crate::error::LiveError;
use std::fmt;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    Closing,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn accepts_audio(self) -> bool {
        self == ConnectionState::Open
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }

    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Idle, Connecting)
                | (Connecting, Open)
                | (Connecting, Closing)
                | (Connecting, Errored)
                | (Open, Closing)
                | (Open, Closed)
                | (Open, Errored)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Closing => "closing",
            ConnectionState::Closed => "closed",
            ConnectionState::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Applies `next` if the transition is legal.
pub(crate) fn transition(
    state: &watch::Sender<ConnectionState>,
    next: ConnectionState,
) -> Result<(), LiveError> {
    let mut result = Ok(());
    state.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        if !current.can_transition_to(next) {
            result = Err(LiveError::InvalidTransition {
                from: current.to_string(),
                to: next.to_string(),
            });
            return false;
        }
        debug!("[Connection] State {} -> {}.", current, next);
        *current = next;
        true
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let (tx, rx) = watch::channel(ConnectionState::Idle);
        for next in [
            ConnectionState::Connecting,
            ConnectionState::Open,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            transition(&tx, next).unwrap();
            assert_eq!(*rx.borrow(), next);
        }
    }

    #[test]
    fn test_terminal_states_absorb() {
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        transition(&tx, ConnectionState::Errored).unwrap();
        assert!(transition(&tx, ConnectionState::Open).is_err());
        assert!(transition(&tx, ConnectionState::Closed).is_err());
        assert_eq!(*rx.borrow(), ConnectionState::Errored);
        assert!(rx.borrow().is_terminal());
    }

    #[test]
    fn test_repeating_current_state_is_a_no_op() {
        let (tx, _rx) = watch::channel(ConnectionState::Closed);
        transition(&tx, ConnectionState::Closed).unwrap();
    }

    #[test]
    fn test_only_open_accepts_audio() {
        assert!(ConnectionState::Open.accepts_audio());
        assert!(!ConnectionState::Connecting.accepts_audio());
        assert!(!ConnectionState::Closing.accepts_audio());
        assert!(!ConnectionState::Idle.can_transition_to(ConnectionState::Open));
    }
}
