//! Receiver-side connection state machine.
//!
//! Provides a `ConnectionState` enum that models the lifecycle of one
//! remote connection, with validated transitions that return `Result`
//! instead of panicking.

use std::time::{Duration, Instant};

use crate::error::RemoteError;

// ── ConnectionState ──────────────────────────────────────────────

/// The current state of a remote connection.
///
/// ```text
///                  ┌──► Pairing ─────────────────────────┐
///  Handshaking ────┤                                     ├──► Dead
///                  └──► Authenticating ──► Ready ◄──► Unready
/// ```
///
/// Every state may move to `Dead`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Waiting for the protocol version line.
    #[default]
    Handshaking,

    /// Pairing session in progress; the connection closes afterwards.
    Pairing,

    /// Waiting for the auth token.
    Authenticating,

    /// Authenticated with a bound capability set.
    Ready {
        /// When the connection last became ready.
        since: Instant,
    },

    /// Authenticated, but no capability set is bound. Keepalives are
    /// still answered.
    Unready,

    /// Terminal.
    Dead,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshaking => write!(f, "Handshaking"),
            Self::Pairing => write!(f, "Pairing"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Ready { .. } => write!(f, "Ready"),
            Self::Unready => write!(f, "Unready"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

impl ConnectionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    pub fn is_dead(&self) -> bool {
        matches!(self, Self::Dead)
    }

    /// Whether the peer has authenticated (ready or not).
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Ready { .. } | Self::Unready)
    }

    /// How long the connection has been `Ready`. `None` in any other state.
    pub fn ready_duration(&self) -> Option<Duration> {
        match self {
            Self::Ready { since } => Some(since.elapsed()),
            _ => None,
        }
    }

    // ── Transitions ──────────────────────────────────────────────

    /// Valid from: `Handshaking`.
    pub fn begin_pairing(&mut self) -> Result<(), RemoteError> {
        match self {
            Self::Handshaking => {
                *self = Self::Pairing;
                Ok(())
            }
            _ => Err(RemoteError::ProtocolViolation(
                "cannot pair: not in Handshaking state",
            )),
        }
    }

    /// Valid from: `Handshaking`.
    pub fn begin_authentication(&mut self) -> Result<(), RemoteError> {
        match self {
            Self::Handshaking => {
                *self = Self::Authenticating;
                Ok(())
            }
            _ => Err(RemoteError::ProtocolViolation(
                "cannot authenticate: not in Handshaking state",
            )),
        }
    }

    /// Valid from: `Authenticating`, `Unready`, `Ready` (keeps `since`).
    pub fn become_ready(&mut self) -> Result<(), RemoteError> {
        match self {
            Self::Ready { .. } => Ok(()),
            Self::Authenticating | Self::Unready => {
                *self = Self::Ready {
                    since: Instant::now(),
                };
                Ok(())
            }
            _ => Err(RemoteError::ProtocolViolation(
                "cannot become ready: not authenticated",
            )),
        }
    }

    /// Valid from: `Authenticating`, `Ready`, `Unready`.
    pub fn become_unready(&mut self) -> Result<(), RemoteError> {
        match self {
            Self::Authenticating | Self::Ready { .. } | Self::Unready => {
                *self = Self::Unready;
                Ok(())
            }
            _ => Err(RemoteError::ProtocolViolation(
                "cannot become unready: not authenticated",
            )),
        }
    }

    /// Move to `Dead` from any state. Returns `false` if already dead.
    pub fn kill(&mut self) -> bool {
        if self.is_dead() {
            return false;
        }
        *self = Self::Dead;
        true
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_lifecycle() {
        let mut state = ConnectionState::default();
        assert_eq!(state, ConnectionState::Handshaking);

        state.begin_authentication().unwrap();
        assert_eq!(state, ConnectionState::Authenticating);

        state.become_unready().unwrap();
        assert!(state.is_authenticated());
        assert!(!state.is_ready());

        state.become_ready().unwrap();
        assert!(state.is_ready());
        assert!(state.ready_duration().is_some());

        assert!(state.kill());
        assert!(state.is_dead());
        assert!(!state.kill());
    }

    #[test]
    fn pairing_cannot_reach_ready() {
        let mut state = ConnectionState::Handshaking;
        state.begin_pairing().unwrap();
        assert!(state.become_ready().is_err());
        assert!(state.become_unready().is_err());
        assert!(state.begin_authentication().is_err());
    }

    #[test]
    fn ready_requires_authentication() {
        let mut state = ConnectionState::Handshaking;
        assert!(state.become_ready().is_err());
        assert_eq!(state, ConnectionState::Handshaking);
    }

    #[test]
    fn dead_is_terminal() {
        let mut state = ConnectionState::Dead;
        assert!(state.begin_pairing().is_err());
        assert!(state.begin_authentication().is_err());
        assert!(state.become_ready().is_err());
    }

    #[test]
    fn ready_again_keeps_since() {
        let mut state = ConnectionState::Authenticating;
        state.become_ready().unwrap();
        let before = state.clone();
        state.become_ready().unwrap();
        assert_eq!(state, before);
    }

    #[test]
    fn display_format() {
        assert_eq!(ConnectionState::Handshaking.to_string(), "Handshaking");
        assert_eq!(ConnectionState::Pairing.to_string(), "Pairing");
        assert_eq!(
            ConnectionState::Ready {
                since: Instant::now()
            }
            .to_string(),
            "Ready"
        );
        assert_eq!(ConnectionState::Unready.to_string(), "Unready");
        assert_eq!(ConnectionState::Dead.to_string(), "Dead");
    }
}
