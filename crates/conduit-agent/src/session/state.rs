//! Session lifecycle state.

use std::fmt;

use crate::error::SessionError;

/// Where a session is in its lifecycle.
///
/// Only `Connecting -> Active -> {Closed, Failed}` transitions happen; both
/// `Closed` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    /// Closed on request by the owner.
    Closed,
    /// Lost without being asked to.
    Failed(SessionError),
}

impl SessionState {
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed | Self::Failed(_))
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub const fn can_become(&self, next: &Self) -> bool {
        match (self, next) {
            (Self::Connecting, Self::Active)
            | (Self::Connecting | Self::Active, Self::Closed | Self::Failed(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connecting => f.write_str("connecting"),
            Self::Active => f.write_str("active"),
            Self::Closed => f.write_str("closed"),
            Self::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_do_not_transition() {
        let failed = SessionState::Failed(SessionError::Disconnected("gone".into()));
        assert!(!SessionState::Closed.can_become(&SessionState::Active));
        assert!(!SessionState::Closed.can_become(&failed));
        assert!(!failed.can_become(&SessionState::Closed));
        assert!(failed.is_terminal());
    }

    #[test]
    fn lifecycle_transitions() {
        assert!(SessionState::Connecting.can_become(&SessionState::Active));
        assert!(SessionState::Active.can_become(&SessionState::Closed));
        assert!(
            SessionState::Active
                .can_become(&SessionState::Failed(SessionError::Disconnected(String::new())))
        );
        assert!(!SessionState::Active.can_become(&SessionState::Connecting));
        assert!(SessionState::Active.is_active());
        assert!(!SessionState::Connecting.is_active());
    }

    #[test]
    fn display_includes_failure_reason() {
        let failed = SessionState::Failed(SessionError::Disconnected("transport lost".into()));
        assert_eq!(
            failed.to_string(),
            "failed: Session disconnected: transport lost"
        );
    }
}
