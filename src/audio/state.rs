use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SessionError};

/// Estado de una sesión de reproducción.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SessionState {
    #[default]
    New,
    Stopped,
    Playing,
    Paused,
    Ended,
    Skipped,
    Disconnected,
}

impl SessionState {
    pub const ALL: [SessionState; 7] = [
        SessionState::New,
        SessionState::Stopped,
        SessionState::Playing,
        SessionState::Paused,
        SessionState::Ended,
        SessionState::Skipped,
        SessionState::Disconnected,
    ];

    pub fn is_terminal(self) -> bool {
        self == SessionState::Disconnected
    }

    /// Si `self -> to` es una arista de la máquina.
    pub fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;

        match (self, to) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (New, Stopped) => true,
            (Stopped | Paused | Ended | Skipped, Playing) => true,
            (Playing, Paused) => true,
            (Playing, Ended) => true,
            (Playing | Paused, Skipped) => true,
            // stop desde una pausa o durante un salto
            (Paused | Skipped, Ended) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "NEW",
            SessionState::Stopped => "STOPPED",
            SessionState::Playing => "PLAYING",
            SessionState::Paused => "PAUSED",
            SessionState::Ended => "ENDED",
            SessionState::Skipped => "SKIPPED",
            SessionState::Disconnected => "DISCONNECTED",
        };
        f.write_str(name)
    }
}

/// Holds exactly one [`SessionState`] and only lets it move along the
/// permitted edges. A rejected transition leaves the state untouched.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    state: SessionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Valida la transición sin aplicarla.
    pub fn check(&self, to: SessionState) -> Result<()> {
        if self.state.can_transition_to(to) {
            Ok(())
        } else {
            Err(SessionError::TransitionNotPermitted { from: self.state, to })
        }
    }

    pub fn transition(&mut self, to: SessionState) -> Result<SessionState> {
        self.check(to)?;
        let from = std::mem::replace(&mut self.state, to);
        Ok(from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use SessionState::*;

    #[test]
    fn new_is_the_only_initial_state() {
        let machine = StateMachine::new();
        assert_eq!(machine.state(), New);
    }

    #[test]
    fn playing_reaches_only_documented_targets() {
        let reachable: Vec<SessionState> = SessionState::ALL
            .into_iter()
            .filter(|to| Playing.can_transition_to(*to))
            .collect();
        assert_eq!(reachable, vec![Paused, Ended, Skipped, Disconnected]);
    }

    #[test]
    fn rejected_transition_leaves_state_unchanged() {
        let mut machine = StateMachine::new();
        machine.transition(Stopped).unwrap();
        machine.transition(Playing).unwrap();

        let err = machine.transition(Stopped).unwrap_err();
        assert_eq!(err, SessionError::TransitionNotPermitted { from: Playing, to: Stopped });
        assert_eq!(machine.state(), Playing);
    }

    #[test]
    fn disconnected_is_terminal() {
        let mut machine = StateMachine::new();
        assert_eq!(machine.transition(Disconnected).unwrap(), New);
        for to in SessionState::ALL {
            assert!(machine.transition(to).is_err());
        }
        assert!(machine.state().is_terminal());
    }

    #[test]
    fn pause_resume_cycle() {
        let mut machine = StateMachine::new();
        for to in [Stopped, Playing, Paused, Playing, Skipped, Playing, Ended, Playing] {
            machine.transition(to).unwrap();
        }
        assert_eq!(machine.state(), Playing);
        assert!(machine.check(New).is_err());
    }
}
