use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of the cycle scheduler.
///
/// `Initializing -> Idle -> Learning <-> Error`, with shutdown returning to
/// `Idle` from any running state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Initializing,
    Idle,
    Learning,
    Error,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Initializing => "initializing",
            CycleState::Idle => "idle",
            CycleState::Learning => "learning",
            CycleState::Error => "error",
        }
    }

    /// Whether the transition table allows `self -> next`.
    pub fn can_transition_to(self, next: CycleState) -> bool {
        use CycleState::*;
        matches!(
            (self, next),
            (Initializing, Idle)
                | (Idle, Learning)
                | (Learning, Learning)
                | (Learning, Error)
                | (Error, Learning)
                | (Learning, Idle)
                | (Error, Idle)
                | (Idle, Idle)
        )
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_table() {
        use CycleState::*;
        assert!(Initializing.can_transition_to(Idle));
        assert!(!Initializing.can_transition_to(Learning));
        assert!(Idle.can_transition_to(Learning));
        assert!(Learning.can_transition_to(Error));
        assert!(Error.can_transition_to(Learning));
        assert!(Error.can_transition_to(Idle));
        assert!(!Idle.can_transition_to(Error));
        assert!(!Idle.can_transition_to(Initializing));
    }

    #[test]
    fn serializes_snake_case() {
        assert_eq!(serde_json::to_value(CycleState::Learning).unwrap(), "learning");
        assert_eq!(CycleState::Error.to_string(), "error");
    }
}
