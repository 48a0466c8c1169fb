//! Consumer state machine.

use serde::{Deserialize, Serialize};

/// Lifecycle state of the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerState {
    /// Receiving and dispatching messages.
    Running,
    /// No new receives; in-flight work is finishing.
    Draining,
    /// All work has a disposition.
    Stopped,
}

impl ConsumerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ConsumerState) -> bool {
        use ConsumerState::*;

        matches!(
            (self, target),
            (Running, Draining) | (Running, Stopped) | (Draining, Stopped)
        )
    }
}

impl std::fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// How urgently a stop was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StopRequest {
    None,
    /// Finish in-flight work within the shutdown timeout.
    Graceful,
    /// Cancel in-flight work now.
    Immediate,
}

impl StopRequest {
    /// The request after one more stop call. Saturates at `Immediate`.
    pub fn escalate(self) -> Self {
        match self {
            Self::None => Self::Graceful,
            Self::Graceful | Self::Immediate => Self::Immediate,
        }
    }
}
