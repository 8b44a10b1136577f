//! Container states

use serde::{Deserialize, Serialize};

/// Container state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    Unknown,
    /// Container is being created
    ///
    /// Only creation handles report it; a container enters the cache once its
    /// VM exists, already `Created`.
    Creating,
    /// Container is created but has never run
    Created,
    /// Container is being powered on
    Starting,
    /// Container is running
    Running,
    /// Container is being powered off
    Stopping,
    /// Container has stopped
    Stopped,
    /// Container is being suspended
    Suspending,
    /// Container is suspended
    Suspended,
    /// Container is being removed
    Removing,
    /// Container has been removed
    Removed,
}

impl State {
    /// Whether the container is powered off and can be started or removed
    pub fn is_stopped(&self) -> bool {
        matches!(self, State::Created | State::Stopped)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            State::Unknown => write!(f, "unknown"),
            State::Creating => write!(f, "creating"),
            State::Created => write!(f, "created"),
            State::Starting => write!(f, "starting"),
            State::Running => write!(f, "running"),
            State::Stopping => write!(f, "stopping"),
            State::Stopped => write!(f, "stopped"),
            State::Suspending => write!(f, "suspending"),
            State::Suspended => write!(f, "suspended"),
            State::Removing => write!(f, "removing"),
            State::Removed => write!(f, "removed"),
        }
    }
}
