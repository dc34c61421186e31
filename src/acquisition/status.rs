//! Acquisition lifecycle state.

use serde::{Deserialize, Serialize};

/// Lifecycle of an [`Acquisition`](super::Acquisition).
///
/// ```text
/// Init ──run()──> Running ──> Done
///                    │
///                    └──────> Aborted
/// ```
///
/// `Done` and `Aborted` are terminal for a run; the next `run()` moves
/// straight back to `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AcquisitionStatus {
    /// No run has started yet
    #[default]
    Init,
    /// A run is in progress
    Running,
    /// The last run completed every time point
    Done,
    /// The last run was cancelled or faulted
    Aborted,
}

impl AcquisitionStatus {
    /// Check if the state allows starting a new run.
    pub fn can_begin(&self) -> bool {
        !matches!(self, AcquisitionStatus::Running)
    }

    /// Whether a run has ended in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcquisitionStatus::Done | AcquisitionStatus::Aborted)
    }
}

impl std::fmt::Display for AcquisitionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquisitionStatus::Init => write!(f, "Init"),
            AcquisitionStatus::Running => write!(f, "Running"),
            AcquisitionStatus::Done => write!(f, "Done"),
            AcquisitionStatus::Aborted => write!(f, "Aborted"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_running_blocks_a_new_run() {
        assert!(AcquisitionStatus::Init.can_begin());
        assert!(AcquisitionStatus::Done.can_begin());
        assert!(AcquisitionStatus::Aborted.can_begin());
        assert!(!AcquisitionStatus::Running.can_begin());
        assert!(!AcquisitionStatus::Init.is_terminal());
    }
}
