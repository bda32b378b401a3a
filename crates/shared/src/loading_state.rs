use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a background download. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DownloadState {
    Downloading { percent: u8 },
    Completed,
    Failed(String),
}

impl Default for DownloadState {
    fn default() -> Self {
        DownloadState::Downloading { percent: 0 }
    }
}

impl DownloadState {
    pub fn is_downloading(&self) -> bool {
        matches!(self, DownloadState::Downloading { .. })
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DownloadState::Completed)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, DownloadState::Failed(_))
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_downloading()
    }

    pub fn progress(&self) -> u8 {
        match self {
            DownloadState::Downloading { percent } => *percent,
            DownloadState::Completed => 100,
            DownloadState::Failed(_) => 0,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            DownloadState::Failed(msg) => Some(msg),
            _ => None,
        }
    }
}

impl fmt::Display for DownloadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadState::Downloading { percent } => write!(f, "Downloading ({}%)", percent),
            DownloadState::Completed => write!(f, "Completed"),
            DownloadState::Failed(msg) => write!(f, "Failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTransition {
    Progress(u8),
    Completed,
    Failed(String),
}

impl DownloadTransition {
    /// Terminal states absorb every transition; there is no retry.
    pub fn apply_to_state(self, current_state: DownloadState) -> DownloadState {
        match (self, current_state) {
            (_, terminal) if terminal.is_terminal() => terminal,
            (DownloadTransition::Progress(p), DownloadState::Downloading { percent }) => {
                DownloadState::Downloading {
                    percent: p.min(100).max(percent),
                }
            }
            (DownloadTransition::Completed, _) => DownloadState::Completed,
            (DownloadTransition::Failed(msg), _) => DownloadState::Failed(msg),
            (_, state) => state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_state_properties() {
        let downloading = DownloadState::default();
        assert!(downloading.is_downloading());
        assert!(!downloading.is_terminal());
        assert_eq!(downloading.progress(), 0);

        let completed = DownloadState::Completed;
        assert!(completed.is_completed());
        assert!(completed.is_terminal());
        assert_eq!(completed.progress(), 100);

        let failed = DownloadState::Failed("404".to_string());
        assert!(failed.is_failed());
        assert_eq!(failed.error_message(), Some("404"));
    }

    #[test]
    fn test_progress_is_monotonic_and_clamped() {
        let state = DownloadTransition::Progress(40).apply_to_state(DownloadState::default());
        assert_eq!(state, DownloadState::Downloading { percent: 40 });

        let state = DownloadTransition::Progress(10).apply_to_state(state);
        assert_eq!(state, DownloadState::Downloading { percent: 40 });

        let state = DownloadTransition::Progress(250).apply_to_state(state);
        assert_eq!(state, DownloadState::Downloading { percent: 100 });
    }

    #[test]
    fn test_terminal_states_absorb_transitions() {
        let failed = DownloadTransition::Failed("timeout".to_string())
            .apply_to_state(DownloadState::default());
        assert!(failed.is_failed());

        let still_failed = DownloadTransition::Completed.apply_to_state(failed.clone());
        assert_eq!(still_failed, failed);

        let completed = DownloadTransition::Completed.apply_to_state(DownloadState::default());
        let still_completed =
            DownloadTransition::Failed("late".to_string()).apply_to_state(completed);
        assert_eq!(still_completed, DownloadState::Completed);
    }

    #[test]
    fn test_display_formatting() {
        assert_eq!(
            DownloadState::Downloading { percent: 12 }.to_string(),
            "Downloading (12%)"
        );
        assert_eq!(DownloadState::Completed.to_string(), "Completed");
        assert_eq!(
            DownloadState::Failed("Network error".to_string()).to_string(),
            "Failed: Network error"
        );
    }
}
