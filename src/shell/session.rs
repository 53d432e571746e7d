//! A single named, tmux-backed shell session.

use std::path::PathBuf;

/// Lifecycle of one shell session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellState {
    Creating,
    Idle,
    Busy,
    Dead,
}

/// Metadata the broker tracks per session. The tmux pane itself is the
/// source of truth for output and idle/busy status; this struct only tracks
/// what the broker needs between calls.
#[derive(Debug, Clone)]
pub struct ShellSessionInfo {
    pub name: String,
    pub cwd: PathBuf,
    pub state: ShellState,
}

impl ShellSessionInfo {
    pub fn new(name: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            name: name.into(),
            cwd,
            state: ShellState::Creating,
        }
    }
}

/// Session names are used directly as tmux session names and as part of the
/// synthetic prompt; only a conservative character set is allowed.
pub fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_unsafe_names() {
        assert!(!is_valid_session_name(""));
        assert!(!is_valid_session_name("foo bar"));
        assert!(!is_valid_session_name("foo;rm -rf /"));
    }

    #[test]
    fn accepts_alphanumeric_dash_underscore() {
        assert!(is_valid_session_name("agent-1_main"));
    }
}
