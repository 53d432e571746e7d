//! tmux-backed persistent shell broker.
//!
//! Each shell session is a real tmux session with a synthetic `PS1` set so
//! the broker can tell idle from busy by regex-matching the last non-empty
//! line of the captured pane, without any special tmux hooks. Grounded on
//! the terminal-manager discipline used for long-lived interactive shells
//! upstream (session-name validation, prompt format, busy/timeout handling),
//! re-expressed here by shelling out to the `tmux` binary via
//! `tokio::process::Command` — consistent with how this crate already wraps
//! external processes for its non-persistent command execution tool.

use super::session::{is_valid_session_name, ShellSessionInfo, ShellState};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ShellError {
    #[error("session name `{0}` is invalid; use only letters, digits, `_` and `-`")]
    InvalidSessionName(String),
    #[error("session `{0}` already exists")]
    SessionExists(String),
    #[error("session `{0}` is not initialized; available sessions: {1:?}")]
    SessionNotFound(String, Vec<String>),
    #[error("session `{0}` is busy running another command")]
    Busy(String),
    #[error("command in session `{0}` timed out after {1:?}; the shell remains busy and can be inspected with view or stopped with interrupt")]
    CommandTimedOut(String, Duration),
    #[error("failed to run tmux: {0}")]
    TmuxFailed(String),
    #[error("start directory does not exist: {0}")]
    InvalidStartDirectory(String),
}

fn prompt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\s*$").expect("static regex"))
}

/// Per-process-wide shell session registry, namespaced by conversation id so
/// two conversations can never collide on a shell name.
pub struct PersistentShellBroker {
    prompt_prefix: String,
    sessions: Mutex<HashMap<(String, String), ShellSessionInfo>>,
}

impl PersistentShellBroker {
    pub fn new(prompt_prefix: impl Into<String>) -> Self {
        Self {
            prompt_prefix: prompt_prefix.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn tmux_name(&self, conversation_id: &str, name: &str) -> String {
        format!("orch-{conversation_id}-{name}")
    }

    fn prompt(&self, cwd: &Path) -> String {
        format!("{}:{}$ ", self.prompt_prefix, cwd.display())
    }

    pub async fn list(&self, conversation_id: &str) -> Vec<String> {
        let sessions = self.sessions.lock().await;
        sessions
            .keys()
            .filter(|(conv, _)| conv == conversation_id)
            .map(|(_, name)| name.clone())
            .collect()
    }

    async fn run_tmux(args: &[&str]) -> Result<String, ShellError> {
        let output = Command::new("tmux")
            .args(args)
            .output()
            .await
            .map_err(|e| ShellError::TmuxFailed(e.to_string()))?;
        if !output.status.success() {
            return Err(ShellError::TmuxFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Create a new named shell session rooted at `start_dir`.
    pub async fn create(
        &self,
        conversation_id: &str,
        name: &str,
        start_dir: &Path,
    ) -> Result<(), ShellError> {
        if !is_valid_session_name(name) {
            return Err(ShellError::InvalidSessionName(name.to_string()));
        }
        if !start_dir.is_dir() {
            return Err(ShellError::InvalidStartDirectory(start_dir.display().to_string()));
        }

        let key = (conversation_id.to_string(), name.to_string());
        {
            let sessions = self.sessions.lock().await;
            if sessions.contains_key(&key) {
                return Err(ShellError::SessionExists(name.to_string()));
            }
        }

        let tmux_name = self.tmux_name(conversation_id, name);
        Self::run_tmux(&[
            "new-session",
            "-d",
            "-s",
            &tmux_name,
            "-c",
            &start_dir.display().to_string(),
        ])
        .await?;

        let prompt = self.prompt(start_dir);
        Self::run_tmux(&["send-keys", "-t", &tmux_name, &format!("PS1='{prompt}'"), "Enter"]).await?;
        Self::run_tmux(&["send-keys", "-t", &tmux_name, "clear", "Enter"]).await?;

        self.wait_for_idle(&tmux_name, DEFAULT_COMMAND_TIMEOUT).await?;

        let mut info = ShellSessionInfo::new(name, start_dir.to_path_buf());
        info.state = ShellState::Idle;
        self.sessions.lock().await.insert(key, info);
        Ok(())
    }

    async fn require_session(&self, conversation_id: &str, name: &str) -> Result<(), ShellError> {
        let sessions = self.sessions.lock().await;
        if sessions.contains_key(&(conversation_id.to_string(), name.to_string())) {
            Ok(())
        } else {
            let available = sessions
                .keys()
                .filter(|(conv, _)| conv == conversation_id)
                .map(|(_, n)| n.clone())
                .collect();
            Err(ShellError::SessionNotFound(name.to_string(), available))
        }
    }

    /// Capture the full scrollback of a session's pane.
    pub async fn view(&self, conversation_id: &str, name: &str) -> Result<String, ShellError> {
        self.require_session(conversation_id, name).await?;
        let tmux_name = self.tmux_name(conversation_id, name);
        Self::run_tmux(&["capture-pane", "-t", &tmux_name, "-p", "-S", "-", "-E", "-"]).await
    }

    async fn last_nonempty_line(tmux_name: &str) -> Result<String, ShellError> {
        let output = Self::run_tmux(&["capture-pane", "-t", tmux_name, "-p"]).await?;
        Ok(output
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("")
            .to_string())
    }

    async fn is_idle(tmux_name: &str) -> Result<bool, ShellError> {
        let last_line = Self::last_nonempty_line(tmux_name).await?;
        Ok(prompt_regex().is_match(&last_line))
    }

    async fn wait_for_idle(&self, tmux_name: &str, timeout: Duration) -> Result<(), ShellError> {
        let deadline = Instant::now() + timeout;
        loop {
            if Self::is_idle(tmux_name).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ShellError::CommandTimedOut(tmux_name.to_string(), timeout));
            }
            sleep(POLL_INTERVAL).await;
        }
    }

    /// Run a command in an existing session, waiting up to `timeout` for the
    /// shell to return to idle. On timeout the shell is left `Busy`, not
    /// killed — callers can recover with `view` or `interrupt`.
    pub async fn run(
        &self,
        conversation_id: &str,
        name: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<String, ShellError> {
        self.require_session(conversation_id, name).await?;
        let key = (conversation_id.to_string(), name.to_string());

        {
            let mut sessions = self.sessions.lock().await;
            let info = sessions.get_mut(&key).expect("checked above");
            if info.state == ShellState::Busy {
                return Err(ShellError::Busy(name.to_string()));
            }
            info.state = ShellState::Busy;
        }

        let tmux_name = self.tmux_name(conversation_id, name);
        Self::run_tmux(&["send-keys", "-t", &tmux_name, command, "Enter"]).await?;

        let wait_result = self.wait_for_idle(&tmux_name, timeout).await;
        let output = Self::last_pane_output(&tmux_name).await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(info) = sessions.get_mut(&key) {
            info.state = match &wait_result {
                Ok(()) => ShellState::Idle,
                Err(_) => ShellState::Busy,
            };
        }
        wait_result?;
        Ok(output)
    }

    async fn last_pane_output(tmux_name: &str) -> Result<String, ShellError> {
        Self::run_tmux(&["capture-pane", "-t", tmux_name, "-p", "-S", "-", "-E", "-"]).await
    }

    /// Send raw input to a running process inside the session, without
    /// waiting for idle (the process may still be prompting for more input).
    pub async fn write_to_process(
        &self,
        conversation_id: &str,
        name: &str,
        content: &str,
        press_enter: bool,
    ) -> Result<String, ShellError> {
        self.require_session(conversation_id, name).await?;
        let tmux_name = self.tmux_name(conversation_id, name);
        if press_enter {
            Self::run_tmux(&["send-keys", "-t", &tmux_name, content, "Enter"]).await?;
        } else {
            Self::run_tmux(&["send-keys", "-t", &tmux_name, content]).await?;
        }
        Self::last_pane_output(&tmux_name).await
    }

    /// Send Ctrl-C to interrupt whatever is running, then wait for idle.
    pub async fn interrupt(&self, conversation_id: &str, name: &str) -> Result<String, ShellError> {
        self.require_session(conversation_id, name).await?;
        let key = (conversation_id.to_string(), name.to_string());
        let tmux_name = self.tmux_name(conversation_id, name);

        Self::run_tmux(&["send-keys", "-t", &tmux_name, "C-c"]).await?;
        self.wait_for_idle(&tmux_name, DEFAULT_COMMAND_TIMEOUT).await?;
        let output = Self::last_pane_output(&tmux_name).await?;

        if let Some(info) = self.sessions.lock().await.get_mut(&key) {
            info.state = ShellState::Idle;
        }
        Ok(output)
    }

    /// Kill the underlying tmux session and drop it from the registry.
    pub async fn kill(&self, conversation_id: &str, name: &str) -> Result<(), ShellError> {
        self.require_session(conversation_id, name).await?;
        let tmux_name = self.tmux_name(conversation_id, name);
        let _ = Self::run_tmux(&["kill-session", "-t", &tmux_name]).await;
        self.sessions
            .lock()
            .await
            .remove(&(conversation_id.to_string(), name.to_string()));
        Ok(())
    }

    /// Kill every session belonging to a conversation. Called when a session
    /// is torn down.
    pub async fn kill_all(&self, conversation_id: &str) {
        let names = self.list(conversation_id).await;
        for name in names {
            let _ = self.kill(conversation_id, &name).await;
        }
    }

    pub async fn cwd(&self, conversation_id: &str, name: &str) -> Option<PathBuf> {
        self.sessions
            .lock()
            .await
            .get(&(conversation_id.to_string(), name.to_string()))
            .map(|i| i.cwd.clone())
    }
}

/// Shared handle type used throughout tool/executor wiring.
pub type SharedShellBroker = Arc<PersistentShellBroker>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_regex_matches_trailing_prompt() {
        assert!(prompt_regex().is_match("orchestrator:/tmp$ "));
        assert!(!prompt_regex().is_match("still running..."));
    }
}
