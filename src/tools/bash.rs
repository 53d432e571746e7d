//! The `Bash` tool family: thin wrappers over `PersistentShellBroker`
//! (§4.B). Every call is namespaced to the calling session by
//! `ctx.session_id`; the broker itself mixes that in when naming the
//! underlying tmux session, so two sessions can reuse the same shell name
//! without colliding.

use super::{Confirmation, Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

const MAX_OUTPUT_LENGTH: usize = 128 * 1024; // 128KB
const SNIP_SIZE: usize = 4 * 1024; // 4KB each end
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const SLOW_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const BACKGROUND_POLL: Duration = Duration::from_secs(2);

fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_LENGTH {
        return output.to_string();
    }
    let start = &output[..SNIP_SIZE];
    let end = &output[output.len() - SNIP_SIZE..];
    format!(
        "[output truncated in middle: got {} bytes, max is {} bytes]\n{start}\n\n[snip]\n\n{end}",
        output.len(),
        MAX_OUTPUT_LENGTH
    )
}

/// Execution mode for the `bash` tool.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum ExecutionMode {
    #[default]
    Default,
    Slow,
    Background,
}

#[derive(Debug, Deserialize)]
struct BashInitInput {
    session_name: String,
    start_directory: String,
}

/// Creates a named, long-lived shell session rooted at a workspace path.
pub struct BashInitTool;

#[async_trait]
impl Tool for BashInitTool {
    fn name(&self) -> &str {
        "bash_init"
    }

    fn description(&self) -> String {
        "Create a named persistent shell session rooted at a directory inside \
the workspace. Must be called before `bash` can run commands in that session \
name.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_name", "start_directory"],
            "properties": {
                "session_name": {
                    "type": "string",
                    "description": "Session identifier, letters/digits/_/- only"
                },
                "start_directory": {
                    "type": "string",
                    "description": "Directory (inside the workspace) the shell starts in"
                }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: BashInitInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let start_dir = match ctx.workspace.resolve_existing_dir(&input.start_directory) {
            Ok(p) => p,
            Err(e) => return ToolOutput::error(e.to_string()),
        };

        match ctx
            .shell_broker
            .create(&ctx.session_id, &input.session_name, &start_dir)
            .await
        {
            Ok(()) => ToolOutput::success(format!(
                "shell session `{}` created at {}",
                input.session_name,
                start_dir.display()
            )),
            Err(e) => ToolOutput::error(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BashInput {
    session_name: String,
    command: String,
    #[serde(default)]
    mode: ExecutionMode,
}

/// Runs a command inside a previously-created shell session.
pub struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> String {
        r#"Runs a command in a named persistent shell session (create one first
with bash_init). State (cwd, env vars, background jobs) persists across calls
within the same session name.

With mode="background", returns quickly without waiting for the command to
finish; use bash_view to check on it later. Use mode="slow" for potentially
slow commands: builds, downloads, installs, tests.

IMPORTANT: Keep commands concise. For complex scripts, write them to a file
first and then execute the file."#
            .to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_name", "command"],
            "properties": {
                "session_name": { "type": "string" },
                "command": { "type": "string", "description": "Shell command to run" },
                "mode": {
                    "type": "string",
                    "enum": ["default", "slow", "background"],
                    "description": "default (30s), slow (15min), background (returns immediately)"
                }
            }
        })
    }

    fn confirmation(&self, input: &Value) -> Confirmation {
        let command = input
            .get("command")
            .and_then(Value::as_str)
            .unwrap_or("<unparsed command>");
        Confirmation::required(format!("run `{command}` in the workspace shell"))
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: BashInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        if input.command.trim().is_empty() {
            return ToolOutput::error("Command cannot be empty");
        }

        let (timeout, background) = match input.mode {
            ExecutionMode::Default => (DEFAULT_TIMEOUT, false),
            ExecutionMode::Slow => (SLOW_TIMEOUT, false),
            ExecutionMode::Background => (BACKGROUND_POLL, true),
        };

        let result = ctx
            .shell_broker
            .run(&ctx.session_id, &input.session_name, &input.command, timeout)
            .await;

        match result {
            Ok(output) => ToolOutput::success(truncate_output(&output)),
            Err(crate::shell::ShellError::CommandTimedOut(name, elapsed)) if background => {
                ToolOutput::success(format!(
                    "command launched in session `{name}`; still running after {elapsed:?}, use bash_view to check on it"
                ))
            }
            Err(e) => ToolOutput::error(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BashViewInput {
    session_names: Vec<String>,
}

/// Captures the current pane contents of one or more shell sessions.
pub struct BashViewTool;

#[async_trait]
impl Tool for BashViewTool {
    fn name(&self) -> &str {
        "bash_view"
    }

    fn description(&self) -> String {
        "View the current output of one or more shell sessions, in the order \
given. Use after a background command to check progress, or to recover a \
session left busy after a timeout.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_names"],
            "properties": {
                "session_names": {
                    "type": "array",
                    "items": { "type": "string" }
                }
            }
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: BashViewInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        if input.session_names.is_empty() {
            return ToolOutput::error("session_names must be non-empty");
        }

        let mut sections = Vec::with_capacity(input.session_names.len());
        for name in &input.session_names {
            match ctx.shell_broker.view(&ctx.session_id, name).await {
                Ok(pane) => sections.push(format!("=== {name} ===\n{pane}")),
                Err(e) => sections.push(format!("=== {name} ===\n[error: {e}]")),
            }
        }
        ToolOutput::success(sections.join("\n\n"))
    }
}

#[derive(Debug, Deserialize)]
struct BashWriteToProcessInput {
    session_name: String,
    text: String,
    #[serde(default = "default_press_enter")]
    press_enter: bool,
}

fn default_press_enter() -> bool {
    true
}

/// Sends raw input to a process already running inside a shell session,
/// for interactive prompts (password prompts, REPLs, confirmation y/n).
pub struct BashWriteToProcessTool;

#[async_trait]
impl Tool for BashWriteToProcessTool {
    fn name(&self) -> &str {
        "bash_write_to_process"
    }

    fn description(&self) -> String {
        "Send text to a running process inside a shell session without \
waiting for it to become idle — for interactive prompts.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_name", "text"],
            "properties": {
                "session_name": { "type": "string" },
                "text": { "type": "string" },
                "press_enter": { "type": "boolean", "description": "default true" }
            }
        })
    }

    fn confirmation(&self, _input: &Value) -> Confirmation {
        Confirmation::required("send input to a running process")
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: BashWriteToProcessInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        match ctx
            .shell_broker
            .write_to_process(&ctx.session_id, &input.session_name, &input.text, input.press_enter)
            .await
        {
            Ok(output) => ToolOutput::success(truncate_output(&output)),
            Err(e) => ToolOutput::error(e.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct BashStopInput {
    session_name: String,
}

/// Interrupts (Ctrl-C) whatever is running in a shell session.
pub struct BashStopTool;

#[async_trait]
impl Tool for BashStopTool {
    fn name(&self) -> &str {
        "bash_stop"
    }

    fn description(&self) -> String {
        "Send Ctrl-C to a shell session to interrupt the running command, \
then return its output once idle again.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["session_name"],
            "properties": {
                "session_name": { "type": "string" }
            }
        })
    }

    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput {
        let input: BashStopInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        match ctx.shell_broker.interrupt(&ctx.session_id, &input.session_name).await {
            Ok(output) => ToolOutput::success(truncate_output(&output)),
            Err(e) => ToolOutput::error(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ModelRegistry;
    use crate::shell::PersistentShellBroker;
    use crate::workspace::WorkspaceGuard;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn test_context(root: std::path::PathBuf) -> ToolContext {
        ToolContext::new(
            CancellationToken::new(),
            "test-session".to_string(),
            Arc::new(WorkspaceGuard::new(root)),
            Arc::new(PersistentShellBroker::new("orch")),
            Arc::new(ModelRegistry::new_empty()),
        )
    }

    #[test]
    fn truncate_output_snips_middle() {
        let long_output = "x".repeat(200_000);
        let truncated = truncate_output(&long_output);
        assert!(truncated.len() < 20_000);
        assert!(truncated.contains("[snip]"));
    }

    #[tokio::test]
    async fn bash_requires_confirmation() {
        let tool = BashTool;
        let confirmation = tool.confirmation(&json!({"session_name": "w1", "command": "rm -rf /"}));
        assert!(confirmation.required);
        assert!(confirmation.summary.contains("rm -rf /"));
    }

    #[tokio::test]
    async fn bash_init_rejects_missing_start_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path().to_path_buf());
        let tool = BashInitTool;
        let result = tool
            .run(
                json!({"session_name": "w1", "start_directory": "does/not/exist"}),
                ctx,
            )
            .await;
        assert!(!result.success);
    }

    #[tokio::test]
    async fn bash_view_rejects_empty_names() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(dir.path().to_path_buf());
        let tool = BashViewTool;
        let result = tool.run(json!({"session_names": []}), ctx).await;
        assert!(!result.success);
    }
}
