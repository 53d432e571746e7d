//! The two tools the turn loop treats specially: `todo_write` (the
//! context manager's segment-boundary sentinel) and `message_user` (the
//! terminal tool).

use super::{Tool, ToolContext, ToolOutput};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
struct TodoItem {
    content: String,
    status: TodoStatus,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum TodoStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Deserialize)]
struct TodoWriteInput {
    todos: Vec<TodoItem>,
}

/// Records the agent's current task breakdown. A successful result from
/// this tool is the segment boundary the context manager scans for when
/// deciding what conversation history is eligible for compaction — see
/// `crate::context`.
pub struct TodoWriteTool;

#[async_trait]
impl Tool for TodoWriteTool {
    fn name(&self) -> &str {
        "todo_write"
    }

    fn description(&self) -> String {
        "Record or update your task breakdown for the current piece of work. \
Call this whenever you plan multi-step work or complete a step, with the full \
current list of todos (not just the ones that changed). Marks a clean \
checkpoint in the conversation that later history compaction can summarize \
around.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["todos"],
            "properties": {
                "todos": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "required": ["content", "status"],
                        "properties": {
                            "content": { "type": "string" },
                            "status": {
                                "type": "string",
                                "enum": ["pending", "in_progress", "completed"]
                            }
                        }
                    }
                }
            }
        })
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        let input: TodoWriteInput = match serde_json::from_value(input) {
            Ok(i) => i,
            Err(e) => return ToolOutput::error(format!("Invalid input: {e}")),
        };

        let completed = input
            .todos
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        ToolOutput::success(format!(
            "recorded {} todo(s), {completed} completed",
            input.todos.len()
        ))
    }
}

#[derive(Debug, Deserialize)]
struct MessageUserInput {
    #[allow(dead_code)] // echoed back as the turn's final answer by the caller
    message: String,
}

/// The terminal tool (§4.C / §4.E): calling it always ends the
/// controller's turn loop for this turn. Its input carries the final
/// answer; the turn loop reads `call.input` directly rather than this
/// tool's `ToolResult`, but the result still has to exist to keep
/// tool-call/tool-result pairing valid.
pub struct MessageUserTool;

#[async_trait]
impl Tool for MessageUserTool {
    fn name(&self) -> &str {
        "message_user"
    }

    fn description(&self) -> String {
        "Send your final answer to the user and end your turn. Call this \
exactly once you have nothing further to do right now — it is the only way \
to stop without another tool call pending.".to_string()
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "required": ["message"],
            "properties": {
                "message": {
                    "type": "string",
                    "description": "The final answer to show the user"
                }
            }
        })
    }

    fn read_only(&self) -> bool {
        true
    }

    async fn run(&self, input: Value, _ctx: ToolContext) -> ToolOutput {
        match serde_json::from_value::<MessageUserInput>(input) {
            Ok(_) => ToolOutput::success("delivered"),
            Err(e) => ToolOutput::error(format!("Invalid input: {e}")),
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

    fn test_context() -> ToolContext {
        ToolContext::new(
            CancellationToken::new(),
            "test-session".to_string(),
            Arc::new(WorkspaceGuard::new("/tmp")),
            Arc::new(PersistentShellBroker::new("orch")),
            Arc::new(ModelRegistry::new_empty()),
        )
    }

    #[tokio::test]
    async fn todo_write_counts_completed() {
        let tool = TodoWriteTool;
        let result = tool
            .run(
                json!({"todos": [
                    {"content": "a", "status": "completed"},
                    {"content": "b", "status": "pending"}
                ]}),
                test_context(),
            )
            .await;
        assert!(result.success);
        assert!(result.output.contains("1 completed"));
    }

    #[tokio::test]
    async fn message_user_is_terminal_and_read_only() {
        let tool = MessageUserTool;
        assert!(tool.read_only());
        let result = tool
            .run(json!({"message": "done"}), test_context())
            .await;
        assert!(result.success);
    }
}
