//! Tool implementations for the session orchestrator.
//!
//! Every tool is stateless: all per-call context (cancellation, workspace
//! boundary, shell broker, LLM access) is injected via `ToolContext` rather
//! than captured at construction time.

mod bash;
pub mod bash_check;
mod files;
mod keyword_search;
mod patch;
mod read_image;
mod think;
mod todo;

pub use bash::{BashInitTool, BashStopTool, BashTool, BashViewTool, BashWriteToProcessTool};
pub use files::{GlobTool, GrepTool, ReadFileTool, WriteFileTool};
pub use keyword_search::KeywordSearchTool;
pub use patch::PatchTool;
pub use read_image::ReadImageTool;
pub use think::ThinkTool;
pub use todo::{MessageUserTool, TodoWriteTool};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::llm::ModelRegistry;
use crate::shell::PersistentShellBroker;
use crate::workspace::WorkspaceGuard;

/// Result from tool execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    pub success: bool,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_data: Option<Value>,
}

impl ToolOutput {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            display_data: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            output: message.into(),
            display_data: None,
        }
    }

    pub fn with_display(mut self, data: Value) -> Self {
        self.display_data = Some(data);
        self
    }
}

/// A user's synchronous decision on a confirmation-gated tool call
/// (glossary: "Confirmation"). Resolved per call against session-scoped
/// state the dispatcher holds in `ConfirmationState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationPolicy {
    /// Run once; ask again next time this tool is called.
    OnceAllow,
    /// Run, and remember this tool name as pre-approved for the session.
    AlwaysThisTool,
    /// Run, and promote the whole session to unattended (no further asks).
    AllowAll,
    /// Don't run; the tool sees a denial observation instead. Carries the
    /// user's alternative instruction, if they gave one, so it reaches the
    /// model in place of the tool's output.
    Deny {
        alternative_instruction: Option<String>,
    },
}

/// Whether a tool call needs the user's explicit go-ahead before running.
#[derive(Debug, Clone, Default)]
pub struct Confirmation {
    pub required: bool,
    pub summary: String,
}

impl Confirmation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn required(summary: impl Into<String>) -> Self {
        Self {
            required: true,
            summary: summary.into(),
        }
    }
}

/// All context needed for a tool invocation.
///
/// Created fresh for each tool call. Tools are stateless singletons and
/// derive everything about the call from this struct.
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation signal for long-running operations.
    pub cancel: CancellationToken,

    /// The session this tool is executing within.
    pub session_id: String,

    /// Sandbox boundary every filesystem-touching tool must resolve
    /// through before touching disk.
    pub workspace: Arc<WorkspaceGuard>,

    /// Shared, process-wide shell session registry, namespaced by
    /// `session_id` internally.
    pub shell_broker: Arc<PersistentShellBroker>,

    llm_registry: Arc<ModelRegistry>,
}

impl ToolContext {
    pub fn new(
        cancel: CancellationToken,
        session_id: String,
        workspace: Arc<WorkspaceGuard>,
        shell_broker: Arc<PersistentShellBroker>,
        llm_registry: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            cancel,
            session_id,
            workspace,
            shell_broker,
            llm_registry,
        }
    }

    pub fn llm_registry(&self) -> &Arc<ModelRegistry> {
        &self.llm_registry
    }
}

/// Trait for tools that can be executed by the agent.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name, unique within a registry.
    fn name(&self) -> &str;

    /// Tool description shown to the LLM.
    fn description(&self) -> String;

    /// JSON-Schema-subset for tool input.
    fn input_schema(&self) -> Value;

    /// Whether this tool can only observe, never mutate, the workspace or
    /// shell state. Informational only; the dispatcher does not use it to
    /// skip confirmation (a read-only tool may still want one, e.g. reading
    /// a path outside the usual project tree).
    fn read_only(&self) -> bool {
        false
    }

    /// Whether this specific call should be gated behind a user decision,
    /// and what to show them. Called with the validated input so tools can
    /// tailor the summary (e.g. the exact command about to run).
    fn confirmation(&self, _input: &Value) -> Confirmation {
        Confirmation::none()
    }

    /// Execute the tool with all context provided via `ToolContext`.
    ///
    /// Tools that spawn long-running subprocesses should monitor
    /// `ctx.cancel` and terminate gracefully when cancelled.
    async fn run(&self, input: Value, ctx: ToolContext) -> ToolOutput;
}

/// Per-session confirmation decisions, so repeated calls to the same tool
/// can skip the round-trip once the user has said "always".
///
/// This mirrors `state_machine::state::ConfirmationState` (which is the
/// copy actually threaded through the turn loop); this one is used by
/// tests and by callers that only need the dispatcher, not the full state
/// machine.
#[derive(Debug, Clone, Default)]
pub struct ConfirmationState {
    pub always_allowed_tools: HashSet<String>,
    pub allow_all: bool,
}

impl ConfirmationState {
    pub fn is_pre_approved(&self, tool_name: &str) -> bool {
        self.allow_all || self.always_allowed_tools.contains(tool_name)
    }

    pub fn record(&mut self, tool_name: &str, policy: ConfirmationPolicy) {
        match policy {
            ConfirmationPolicy::AlwaysThisTool => {
                self.always_allowed_tools.insert(tool_name.to_string());
            }
            ConfirmationPolicy::AllowAll => self.allow_all = true,
            ConfirmationPolicy::OnceAllow | ConfirmationPolicy::Deny { .. } => {}
        }
    }
}

/// Outcome of routing one call through the dispatcher.
pub enum DispatchOutcome {
    /// The tool ran (successfully or not) and produced an observation.
    Ran(ToolOutput),
    /// The tool is gated behind confirmation and none was pre-approved for
    /// this session; the caller must suspend, present `summary` to the
    /// user, and re-dispatch with the resulting `ConfirmationPolicy`
    /// recorded in `confirmation`.
    NeedsConfirmation { summary: String },
}

/// Collection of tools available to a session.
///
/// Stateless — tools are singletons, all per-call context is `ToolContext`.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// The terminal tool: a `ToolCall` to it always ends the controller's
    /// turn loop for that turn.
    pub const TERMINAL_TOOL: &'static str = "message_user";

    /// The sentinel tool whose successful result marks a completed
    /// sub-task segment boundary for the context manager.
    pub const SEGMENT_BOUNDARY_TOOL: &'static str = "todo_write";

    pub fn standard() -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(ThinkTool),
            Arc::new(BashInitTool),
            Arc::new(BashTool),
            Arc::new(BashViewTool),
            Arc::new(BashWriteToProcessTool),
            Arc::new(BashStopTool),
            Arc::new(ReadFileTool),
            Arc::new(WriteFileTool),
            Arc::new(PatchTool::default()),
            Arc::new(GlobTool),
            Arc::new(GrepTool),
            Arc::new(ReadImageTool),
            Arc::new(KeywordSearchTool),
            Arc::new(TodoWriteTool),
            Arc::new(MessageUserTool),
        ];

        Self { tools }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    /// Tool definitions for the LLM request (duty: what the model sees).
    pub fn definitions(&self) -> Vec<crate::llm::ToolDefinition> {
        self.tools
            .iter()
            .map(|t| crate::llm::ToolDefinition {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Validate `input` against a tool's JSON-Schema subset: `required`
    /// properties present, and declared `type`s at least shallowly match.
    /// Not a full JSON-Schema validator — the subset this crate's tools
    /// actually emit (object/string/array/boolean/number + required).
    fn validate_schema(schema: &Value, input: &Value) -> Result<(), String> {
        let Some(schema_obj) = schema.as_object() else {
            return Ok(());
        };

        if schema_obj.get("type").and_then(Value::as_str) == Some("object") && !input.is_object()
        {
            return Err("expected a JSON object".to_string());
        }

        let Some(required) = schema_obj.get("required").and_then(Value::as_array) else {
            return Ok(());
        };

        let input_obj = input.as_object();
        for key in required {
            let Some(key) = key.as_str() else { continue };
            let present = input_obj.is_some_and(|o| o.contains_key(key));
            if !present {
                return Err(format!("missing required field `{key}`"));
            }
        }
        Ok(())
    }

    /// Dispatcher duties 1-5 (§4.C): unknown-tool handling, schema
    /// validation, confirmation gating, execution with every failure
    /// wrapped as an error observation (never a Rust error), and the
    /// caller (the turn loop) is responsible for emitting the
    /// corresponding lifecycle events.
    pub async fn dispatch(
        &self,
        name: &str,
        input: Value,
        ctx: ToolContext,
        confirmation_state: &mut ConfirmationState,
        decision: Option<ConfirmationPolicy>,
    ) -> DispatchOutcome {
        let Some(tool) = self.get(name) else {
            return DispatchOutcome::Ran(ToolOutput::error(format!(
                "unknown tool `{name}`; check the tool name and try again"
            )));
        };

        if let Err(message) = Self::validate_schema(&tool.input_schema(), &input) {
            return DispatchOutcome::Ran(ToolOutput::error(format!(
                "invalid input for `{name}`: {message}"
            )));
        }

        let confirmation = tool.confirmation(&input);
        if confirmation.required && !confirmation_state.is_pre_approved(name) {
            match decision {
                None => {
                    return DispatchOutcome::NeedsConfirmation {
                        summary: confirmation.summary,
                    };
                }
                Some(ConfirmationPolicy::Deny { alternative_instruction }) => {
                    let message = match alternative_instruction {
                        Some(instruction) => format!(
                            "the user declined to run this tool; do this instead: {instruction}"
                        ),
                        None => "the user declined to run this tool".to_string(),
                    };
                    return DispatchOutcome::Ran(ToolOutput::error(message));
                }
                Some(policy) => confirmation_state.record(name, policy),
            }
        }

        let output = tool.run(input, ctx).await;
        DispatchOutcome::Ran(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_carries_terminal_and_segment_tools() {
        let registry = ToolRegistry::standard();
        let names: Vec<_> = registry.definitions().into_iter().map(|d| d.name).collect();
        assert!(names.contains(&ToolRegistry::TERMINAL_TOOL.to_string()));
        assert!(names.contains(&ToolRegistry::SEGMENT_BOUNDARY_TOOL.to_string()));
        assert!(names.contains(&"bash".to_string()));
        assert!(names.contains(&"patch".to_string()));
    }

    #[test]
    fn schema_validation_rejects_missing_required_field() {
        let schema = serde_json::json!({
            "type": "object",
            "required": ["path"],
            "properties": { "path": { "type": "string" } }
        });
        assert!(ToolRegistry::validate_schema(&schema, &serde_json::json!({})).is_err());
        assert!(
            ToolRegistry::validate_schema(&schema, &serde_json::json!({"path": "a"})).is_ok()
        );
    }
}
