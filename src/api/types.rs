//! API request and response types

use serde::{Deserialize, Serialize};

/// Request to start a new session rooted at a fixed working directory
/// (§4.A "Fixed Working Directory" — immutable for the session's
/// lifetime).
#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub cwd: String,
    pub model: Option<String>,
    pub display_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: String,
    pub cwd: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub session_ids: Vec<String>,
}

/// A user-authored instruction, with optional already-uploaded file
/// attachments (images go through `read_image`/the workspace, not this
/// request body).
#[derive(Debug, Deserialize)]
pub struct InstructionRequest {
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct InstructionResponse {
    pub result: String,
}

/// Body for resolving a pending confirmation-gated tool call.
#[derive(Debug, Deserialize)]
pub struct ConfirmationRequest {
    pub policy: crate::tools::ConfirmationPolicy,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ok: bool,
}

/// Response to a user-initiated `/compact`: always a full-history
/// summary, independent of todo segmentation.
#[derive(Debug, Serialize)]
pub struct CompactResponse {
    pub turn_count: u64,
}

/// Model information with metadata
#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
    pub description: String,
    pub context_window: usize,
}

/// Response for model list
#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub models: Vec<ModelInfo>,
    pub default: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            error: message.into(),
        }
    }
}
