//! Process configuration, read once from the environment at startup.

use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which `sessions/<session_id>/{agent_state.json,metadata.json}`
    /// are persisted.
    pub data_dir: PathBuf,
    pub port: u16,
    /// Default token budget before the context manager starts compacting.
    pub context_window: usize,
    /// Prefix used when building the synthetic shell prompt (see `shell::broker`).
    pub shell_prompt_prefix: String,
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub fireworks_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub gateway: Option<String>,
    pub default_model: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let data_dir = std::env::var("ORCHESTRATOR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".session-orchestrator")
            });

        let port: u16 = std::env::var("ORCHESTRATOR_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8000);

        let context_window: usize = std::env::var("ORCHESTRATOR_CONTEXT_WINDOW")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(150_000);

        let shell_prompt_prefix = std::env::var("ORCHESTRATOR_SHELL_PROMPT_PREFIX")
            .unwrap_or_else(|_| "orchestrator".to_string());

        Self {
            data_dir,
            port,
            context_window,
            shell_prompt_prefix,
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY").ok(),
            openai_api_key: std::env::var("OPENAI_API_KEY").ok(),
            fireworks_api_key: std::env::var("FIREWORKS_API_KEY").ok(),
            gemini_api_key: std::env::var("GEMINI_API_KEY").ok(),
            gateway: std::env::var("LLM_GATEWAY").ok(),
            default_model: std::env::var("DEFAULT_MODEL").ok(),
        }
    }

    pub fn llm_config(&self) -> crate::llm::LlmConfig {
        crate::llm::LlmConfig {
            anthropic_api_key: self.anthropic_api_key.clone(),
            openai_api_key: self.openai_api_key.clone(),
            fireworks_api_key: self.fireworks_api_key.clone(),
            gemini_api_key: self.gemini_api_key.clone(),
            gateway: self.gateway.clone(),
            default_model: self.default_model.clone(),
        }
    }
}
