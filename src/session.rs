//! A `Session` bundles everything one conversation needs to run turns:
//! its workspace boundary, shared tool registry, conversation history,
//! and the state-machine bookkeeping the turn loop advances. `SessionManager`
//! is the process-wide registry of active sessions, keyed by session id.

use crate::context::ContextManager;
use crate::events::EventStream;
use crate::llm::{LlmService, ModelRegistry};
use crate::message::State;
use crate::shell::PersistentShellBroker;
use crate::state_machine::{ConfirmationState, ConvContext, ConvState};
use crate::store::{SessionMetadata, SessionStore};
use crate::tools::ToolRegistry;
use crate::workspace::WorkspaceGuard;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session `{0}` not found")]
    NotFound(String),
    #[error("no LLM model is configured; set an API key or a gateway URL")]
    NoModelAvailable,
    #[error("workspace `{0}` is already owned by another live session")]
    WorkspaceInUse(PathBuf),
    #[error(transparent)]
    Store(#[from] crate::store::StoreError),
    #[error(transparent)]
    Workspace(#[from] crate::workspace::WorkspaceError),
}

/// Mutable, per-session runtime state guarded behind a single lock so the
/// turn loop (see `runtime::executor`) always observes a consistent view.
pub struct SessionInner {
    pub conv_state: ConvState,
    pub history: State,
    pub confirmations: ConfirmationState,
}

/// Everything one conversation needs in order to run turns.
///
/// Shared collaborators (`llm`, `shell_broker`, `tools`) are `Arc`'d so
/// many sessions can reuse the same process-wide services; the
/// conversation-specific pieces (`inner`, `cancel`) are exclusive to this
/// session.
pub struct Session {
    pub id: String,
    pub workspace: Arc<WorkspaceGuard>,
    pub tools: Arc<ToolRegistry>,
    pub shell_broker: Arc<PersistentShellBroker>,
    pub llm: Arc<dyn LlmService>,
    pub llm_registry: Arc<ModelRegistry>,
    pub model_id: String,
    pub context_manager: ContextManager,
    pub events: Arc<EventStream>,
    pub store: SessionStore,
    pub inner: Mutex<SessionInner>,
    /// Cancellation token for whatever turn-loop invocation is currently
    /// running. Replaced with a fresh token at the start of each
    /// invocation so a stale cancel from a prior turn can never leak
    /// forward.
    pub cancel: RwLock<CancellationToken>,
    /// Delivers the user's decision on a confirmation-gated tool call to
    /// whichever turn loop is waiting on one. Capacity 1: at most one
    /// confirmation is ever outstanding per session.
    pub confirmation_tx: mpsc::Sender<crate::tools::ConfirmationPolicy>,
    pub confirmation_rx: Mutex<mpsc::Receiver<crate::tools::ConfirmationPolicy>>,
    /// Serializes turn-loop invocations for this session: only one
    /// `run_turn_loop` may be advancing `inner` at a time.
    pub turn_lock: Mutex<()>,
}

impl Session {
    pub fn conv_context(&self) -> ConvContext {
        ConvContext::new(
            self.id.clone(),
            self.workspace.root().to_path_buf(),
            self.model_id.clone(),
            self.llm_registry.context_window(&self.model_id),
        )
    }

    /// Swap in a fresh cancellation token for a new turn-loop invocation
    /// and return it.
    pub async fn new_invocation_token(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.cancel.write().await = token.clone();
        token
    }

    pub async fn cancel_token(&self) -> CancellationToken {
        self.cancel.read().await.clone()
    }
}

/// Process-wide registry of active sessions plus the collaborators every
/// new session is built from.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    store: SessionStore,
    llm_registry: Arc<ModelRegistry>,
    shell_broker: Arc<PersistentShellBroker>,
    default_context_window: usize,
}

impl SessionManager {
    pub fn new(
        store: SessionStore,
        llm_registry: Arc<ModelRegistry>,
        shell_prompt_prefix: impl Into<String>,
        default_context_window: usize,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            llm_registry,
            shell_broker: Arc::new(PersistentShellBroker::new(shell_prompt_prefix)),
            default_context_window,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Create a brand-new session rooted at `workspace_root`, using
    /// `model_id` (or the registry default if `None`).
    pub async fn create(
        &self,
        workspace_root: PathBuf,
        model_id: Option<String>,
        display_name: Option<String>,
    ) -> Result<Arc<Session>, SessionError> {
        let model_id = model_id
            .or_else(|| Some(self.llm_registry.default_model_id().to_string()))
            .ok_or(SessionError::NoModelAvailable)?;
        let llm = self
            .llm_registry
            .get(&model_id)
            .ok_or(SessionError::NoModelAvailable)?;

        if self.workspace_in_use(&workspace_root).await {
            return Err(SessionError::WorkspaceInUse(workspace_root));
        }

        let session_id = Uuid::new_v4().to_string();
        let workspace = Arc::new(WorkspaceGuard::new(workspace_root.clone()));
        let context_window = self.llm_registry.context_window(&model_id);

        let metadata = SessionMetadata {
            session_id: session_id.clone(),
            display_name: display_name.unwrap_or_else(|| session_id.clone()),
            created_at: Utc::now(),
            workspace_root,
            model_id: model_id.clone(),
        };
        self.store.save_metadata(&metadata).await?;
        self.store.save_state(&session_id, &State::default()).await?;

        let session = self.build_session(session_id, workspace, llm, model_id, context_window);
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    /// Look up a session already resident in memory, or restore it from
    /// disk if this is the first access since process start.
    pub async fn get_or_restore(&self, session_id: &str) -> Result<Arc<Session>, SessionError> {
        if let Some(session) = self.sessions.read().await.get(session_id).cloned() {
            return Ok(session);
        }

        let metadata = self.store.load_metadata(session_id).await?;
        let history = self.store.load_state(session_id).await?;
        let llm = self
            .llm_registry
            .get(&metadata.model_id)
            .ok_or(SessionError::NoModelAvailable)?;
        let workspace = Arc::new(WorkspaceGuard::new(metadata.workspace_root.clone()));
        let context_window = self.llm_registry.context_window(&metadata.model_id);

        let session = self.build_session(
            session_id.to_string(),
            workspace,
            llm,
            metadata.model_id,
            context_window,
        );
        session.inner.lock().await.history = history;
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(session)
    }

    pub async fn list_ids(&self) -> Vec<String> {
        self.store.list_session_ids().await
    }

    pub async fn remove(&self, session_id: &str) {
        self.shell_broker.kill_all(session_id).await;
        self.sessions.write().await.remove(session_id);
    }

    /// Two live sessions must never point at the same workspace root, so
    /// concurrent tool dispatch from either one can't race the other's
    /// filesystem/shell state underneath it.
    async fn workspace_in_use(&self, root: &std::path::Path) -> bool {
        self.sessions
            .read()
            .await
            .values()
            .any(|session| session.workspace.root() == root)
    }

    fn build_session(
        &self,
        session_id: String,
        workspace: Arc<WorkspaceGuard>,
        llm: Arc<dyn LlmService>,
        model_id: String,
        context_window: usize,
    ) -> Arc<Session> {
        let (confirmation_tx, confirmation_rx) = mpsc::channel(1);
        Arc::new(Session {
            id: session_id.clone(),
            workspace,
            tools: Arc::new(ToolRegistry::standard()),
            shell_broker: self.shell_broker.clone(),
            llm,
            llm_registry: self.llm_registry.clone(),
            model_id,
            context_manager: ContextManager::new(if context_window == 0 {
                self.default_context_window
            } else {
                context_window
            }),
            events: Arc::new(EventStream::new(session_id.clone())),
            store: self.store.clone(),
            inner: Mutex::new(SessionInner {
                conv_state: ConvState::Idle,
                history: State::default(),
                confirmations: ConfirmationState::default(),
            }),
            cancel: RwLock::new(CancellationToken::new()),
            confirmation_tx,
            confirmation_rx: Mutex::new(confirmation_rx),
            turn_lock: Mutex::new(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(data_dir: &std::path::Path) -> SessionManager {
        SessionManager::new(
            SessionStore::new(data_dir),
            Arc::new(ModelRegistry::new_empty()),
            "orchestrator",
            150_000,
        )
    }

    #[tokio::test]
    async fn create_fails_without_a_configured_model() {
        let data = TempDir::new().unwrap();
        let ws = TempDir::new().unwrap();
        let manager = manager(data.path());
        let err = manager
            .create(ws.path().to_path_buf(), Some("no-such-model".into()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::NoModelAvailable));
    }

    #[tokio::test]
    async fn restore_fails_for_unknown_session() {
        let data = TempDir::new().unwrap();
        let manager = manager(data.path());
        let err = manager.get_or_restore("nope").await.unwrap_err();
        assert!(matches!(err, SessionError::Store(_)));
    }
}
