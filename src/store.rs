//! Flat-file persistence for conversation state (§4.F `StateStore`, §6
//! "Persisted State layout").
//!
//! Each session gets `<data_dir>/sessions/<session_id>/agent_state.json`
//! (the ordered `Message` array plus counters) and
//! `<data_dir>/sessions/<session_id>/metadata.json` (display name, creation
//! time, workspace path). The format round-trips every content block kind,
//! including opaque `Thinking`/`RedactedThinking` bytes, because both ride
//! through `serde_json` untouched.

use crate::message::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error persisting session `{session_id}`: {source}")]
    Io {
        session_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt session state for `{session_id}`: {source}")]
    Corrupt {
        session_id: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub session_id: String,
    pub display_name: String,
    pub created_at: DateTime<Utc>,
    pub workspace_root: PathBuf,
    pub model_id: String,
}

/// Persists and restores `State` + `SessionMetadata` for one data directory.
/// Stateless beyond the root path; safe to share across every session via
/// `Arc`.
#[derive(Clone)]
pub struct SessionStore {
    data_dir: PathBuf,
}

impl SessionStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.data_dir.join("sessions").join(session_id)
    }

    fn state_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("agent_state.json")
    }

    fn metadata_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("metadata.json")
    }

    pub async fn save_state(&self, session_id: &str, state: &State) -> Result<(), StoreError> {
        let dir = self.session_dir(session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io { session_id: session_id.to_string(), source })?;
        let json = serde_json::to_vec_pretty(state).expect("State serialization cannot fail");
        tokio::fs::write(self.state_path(session_id), json)
            .await
            .map_err(|source| StoreError::Io { session_id: session_id.to_string(), source })
    }

    pub async fn load_state(&self, session_id: &str) -> Result<State, StoreError> {
        let bytes = tokio::fs::read(self.state_path(session_id))
            .await
            .map_err(|source| StoreError::Io { session_id: session_id.to_string(), source })?;
        serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Corrupt { session_id: session_id.to_string(), source })
    }

    pub async fn save_metadata(&self, metadata: &SessionMetadata) -> Result<(), StoreError> {
        let dir = self.session_dir(&metadata.session_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StoreError::Io { session_id: metadata.session_id.clone(), source })?;
        let json = serde_json::to_vec_pretty(metadata).expect("SessionMetadata serialization cannot fail");
        tokio::fs::write(self.metadata_path(&metadata.session_id), json)
            .await
            .map_err(|source| StoreError::Io { session_id: metadata.session_id.clone(), source })
    }

    pub async fn load_metadata(&self, session_id: &str) -> Result<SessionMetadata, StoreError> {
        let bytes = tokio::fs::read(self.metadata_path(session_id))
            .await
            .map_err(|source| StoreError::Io { session_id: session_id.to_string(), source })?;
        serde_json::from_slice(&bytes)
            .map_err(|source| StoreError::Corrupt { session_id: session_id.to_string(), source })
    }

    /// List every session_id with persisted metadata, for process restart.
    pub async fn list_session_ids(&self) -> Vec<String> {
        let root = self.data_dir.join("sessions");
        let Ok(mut entries) = tokio::fs::read_dir(&root).await else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            if entry.path().is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_string());
                }
            }
        }
        ids
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use tempfile::TempDir;

    #[tokio::test]
    async fn round_trips_state_including_opaque_thinking() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());

        let mut state = State::default();
        state.push(Message::user_text("hi"));
        state.push(Message::assistant(vec![crate::message::ContentBlock::RedactedThinking {
            opaque_bytes: "deadbeef".into(),
        }]));

        store.save_state("s1", &state).await.unwrap();
        let loaded = store.load_state("s1").await.unwrap();
        assert_eq!(loaded.messages.len(), 2);
        assert_eq!(loaded.messages[1].content[0], state.messages[1].content[0]);
    }

    #[tokio::test]
    async fn round_trips_metadata() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        let metadata = SessionMetadata {
            session_id: "s1".into(),
            display_name: "My Session".into(),
            created_at: Utc::now(),
            workspace_root: PathBuf::from("/tmp/ws-s1"),
            model_id: "claude-4.5-sonnet".into(),
        };
        store.save_metadata(&metadata).await.unwrap();
        let loaded = store.load_metadata("s1").await.unwrap();
        assert_eq!(loaded.display_name, "My Session");
    }

    #[tokio::test]
    async fn list_session_ids_finds_persisted_sessions() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        store.save_state("s1", &State::default()).await.unwrap();
        store.save_state("s2", &State::default()).await.unwrap();
        let mut ids = store.list_session_ids().await;
        ids.sort();
        assert_eq!(ids, vec!["s1".to_string(), "s2".to_string()]);
    }

    #[tokio::test]
    async fn missing_session_is_an_io_error() {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::new(dir.path());
        assert!(matches!(store.load_state("nope").await, Err(StoreError::Io { .. })));
    }
}
