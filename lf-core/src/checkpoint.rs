//! Turn checkpoints keyed by session.
//!
//! A checkpoint holds the complete turn state plus the node to run next.
//! Stores replace a session's checkpoint in a single write, so a reader sees
//! either the old checkpoint or the new one.

use crate::state::{TurnPhase, TurnState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::debug;

/// Errors from checkpoint stores.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Checkpoint namespace for a session.
pub fn thread_id(session_number: u32) -> String {
    format!("session_{session_number}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub version: u32,
    pub thread_id: String,
    pub saved_at: DateTime<Utc>,
    pub state: TurnState,
    /// `None` once the turn has reached the end.
    pub next_node: Option<TurnPhase>,
}

impl Checkpoint {
    pub fn new(state: TurnState, next_node: Option<TurnPhase>) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            thread_id: thread_id(state.session_number),
            saved_at: Utc::now(),
            state,
            next_node,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.next_node.is_none()
    }

    /// The interrupt the turn is suspended at, if it is waiting on the DM.
    pub fn awaiting_phase(&self) -> Option<TurnPhase> {
        self.next_node
            .filter(|p| p.is_interrupt() && !self.state.dm_intervention_required)
    }
}

/// Persisted checkpoints.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Replace the checkpoint for `checkpoint.thread_id`.
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError>;

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError>;

    async fn delete(&self, thread_id: &str) -> Result<bool, CheckpointError>;

    /// Thread ids with a checkpoint, sorted.
    async fn list(&self) -> Result<Vec<String>, CheckpointError>;
}

/// Process-local checkpoints, lost on restart.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        self.checkpoints
            .write()
            .await
            .insert(checkpoint.thread_id.clone(), checkpoint.clone());
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.read().await.get(thread_id).cloned())
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, CheckpointError> {
        Ok(self.checkpoints.write().await.remove(thread_id).is_some())
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids: Vec<String> = self.checkpoints.read().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// One pretty-printed JSON file per session in a directory.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, thread_id: &str) -> PathBuf {
        let sanitized: String = thread_id
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{sanitized}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn save(&self, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(&checkpoint.thread_id);
        let tmp = path.with_extension("json.tmp");

        let content = serde_json::to_string_pretty(checkpoint)?;
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, &path).await?;

        debug!(thread_id = %checkpoint.thread_id, path = %path.display(), "Saved checkpoint");
        Ok(())
    }

    async fn load(&self, thread_id: &str) -> Result<Option<Checkpoint>, CheckpointError> {
        let path = self.path_for(thread_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        // Check the version before the full parse so old formats fail clearly.
        #[derive(Deserialize)]
        struct Partial {
            version: u32,
        }
        let partial: Partial = serde_json::from_str(&content)?;
        if partial.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::VersionMismatch {
                expected: CHECKPOINT_VERSION,
                found: partial.version,
            });
        }

        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn delete(&self, thread_id: &str) -> Result<bool, CheckpointError> {
        match fs::remove_file(self.path_for(thread_id)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<String>, CheckpointError> {
        let mut ids = Vec::new();
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ids),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Some(stem) = path.file_stem() {
                    ids.push(stem.to_string_lossy().to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpoint(session: u32, next: Option<TurnPhase>) -> Checkpoint {
        let state = TurnState::new(1, session, "A signal pulses", vec!["agent_alex".into()]);
        Checkpoint::new(state, next)
    }

    #[test]
    fn test_awaiting_phase() {
        assert_eq!(
            checkpoint(1, Some(TurnPhase::DmAdjudication)).awaiting_phase(),
            Some(TurnPhase::DmAdjudication)
        );
        assert_eq!(checkpoint(1, Some(TurnPhase::ResolveHelpers)).awaiting_phase(), None);

        let mut escalated = checkpoint(1, Some(TurnPhase::DmOutcome));
        escalated.state.dm_intervention_required = true;
        assert_eq!(escalated.awaiting_phase(), None);
        assert!(checkpoint(1, None).is_complete());
    }

    #[tokio::test]
    async fn test_in_memory_replaces() {
        let store = InMemoryCheckpointStore::new();
        store.save(&checkpoint(3, Some(TurnPhase::DmAdjudication))).await.unwrap();
        store.save(&checkpoint(3, Some(TurnPhase::DmOutcome))).await.unwrap();

        let loaded = store.load("session_3").await.unwrap().unwrap();
        assert_eq!(loaded.next_node, Some(TurnPhase::DmOutcome));
        assert_eq!(store.list().await.unwrap(), vec!["session_3"]);
        assert!(store.delete("session_3").await.unwrap());
        assert!(store.load("session_3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let saved = checkpoint(7, Some(TurnPhase::LaserFeelingsQuestion));
        store.save(&saved).await.unwrap();

        let loaded = store.load("session_7").await.unwrap().unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.list().await.unwrap(), vec!["session_7"]);
        assert!(store.load("session_8").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_version_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileCheckpointStore::new(dir.path());
        let mut saved = checkpoint(2, None);
        saved.version = 99;
        store.save(&saved).await.unwrap();

        let err = store.load("session_2").await.unwrap_err();
        assert!(matches!(
            err,
            CheckpointError::VersionMismatch { expected: 1, found: 99 }
        ));
    }
}
