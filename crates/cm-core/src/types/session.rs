use crate::types::diff::DiffMap;
use crate::types::enums::SessionStatus;
use crate::types::file::FileBuffer;
use crate::types::ids::SessionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Session {
    pub id: SessionId,
    /// Empty until the orchestrator has been started for this session.
    pub orchestrator_session_id: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub files: Vec<FileBuffer>,
    pub pending_diffs: DiffMap,
    pub error: Option<String>,
    pub fingerprint: String,
}

impl Session {
    pub fn file(&self, path: &str) -> Option<&FileBuffer> {
        self.files.iter().find(|file| file.path == path)
    }

    pub fn file_mut(&mut self, path: &str) -> Option<&mut FileBuffer> {
        self.files.iter_mut().find(|file| file.path == path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ToSchema)]
pub struct SessionStats {
    pub total: usize,
    pub initializing: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub max_concurrent_sessions: usize,
}

impl SessionStats {
    pub fn active(&self) -> usize {
        self.initializing + self.processing
    }
}
