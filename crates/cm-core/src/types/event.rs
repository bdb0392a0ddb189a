use crate::types::enums::ErrorKind;
use crate::types::ids::SessionId;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum IntegrationEvent {
    SessionCreated {
        session_id: SessionId,
        file_count: usize,
    },
    SessionStarted {
        session_id: SessionId,
        orchestrator_session_id: String,
    },
    SessionProgress {
        session_id: SessionId,
        orchestrator_session_id: String,
        progress: Option<f64>,
        message: Option<String>,
    },
    SessionCompleted {
        session_id: SessionId,
    },
    OrchestratorCompleted {
        session_id: SessionId,
        orchestrator_session_id: String,
        diff_count: usize,
    },
    SessionFailed {
        session_id: SessionId,
        error: String,
    },
    OrchestratorFailed {
        session_id: SessionId,
        orchestrator_session_id: String,
        error: String,
    },
    SessionCancelled {
        session_id: SessionId,
        /// The session was mid-`processing` when cancelled.
        forced: bool,
    },
    SessionExpired {
        session_id: SessionId,
    },
    DiffsApplied {
        session_id: SessionId,
        applied: Vec<String>,
        failed: Vec<String>,
    },
    SessionError {
        session_id: SessionId,
        kind: ErrorKind,
        message: String,
    },
}

impl IntegrationEvent {
    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::SessionCreated { session_id, .. }
            | Self::SessionStarted { session_id, .. }
            | Self::SessionProgress { session_id, .. }
            | Self::SessionCompleted { session_id }
            | Self::OrchestratorCompleted { session_id, .. }
            | Self::SessionFailed { session_id, .. }
            | Self::OrchestratorFailed { session_id, .. }
            | Self::SessionCancelled { session_id, .. }
            | Self::SessionExpired { session_id }
            | Self::DiffsApplied { session_id, .. }
            | Self::SessionError { session_id, .. } => session_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::SessionCreated { .. } => "session_created",
            Self::SessionStarted { .. } => "session_started",
            Self::SessionProgress { .. } => "session_progress",
            Self::SessionCompleted { .. } => "session_completed",
            Self::OrchestratorCompleted { .. } => "orchestrator_completed",
            Self::SessionFailed { .. } => "session_failed",
            Self::OrchestratorFailed { .. } => "orchestrator_failed",
            Self::SessionCancelled { .. } => "session_cancelled",
            Self::SessionExpired { .. } => "session_expired",
            Self::DiffsApplied { .. } => "diffs_applied",
            Self::SessionError { .. } => "session_error",
        }
    }
}
