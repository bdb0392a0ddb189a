//! The external code orchestrator, consumed as a black-box task runner.

pub mod adapter;
pub mod mock;

pub use adapter::OrchestratorAdapter;
pub use mock::{MockOrchestrator, MockScript};

use crate::error::OrchestratorError;
use crate::types::{DiffKind, FileBuffer};
use async_trait::async_trait;
use cm_events::Subscription;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorFile {
    pub path: String,
    pub content: String,
    pub language: String,
}

impl From<&FileBuffer> for OrchestratorFile {
    fn from(file: &FileBuffer) -> Self {
        Self {
            path: file.path.clone(),
            content: file.content.clone(),
            language: file.language.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorRequest {
    pub task: String,
    pub rules: Option<String>,
    pub files: Vec<OrchestratorFile>,
}

/// A single edit as the orchestrator reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorDiff {
    pub file_path: String,
    pub kind: DiffKind,
    pub line_start: usize,
    pub line_end: Option<usize>,
    pub new_content: String,
    pub old_content: Option<String>,
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct OrchestratorResult {
    pub diffs: Vec<OrchestratorDiff>,
    pub summary: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEventKind {
    Started,
    Progress {
        progress: Option<f64>,
        message: Option<String>,
    },
    Completed {
        result: OrchestratorResult,
    },
    Failed {
        error: String,
    },
}

/// Lifecycle event keyed by the orchestrator's own session id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorEvent {
    pub orchestrator_session_id: String,
    pub kind: OrchestratorEventKind,
}

/// Trusted for data shape, never for timing: a started session may never
/// complete.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Starts a task and returns the orchestrator's session id. Progress and
    /// the outcome arrive later as events.
    async fn start_session(&self, request: OrchestratorRequest) -> Result<String, OrchestratorError>;

    async fn cancel_session(&self, orchestrator_session_id: &str) -> Result<(), OrchestratorError>;

    fn subscribe(&self) -> Subscription<OrchestratorEvent>;
}
