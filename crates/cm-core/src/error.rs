use crate::types::enums::ErrorKind;
use crate::types::ids::SessionId;
use thiserror::Error;

/// Why a single file's diff batch was rejected. The file is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiffError {
    #[error("file not found: {path}")]
    FileNotFound { path: String },
    #[error("invalid line range {line_start}..={line_end} for file with {line_count} lines")]
    InvalidRange {
        line_start: usize,
        line_end: usize,
        line_count: usize,
    },
    #[error("conflicting edits touch line {line}")]
    Conflict { line: usize },
    #[error("{language} syntax check failed: {reason}")]
    Syntax { language: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrchestratorError {
    #[error("orchestrator session not found: {0}")]
    SessionNotFound(String),
    #[error("orchestrator rejected request: {0}")]
    Rejected(String),
    #[error("orchestrator task failed: {0}")]
    TaskFailed(String),
    #[error("orchestrator event stream closed")]
    StreamClosed,
    #[error("orchestrator internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Facade-level error taxonomy. Every variant maps to one [`ErrorKind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeModeError {
    #[error("maximum concurrent sessions ({max}) reached")]
    SessionLimitExceeded { max: usize },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        session_id: Option<SessionId>,
    },
    #[error("Request timed out")]
    Timeout {
        session_id: SessionId,
        timeout_ms: u64,
    },
    #[error("unexpected error: {message}")]
    Unknown {
        message: String,
        session_id: Option<SessionId>,
    },
}

impl CodeModeError {
    pub fn invalid(session_id: &SessionId, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            session_id: Some(session_id.clone()),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionLimitExceeded { .. } => ErrorKind::SessionLimitExceeded,
            Self::SessionNotFound { .. } => ErrorKind::SessionNotFound,
            Self::InvalidRequest { .. } => ErrorKind::InvalidRequest,
            Self::Timeout { .. } => ErrorKind::TimeoutError,
            Self::Unknown { .. } => ErrorKind::UnknownError,
        }
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        match self {
            Self::SessionLimitExceeded { .. } => None,
            Self::SessionNotFound { session_id } | Self::Timeout { session_id, .. } => {
                Some(session_id)
            }
            Self::InvalidRequest { session_id, .. } | Self::Unknown { session_id, .. } => {
                session_id.as_ref()
            }
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            Self::SessionLimitExceeded { max } => format!(
                "Too many active code sessions (limit {max}). Close one and try again."
            ),
            Self::SessionNotFound { .. } => {
                "This code session no longer exists. Start a new one.".to_string()
            }
            Self::InvalidRequest { message, .. } => format!("The request was rejected: {message}"),
            Self::Timeout { .. } => {
                "The code task took too long and was stopped. Try a smaller request.".to_string()
            }
            Self::Unknown { .. } => "Something went wrong while processing the code task.".to_string(),
        }
    }

    pub fn from_orchestrator(session_id: &SessionId, err: &OrchestratorError) -> Self {
        Self::Unknown {
            message: err.to_string(),
            session_id: Some(session_id.clone()),
        }
    }
}
