use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Initializing,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SessionStatus {
    /// Live sessions count against the concurrency limit and own their fingerprint.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Initializing | Self::Processing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DiffKind {
    Add,
    Remove,
    Modify,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    SessionLimitExceeded,
    SessionNotFound,
    InvalidRequest,
    TimeoutError,
    UnknownError,
}

impl ErrorKind {
    pub fn code(self) -> &'static str {
        match self {
            Self::SessionLimitExceeded => "SESSION_LIMIT_EXCEEDED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}
