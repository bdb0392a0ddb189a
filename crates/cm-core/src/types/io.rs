use crate::error::CodeModeError;
use crate::types::diff::DiffMap;
use crate::types::enums::ErrorKind;
use crate::types::file::{FileBuffer, FileSummary};
use crate::types::ids::SessionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeModeRequest {
    ReadFile { path: String },
    WriteDiff { diffs: DiffMap },
    ListFiles,
    CreateFile { path: String, content: String },
    DeleteFile { path: String },
}

impl CodeModeRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::WriteDiff { .. } => "write_diff",
            Self::ListFiles => "list_files",
            Self::CreateFile { .. } => "create_file",
            Self::DeleteFile { .. } => "delete_file",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileFailure {
    pub path: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CodeModeResponse {
    FileContent {
        session_id: SessionId,
        success: bool,
        file: FileBuffer,
    },
    DiffPreview {
        session_id: SessionId,
        success: bool,
        diffs: DiffMap,
        /// Would-be content per path after applying `diffs`.
        #[serde(default)]
        previews: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },
    FileList {
        session_id: SessionId,
        success: bool,
        files: Vec<FileSummary>,
    },
    Confirmation {
        session_id: SessionId,
        success: bool,
        message: String,
        #[serde(default)]
        applied: Vec<String>,
        #[serde(default)]
        errors: Vec<FileFailure>,
    },
    Error {
        session_id: SessionId,
        success: bool,
        kind: ErrorKind,
        message: String,
        user_message: String,
    },
}

impl CodeModeResponse {
    pub fn error(session_id: &SessionId, err: &CodeModeError) -> Self {
        Self::Error {
            session_id: session_id.clone(),
            success: false,
            kind: err.kind(),
            message: err.to_string(),
            user_message: err.user_message(),
        }
    }

    pub fn session_id(&self) -> &SessionId {
        match self {
            Self::FileContent { session_id, .. }
            | Self::DiffPreview { session_id, .. }
            | Self::FileList { session_id, .. }
            | Self::Confirmation { session_id, .. }
            | Self::Error { session_id, .. } => session_id,
        }
    }

    pub fn success(&self) -> bool {
        match self {
            Self::FileContent { success, .. }
            | Self::DiffPreview { success, .. }
            | Self::FileList { success, .. }
            | Self::Confirmation { success, .. }
            | Self::Error { success, .. } => *success,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::FileContent { .. } => "file_content",
            Self::DiffPreview { .. } => "diff_preview",
            Self::FileList { .. } => "file_list",
            Self::Confirmation { .. } => "confirmation",
            Self::Error { .. } => "error",
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Error { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Message suitable for showing to an end user, when the response has one.
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Confirmation { message, .. } => Some(message),
            Self::Error { user_message, .. } => Some(user_message),
            Self::DiffPreview { summary, .. } => summary.as_deref(),
            Self::FileContent { .. } | Self::FileList { .. } => None,
        }
    }
}
