use crate::types::enums::DiffKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use utoipa::ToSchema;

/// Diffs grouped by file path.
pub type DiffMap = BTreeMap<String, Vec<CodeModeDiff>>;

/// A single line-range edit. Line numbers are zero-based; `line_end` is inclusive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct CodeModeDiff {
    #[serde(rename = "type")]
    pub kind: DiffKind,
    pub line_start: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_end: Option<usize>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl CodeModeDiff {
    pub fn add(line_start: usize, content: impl Into<String>) -> Self {
        Self {
            kind: DiffKind::Add,
            line_start,
            line_end: None,
            content: content.into(),
            original_content: None,
            confidence: None,
        }
    }

    pub fn remove(line_start: usize, line_end: Option<usize>) -> Self {
        Self {
            kind: DiffKind::Remove,
            line_start,
            line_end,
            content: String::new(),
            original_content: None,
            confidence: None,
        }
    }

    pub fn modify(line_start: usize, line_end: Option<usize>, content: impl Into<String>) -> Self {
        Self {
            kind: DiffKind::Modify,
            line_start,
            line_end,
            content: content.into(),
            original_content: None,
            confidence: None,
        }
    }

    /// Last line touched by this edit.
    pub fn last_line(&self) -> usize {
        self.line_end.unwrap_or(self.line_start)
    }
}
