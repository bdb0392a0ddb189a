use crate::types::ids::FileId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use utoipa::ToSchema;

/// An in-memory code file. `content` is always the post-edit state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileBuffer {
    pub id: FileId,
    pub name: String,
    pub path: String,
    pub content: String,
    pub language: String,
    pub has_edits: bool,
    pub last_modified: DateTime<Utc>,
}

impl FileBuffer {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let path = path.into();
        let name = Path::new(&path)
            .file_name()
            .map_or_else(|| path.clone(), |name| name.to_string_lossy().to_string());
        let language = language_for_path(&path).to_string();
        Self {
            id: FileId::generate(),
            name,
            path,
            content: content.into(),
            language,
            has_edits: false,
            last_modified: Utc::now(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.content.split('\n').count()
    }

    pub fn summary(&self) -> FileSummary {
        FileSummary {
            path: self.path.clone(),
            name: self.name.clone(),
            language: self.language.clone(),
            size: self.content.len(),
            has_edits: self.has_edits,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct FileSummary {
    pub path: String,
    pub name: String,
    pub language: String,
    pub size: usize,
    pub has_edits: bool,
}

pub fn language_for_path(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("ts" | "mts" | "cts") => "typescript",
        Some("tsx") => "typescriptreact",
        Some("js" | "mjs" | "cjs") => "javascript",
        Some("jsx") => "javascriptreact",
        Some("json") => "json",
        Some("rs") => "rust",
        Some("py") => "python",
        Some("go") => "go",
        Some("md") => "markdown",
        Some("css") => "css",
        Some("html" | "htm") => "html",
        Some("yaml" | "yml") => "yaml",
        Some("toml") => "toml",
        Some("sh" | "bash") => "shell",
        _ => "plaintext",
    }
}
