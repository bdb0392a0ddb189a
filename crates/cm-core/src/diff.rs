use crate::error::DiffError;
use crate::types::{CodeModeDiff, DiffKind, FileBuffer};
use crate::validation::{ValidatorRegistry, validate_line_ranges, validate_no_conflicts};
use chrono::Utc;
use std::cmp::Reverse;

/// Applies line-range edits to file buffers. A batch is all-or-nothing per file.
#[derive(Debug, Clone, Default)]
pub struct DiffApplicator {
    validators: ValidatorRegistry,
    auto_validate: bool,
}

impl DiffApplicator {
    pub fn new(validators: ValidatorRegistry, auto_validate: bool) -> Self {
        Self {
            validators,
            auto_validate,
        }
    }

    /// Returns the content that `diffs` would produce, without touching `content`.
    pub fn preview(
        &self,
        content: &str,
        language: &str,
        diffs: &[CodeModeDiff],
    ) -> Result<String, DiffError> {
        let mut lines: Vec<String> = content.split('\n').map(str::to_string).collect();
        validate_line_ranges(diffs, lines.len())?;
        validate_no_conflicts(diffs)?;

        for index in application_order(diffs) {
            apply_one(&mut lines, &diffs[index]);
        }

        let updated = lines.join("\n");
        if self.auto_validate {
            self.validators.validate(language, &updated)?;
        }
        Ok(updated)
    }

    pub fn apply(&self, file: &mut FileBuffer, diffs: &[CodeModeDiff]) -> Result<(), DiffError> {
        let updated = self.preview(&file.content, &file.language, diffs)?;
        file.content = updated;
        file.has_edits = true;
        file.last_modified = Utc::now();
        Ok(())
    }
}

/// Descending `line_start`; at equal lines replacements run before inserts, and
/// inserts run in reverse input order so they land in input order.
fn application_order(diffs: &[CodeModeDiff]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..diffs.len()).collect();
    order.sort_by_key(|&index| {
        let diff = &diffs[index];
        let insert_rank = u8::from(diff.kind == DiffKind::Add);
        (Reverse(diff.line_start), insert_rank, Reverse(index))
    });
    order
}

fn apply_one(lines: &mut Vec<String>, diff: &CodeModeDiff) {
    let start = diff.line_start;
    let end = diff.last_line();
    match diff.kind {
        DiffKind::Add => {
            let inserted = diff.content.split('\n').map(str::to_string);
            lines.splice(start..start, inserted);
        }
        DiffKind::Remove => {
            lines.drain(start..=end);
        }
        DiffKind::Modify => {
            let replacement = diff.content.split('\n').map(str::to_string);
            lines.splice(start..=end, replacement);
        }
    }
}
