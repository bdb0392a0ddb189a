use crate::error::DiffError;
use crate::types::{CodeModeDiff, DiffKind};
use std::collections::HashMap;
use std::sync::Arc;

/// Post-edit sanity check for one language.
///
/// Implementations are shallow heuristics, not parsers: a passing check only
/// means nothing obviously broke.
pub trait SyntaxValidator: Send + Sync {
    fn validate(&self, content: &str) -> Result<(), String>;
}

/// Curly-brace balance for JS/TS sources.
#[derive(Debug, Default, Clone, Copy)]
pub struct BraceBalanceValidator;

impl SyntaxValidator for BraceBalanceValidator {
    fn validate(&self, content: &str) -> Result<(), String> {
        let mut depth: i64 = 0;
        for (line_no, line) in content.split('\n').enumerate() {
            for ch in line.chars() {
                match ch {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth < 0 {
                            return Err(format!("unmatched '}}' on line {line_no}"));
                        }
                    }
                    _ => {}
                }
            }
        }
        if depth == 0 {
            Ok(())
        } else {
            Err(format!("{depth} unclosed '{{'"))
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonValidator;

impl SyntaxValidator for JsonValidator {
    fn validate(&self, content: &str) -> Result<(), String> {
        serde_json::from_str::<serde_json::Value>(content)
            .map(|_| ())
            .map_err(|err| err.to_string())
    }
}

/// Validators keyed by language id. Languages without an entry always pass.
#[derive(Clone)]
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn SyntaxValidator>>,
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        let braces: Arc<dyn SyntaxValidator> = Arc::new(BraceBalanceValidator);
        for language in [
            "typescript",
            "typescriptreact",
            "javascript",
            "javascriptreact",
        ] {
            registry.register_shared(language, Arc::clone(&braces));
        }
        registry.register("json", JsonValidator);
        registry
    }
}

impl std::fmt::Debug for ValidatorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut languages: Vec<_> = self.validators.keys().collect();
        languages.sort();
        f.debug_struct("ValidatorRegistry")
            .field("languages", &languages)
            .finish()
    }
}

impl ValidatorRegistry {
    pub fn empty() -> Self {
        Self {
            validators: HashMap::new(),
        }
    }

    pub fn register(&mut self, language: &str, validator: impl SyntaxValidator + 'static) {
        self.register_shared(language, Arc::new(validator));
    }

    pub fn register_shared(&mut self, language: &str, validator: Arc<dyn SyntaxValidator>) {
        self.validators.insert(language.to_string(), validator);
    }

    pub fn validate(&self, language: &str, content: &str) -> Result<(), DiffError> {
        let Some(validator) = self.validators.get(language) else {
            return Ok(());
        };
        validator
            .validate(content)
            .map_err(|reason| DiffError::Syntax {
                language: language.to_string(),
                reason,
            })
    }
}

/// Checks every diff's range against a file of `line_count` lines.
pub fn validate_line_ranges(diffs: &[CodeModeDiff], line_count: usize) -> Result<(), DiffError> {
    for diff in diffs {
        let line_end = diff.last_line();
        let in_bounds = diff.line_start < line_count
            && line_end < line_count
            && diff.line_start <= line_end;
        if !in_bounds {
            return Err(DiffError::InvalidRange {
                line_start: diff.line_start,
                line_end,
                line_count,
            });
        }
    }
    Ok(())
}

/// Rejects batches where removals/modifications overlap, or where an insert
/// lands strictly inside a replaced range.
pub fn validate_no_conflicts(diffs: &[CodeModeDiff]) -> Result<(), DiffError> {
    let mut ranges: Vec<(usize, usize)> = diffs
        .iter()
        .filter(|diff| diff.kind != DiffKind::Add)
        .map(|diff| (diff.line_start, diff.last_line()))
        .collect();
    ranges.sort_unstable();
    for pair in ranges.windows(2) {
        let (_, prev_end) = pair[0];
        let (next_start, _) = pair[1];
        if next_start <= prev_end {
            return Err(DiffError::Conflict { line: next_start });
        }
    }

    for add in diffs.iter().filter(|diff| diff.kind == DiffKind::Add) {
        let inside = ranges
            .iter()
            .any(|&(start, end)| start < add.line_start && add.line_start <= end);
        if inside {
            return Err(DiffError::Conflict {
                line: add.line_start,
            });
        }
    }
    Ok(())
}
