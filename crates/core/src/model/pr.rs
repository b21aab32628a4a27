use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

/// Human-facing description of the change set, produced by the narrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrDescription {
    pub plan_id: String,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    /// File path -> one-line description of what changed there.
    #[serde(default)]
    pub changes_by_file: BTreeMap<String, String>,
    #[serde(default)]
    pub breaking_changes: Vec<String>,
    #[serde(default)]
    pub migration_guide: Option<String>,
    #[serde(default)]
    pub testing_notes: String,
}

impl PrDescription {
    pub fn has_breaking_changes(&self) -> bool {
        !self.breaking_changes.is_empty()
    }

    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# {}", self.title);
        let _ = writeln!(out, "\n## Summary\n{}", self.summary);
        let _ = writeln!(out, "\n## Changes");
        for (path, description) in &self.changes_by_file {
            let _ = writeln!(out, "- **{path}**: {description}");
        }
        if !self.breaking_changes.is_empty() {
            let _ = writeln!(out, "\n## Breaking Changes");
            for change in &self.breaking_changes {
                let _ = writeln!(out, "- {change}");
            }
        }
        if let Some(guide) = &self.migration_guide {
            let _ = writeln!(out, "\n## Migration Guide\n{guide}");
        }
        let _ = writeln!(out, "\n## Testing\n{}", self.testing_notes);
        out
    }
}
