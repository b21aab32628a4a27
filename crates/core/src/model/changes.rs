use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Created => write!(f, "created"),
            ChangeType::Modified => write!(f, "modified"),
            ChangeType::Deleted => write!(f, "deleted"),
        }
    }
}

/// A single file-level change produced by the transformer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChange {
    /// Repository-relative path. Never absolute, never contains `..`.
    pub file_path: String,
    pub change_type: ChangeType,
    #[serde(default)]
    pub original_content: Option<String>,
    #[serde(default)]
    pub modified_content: String,
    #[serde(default)]
    pub diff: String,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub package_name: Option<String>,
    #[serde(default)]
    pub imports_added: Vec<String>,
    #[serde(default)]
    pub methods_added: Vec<String>,
    #[serde(default)]
    pub annotations_added: Vec<String>,
}

/// Ordered aggregate of transformer output. The counters are derived; call
/// `recount` after mutating `changes` so they stay equal to the reduction
/// of the list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodeChanges {
    pub plan_id: String,
    #[serde(default)]
    pub changes: Vec<CodeChange>,
    #[serde(default)]
    pub files_created: u32,
    #[serde(default)]
    pub files_modified: u32,
    #[serde(default)]
    pub files_deleted: u32,
    #[serde(default)]
    pub lines_added: u32,
    #[serde(default)]
    pub lines_removed: u32,
}

impl CodeChanges {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            changes: Vec::new(),
            files_created: 0,
            files_modified: 0,
            files_deleted: 0,
            lines_added: 0,
            lines_removed: 0,
        }
    }

    pub fn total_changes(&self) -> usize {
        self.changes.len()
    }

    pub fn push(&mut self, change: CodeChange) {
        self.changes.push(change);
        self.recount();
    }

    pub fn recount(&mut self) {
        self.files_created = 0;
        self.files_modified = 0;
        self.files_deleted = 0;
        self.lines_added = 0;
        self.lines_removed = 0;
        for change in &self.changes {
            match change.change_type {
                ChangeType::Created => self.files_created += 1,
                ChangeType::Modified => self.files_modified += 1,
                ChangeType::Deleted => self.files_deleted += 1,
            }
            self.lines_added += change.lines_added;
            self.lines_removed += change.lines_removed;
        }
    }
}
