use std::collections::BTreeMap;

use anyhow::Result;
use refactory_provider::{CallOpts, ModelRole, ModelRouter};
use tracing::info;

use super::prompts::{NARRATOR_INSTRUCTIONS, NARRATOR_SYSTEM_PROMPT};
use super::AgentRun;
use crate::javasrc::extract_method_signatures;
use crate::model::{ChangeType, CodeChange, CodeChanges, PrDescription, ValidationResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileCategory {
    Feature,
    Refactoring,
    Tests,
    Configuration,
    Documentation,
}

impl std::fmt::Display for FileCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FileCategory::Feature => write!(f, "feature"),
            FileCategory::Refactoring => write!(f, "refactoring"),
            FileCategory::Tests => write!(f, "tests"),
            FileCategory::Configuration => write!(f, "configuration"),
            FileCategory::Documentation => write!(f, "documentation"),
        }
    }
}

/// Bucket a change by its path and kind.
pub fn categorize_change(change: &CodeChange) -> FileCategory {
    let path = change.file_path.to_lowercase();
    if path.contains("/test/") || path.ends_with("test.java") || path.ends_with("tests.java") {
        FileCategory::Tests
    } else if path.ends_with(".md") || path.contains("/docs/") {
        FileCategory::Documentation
    } else if path.ends_with(".xml")
        || path.ends_with(".gradle")
        || path.ends_with(".kts")
        || path.ends_with(".yml")
        || path.ends_with(".yaml")
        || path.ends_with(".properties")
    {
        FileCategory::Configuration
    } else if change.change_type == ChangeType::Created {
        FileCategory::Feature
    } else {
        FileCategory::Refactoring
    }
}

/// One-line mechanical summary of a change from its counters and semantic
/// lists; the model refines these into prose.
pub fn summarize_change(change: &CodeChange) -> String {
    let mut parts = vec![format!(
        "{} (+{}/-{})",
        change.change_type, change.lines_added, change.lines_removed
    )];
    if !change.methods_added.is_empty() {
        parts.push(format!("methods: {}", change.methods_added.join(", ")));
    }
    if !change.annotations_added.is_empty() {
        parts.push(format!("annotations: {}", change.annotations_added.join(", ")));
    }
    if !change.imports_added.is_empty() {
        parts.push(format!("{} new imports", change.imports_added.len()));
    }
    parts.join("; ")
}

/// Public signatures present before the change but gone after it.
pub fn extract_breaking_changes(changes: &CodeChanges) -> Vec<String> {
    let mut breaking = Vec::new();
    for change in &changes.changes {
        match change.change_type {
            ChangeType::Deleted => {
                breaking.push(format!("Removed file {}", change.file_path));
            }
            ChangeType::Modified => {
                let Some(original) = &change.original_content else {
                    continue;
                };
                let before = extract_method_signatures(original);
                let after = extract_method_signatures(&change.modified_content);
                for signature in before {
                    if signature.starts_with("public") && !after.contains(&signature) {
                        breaking.push(format!(
                            "{}: removed or changed public signature `{}`",
                            change.file_path, signature
                        ));
                    }
                }
            }
            ChangeType::Created => {}
        }
    }
    breaking
}

/// Factual testing summary from the validation result.
pub fn summarize_testing(validation: &ValidationResult) -> String {
    let mut out = format!(
        "Validation {}; compilation {}.",
        if validation.passed { "passed" } else { "failed" },
        if validation.compilation_passed {
            "succeeded"
        } else {
            "failed"
        },
    );
    if let Some(junit) = &validation.junit_test_results {
        out.push_str(&format!(
            " Tests: {} run, {} passed, {} failed, {} skipped.",
            junit.tests_run, junit.tests_passed, junit.tests_failed, junit.tests_skipped
        ));
    }
    if validation.test_coverage > 0.0 {
        out.push_str(&format!(
            " Estimated coverage {:.0}%.",
            validation.test_coverage * 100.0
        ));
    }
    out
}

/// Compose the pull-request description for a validated change set.
pub async fn run_narrator(
    router: &ModelRouter,
    code_changes: &CodeChanges,
    validation: &ValidationResult,
) -> Result<(PrDescription, AgentRun)> {
    let mut run = AgentRun::start("narrator");

    let mut file_lines = String::new();
    for change in &code_changes.changes {
        file_lines.push_str(&format!(
            "- {} [{}]: {}\n",
            change.file_path,
            categorize_change(change),
            summarize_change(change)
        ));
    }
    let breaking = extract_breaking_changes(code_changes);
    let testing = summarize_testing(validation);
    run.note(format!("{} breaking change candidates", breaking.len()));

    let prompt = format!(
        "**Plan ID:** {}\n\n**Files changed ({}):**\n{file_lines}\n\
         **Detected breaking changes:**\n{}\n\n**Testing summary:**\n{testing}\n\n\
         {NARRATOR_INSTRUCTIONS}",
        code_changes.plan_id,
        code_changes.total_changes(),
        if breaking.is_empty() {
            "(none)".to_string()
        } else {
            breaking.join("\n")
        },
    );

    let mut description: PrDescription = router
        .complete_json(
            ModelRole::PrNarrator,
            Some(NARRATOR_SYSTEM_PROMPT),
            &prompt,
            CallOpts::default(),
        )
        .await?;

    description.plan_id = code_changes.plan_id.clone();
    if description.changes_by_file.is_empty() {
        let mut by_file = BTreeMap::new();
        for change in &code_changes.changes {
            by_file.insert(change.file_path.clone(), summarize_change(change));
        }
        description.changes_by_file = by_file;
    }
    if description.breaking_changes.is_empty() && !breaking.is_empty() {
        description.breaking_changes = breaking;
    }
    if description.testing_notes.is_empty() {
        description.testing_notes = testing;
    }

    info!(title = %description.title, files = description.changes_by_file.len(), "Narration complete");
    let model_id = router.model_id(ModelRole::PrNarrator);
    Ok((description, run.finish(model_id)))
}
