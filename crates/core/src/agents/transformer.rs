use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use refactory_provider::{CallOpts, ModelRole, ModelRouter};
use tracing::{debug, info};

use super::prompts::{
    TARGETED_FIX_INSTRUCTIONS, TRANSFORMER_STEP_INSTRUCTIONS, TRANSFORMER_SYSTEM_PROMPT,
};
use super::AgentRun;
use crate::diff::{count_diff_lines, non_blank_lines, unified_diff};
use crate::javasrc::{extract_relevant_context, LARGE_FILE_LINES};
use crate::model::{ChangeType, CodeChange, RefactorPlan, RefactorStep};

/// Wire shape of a transformer response: an ordered list of file changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    #[serde(default)]
    pub changes: Vec<CodeChange>,
}

/// Java type skeleton for the given kind.
pub fn class_template(package: &str, name: &str, kind: &str) -> String {
    match kind {
        "interface" => format!("package {package};\n\npublic interface {name} {{\n\n}}\n"),
        "enum" => format!("package {package};\n\npublic enum {name} {{\n\n}}\n"),
        "annotation" => format!(
            "package {package};\n\nimport java.lang.annotation.ElementType;\nimport java.lang.annotation.Retention;\nimport java.lang.annotation.RetentionPolicy;\nimport java.lang.annotation.Target;\n\n@Retention(RetentionPolicy.RUNTIME)\n@Target(ElementType.TYPE)\npublic @interface {name} {{\n\n}}\n"
        ),
        _ => format!("package {package};\n\npublic class {name} {{\n\n}}\n"),
    }
}

/// Context for one file to embed in a generation prompt. Large files are
/// reduced to the parts overlapping the intent; missing files are flagged
/// as new.
pub fn file_context(root: &Path, file_path: &str, intent: &str) -> String {
    let full = root.join(file_path);
    match std::fs::read_to_string(&full) {
        Ok(code) => {
            if code.lines().count() > LARGE_FILE_LINES {
                debug!(file = file_path, "Large file; extracting targeted context");
                extract_relevant_context(&code, intent)
            } else {
                code
            }
        }
        Err(_) => format!("// File: {file_path}\n// (new file - no existing content)"),
    }
}

/// Find test files for a main class by naming convention.
pub fn find_test_files(root: &Path, class_file_path: &str) -> Vec<String> {
    let class_name = Path::new(class_file_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("");
    if class_name.is_empty() {
        return Vec::new();
    }

    let candidates = [
        format!("{class_name}Test.java"),
        format!("{class_name}Tests.java"),
        format!("Test{class_name}.java"),
        format!("{class_name}TestCase.java"),
    ];

    let mut found = Vec::new();
    for test_dir in ["src/test/java", "src/test", "test", "tests"] {
        let dir = root.join(test_dir);
        if !dir.exists() {
            continue;
        }
        let mut stack = vec![dir];
        while let Some(current) = stack.pop() {
            let Ok(entries) = std::fs::read_dir(&current) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    if candidates.iter().any(|c| c == name) {
                        let relative = path
                            .strip_prefix(root)
                            .unwrap_or(&path)
                            .to_string_lossy()
                            .replace('\\', "/");
                        found.push(relative);
                    }
                }
            }
        }
    }
    found.sort();
    found.dedup();
    found
}

/// Prompt for one plan step: the step itself, the current content of its
/// target files, the test files that shadow them, and the output contract.
pub fn build_step_prompt(step: &RefactorStep, plan: &RefactorPlan, root: Option<&Path>) -> String {
    let mut prompt = format!(
        "**Step {} of {} (action: {})**\n{}\n",
        step.step_number,
        plan.total_steps(),
        step.action,
        step.description,
    );
    if !step.target_classes.is_empty() {
        prompt.push_str(&format!("Target classes: {}\n", step.target_classes.join(", ")));
    }

    if let Some(root) = root {
        for file in &step.target_files {
            prompt.push_str(&format!(
                "\n**Current content of {file}:**\n```java\n{}\n```\n",
                file_context(root, file, &step.description)
            ));
            for test_file in find_test_files(root, file) {
                prompt.push_str(&format!(
                    "\n**Associated test {test_file}:**\n```java\n{}\n```\n",
                    file_context(root, &test_file, &step.description)
                ));
            }
        }
    } else if !step.target_files.is_empty() {
        prompt.push_str(&format!("Target files: {}\n", step.target_files.join(", ")));
    }

    prompt.push_str(&format!("\n{TRANSFORMER_STEP_INSTRUCTIONS}"));
    prompt
}

/// Fill in derivable fields the model left blank: the unified diff, and
/// the line counters (diff-derived, else counted from non-blank content).
pub fn normalize_change(change: &mut CodeChange) {
    if change.diff.is_empty() && change.change_type != ChangeType::Deleted {
        let original = change.original_content.as_deref().unwrap_or("");
        change.diff = unified_diff(&change.file_path, original, &change.modified_content);
    }

    if change.lines_added == 0 && change.lines_removed == 0 {
        let (added, removed) = count_diff_lines(&change.diff);
        change.lines_added = added;
        change.lines_removed = removed;
    }
    if change.lines_added == 0 && change.lines_removed == 0 {
        match (&change.original_content, change.change_type) {
            (Some(original), ChangeType::Modified) => {
                change.lines_added = non_blank_lines(&change.modified_content);
                change.lines_removed = non_blank_lines(original);
            }
            (_, ChangeType::Created) => {
                change.lines_added = non_blank_lines(&change.modified_content);
                change.lines_removed = 0;
            }
            (Some(original), ChangeType::Deleted) => {
                change.lines_removed = non_blank_lines(original);
            }
            _ => {}
        }
    }
}

fn missing_symbol_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"cannot find symbol[:\s]*(?:class|variable|method)?\s*(\w+)").unwrap())
}

fn missing_method_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"method\s+(\w+)\(.*?\)\s+(?:is undefined|cannot be resolved)").unwrap())
}

/// Symbols named in "cannot find symbol" diagnostics.
pub fn extract_missing_symbols(error_summary: &str) -> Vec<String> {
    let mut symbols: Vec<String> = missing_symbol_re()
        .captures_iter(error_summary)
        .map(|caps| caps[1].to_string())
        .collect();
    symbols.sort();
    symbols.dedup();
    symbols
}

/// Method names from unresolved-method diagnostics.
pub fn extract_missing_methods(error_summary: &str) -> Vec<String> {
    let mut methods: Vec<String> = missing_method_re()
        .captures_iter(error_summary)
        .map(|caps| caps[1].to_string())
        .collect();
    methods.sort();
    methods.dedup();
    methods
}

/// A focused transformer call scoped to the files implicated by the last
/// validation failure, rather than the whole plan.
pub async fn generate_targeted_fixes(
    router: &ModelRouter,
    plan: &RefactorPlan,
    error_digest: &str,
    fix_instructions: &str,
    root: Option<&Path>,
) -> Result<(Vec<CodeChange>, AgentRun)> {
    let mut run = AgentRun::start("transformer.fix");

    let symbols = extract_missing_symbols(error_digest);
    let methods = extract_missing_methods(error_digest);
    if !symbols.is_empty() {
        run.note(format!("missing symbols: {}", symbols.join(", ")));
    }
    if !methods.is_empty() {
        run.note(format!("missing methods: {}", methods.join(", ")));
    }

    let mut prompt = format!(
        "**Validation errors:**\n{error_digest}\n\n**Fix instructions:**\n{fix_instructions}\n",
    );
    if !symbols.is_empty() {
        prompt.push_str(&format!("\nMissing symbols: {}\n", symbols.join(", ")));
    }
    if !methods.is_empty() {
        prompt.push_str(&format!("Missing methods: {}\n", methods.join(", ")));
    }

    // Embed current content of the files the plan touches so the model
    // patches reality, not its memory of it.
    if let Some(root) = root {
        let mut seen = std::collections::HashSet::new();
        for step in &plan.steps {
            for file in &step.target_files {
                if seen.insert(file.clone()) {
                    prompt.push_str(&format!(
                        "\n**Current content of {file}:**\n```java\n{}\n```\n",
                        file_context(root, file, error_digest)
                    ));
                    for test_file in find_test_files(root, file) {
                        if seen.insert(test_file.clone()) {
                            prompt.push_str(&format!(
                                "\n**Associated test {test_file}:**\n```java\n{}\n```\n",
                                file_context(root, &test_file, error_digest)
                            ));
                        }
                    }
                }
            }
        }
    }

    prompt.push_str(&format!("\n{TARGETED_FIX_INSTRUCTIONS}"));

    let mut change_set: ChangeSet = router
        .complete_json(
            ModelRole::Coder,
            Some(TRANSFORMER_SYSTEM_PROMPT),
            &prompt,
            CallOpts {
                max_tokens: Some(8192),
                ..CallOpts::default()
            },
        )
        .await?;

    for change in change_set.changes.iter_mut() {
        normalize_change(change);
    }

    info!(fixes = change_set.changes.len(), "Targeted fix generation complete");
    let model_id = router.model_id(ModelRole::Coder);
    Ok((change_set.changes, run.finish(model_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templates_cover_all_kinds() {
        assert!(class_template("com.x", "Foo", "class").contains("public class Foo"));
        assert!(class_template("com.x", "Foo", "interface").contains("public interface Foo"));
        assert!(class_template("com.x", "Foo", "enum").contains("public enum Foo"));
        assert!(class_template("com.x", "Foo", "annotation").contains("public @interface Foo"));
        assert!(class_template("com.x", "Foo", "whatever").contains("public class Foo"));
    }

    #[test]
    fn test_discovery_matches_naming_conventions() {
        let dir = tempfile::tempdir().unwrap();
        let tests = dir.path().join("src/test/java/com/example");
        std::fs::create_dir_all(&tests).unwrap();
        std::fs::write(tests.join("UserServiceTest.java"), "").unwrap();
        std::fs::write(tests.join("OtherTest.java"), "").unwrap();

        let found = find_test_files(
            dir.path(),
            "src/main/java/com/example/UserService.java",
        );
        assert_eq!(found, vec!["src/test/java/com/example/UserServiceTest.java"]);
    }

    #[test]
    fn normalize_fills_diff_and_counts() {
        let mut change = CodeChange {
            file_path: "A.java".into(),
            change_type: ChangeType::Modified,
            original_content: Some("a\nb\n".into()),
            modified_content: "a\nc\n".into(),
            diff: String::new(),
            lines_added: 0,
            lines_removed: 0,
            class_name: None,
            package_name: None,
            imports_added: vec![],
            methods_added: vec![],
            annotations_added: vec![],
        };
        normalize_change(&mut change);
        assert!(change.diff.contains("+c"));
        assert_eq!(change.lines_added, 1);
        assert_eq!(change.lines_removed, 1);
    }

    #[test]
    fn normalize_falls_back_to_content_counting() {
        // Identical content yields an empty diff, so counting falls back
        // to non-blank lines.
        let mut change = CodeChange {
            file_path: "B.java".into(),
            change_type: ChangeType::Created,
            original_content: None,
            modified_content: "x\n\ny\n".into(),
            diff: String::new(),
            lines_added: 0,
            lines_removed: 0,
            class_name: None,
            package_name: None,
            imports_added: vec![],
            methods_added: vec![],
            annotations_added: vec![],
        };
        change.diff = " context only\n".into();
        normalize_change(&mut change);
        assert_eq!(change.lines_added, 2);
        assert_eq!(change.lines_removed, 0);
    }

    #[test]
    fn missing_symbols_and_methods_extract() {
        let digest = "\
[ERROR] UserService.java:[4,2] cannot find symbol: class Service\n\
[ERROR] UserServiceTest.java:[9,5] cannot find symbol: class UserRepository\n\
error: method registerUser(String) is undefined";
        assert_eq!(extract_missing_symbols(digest), vec!["Service", "UserRepository"]);
        assert_eq!(extract_missing_methods(digest), vec!["registerUser"]);
    }
}
