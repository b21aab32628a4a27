use anyhow::Result;
use refactory_provider::{CallOpts, ModelRole, ModelRouter};
use tracing::info;

use super::prompts::{INTAKE_INSTRUCTIONS, INTAKE_SYSTEM_PROMPT};
use super::AgentRun;
use crate::model::{generate_job_id, JobSpec};

/// Validate a Java package name: lowercase dot-separated segments, each
/// starting with a letter, letters/digits/underscores only.
pub fn validate_java_package(package_name: &str) -> Result<(), String> {
    if package_name.is_empty() {
        return Err("Package name cannot be empty".into());
    }
    for segment in package_name.split('.') {
        if segment.is_empty() {
            return Err("Package segments cannot be empty".into());
        }
        let mut chars = segment.chars();
        let first = chars.next().unwrap_or(' ');
        if !first.is_ascii_alphabetic() {
            return Err(format!("Segment '{segment}' must start with a letter"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(format!("Segment '{segment}' contains invalid characters"));
        }
        if segment.chars().any(|c| c.is_ascii_uppercase()) {
            return Err("Package names must be all lowercase".into());
        }
    }
    Ok(())
}

const PATTERN_MAP: &[(&str, &[&str])] = &[
    ("auth", &["src/main/java/**/auth/**/*.java", "src/main/java/**/security/**/*.java"]),
    ("jwt", &["src/main/java/**/auth/**/*.java", "src/main/java/**/security/**/*.java"]),
    ("oauth", &["src/main/java/**/auth/**/*.java", "src/main/java/**/oauth/**/*.java"]),
    ("database", &["src/main/java/**/repository/**/*.java", "src/main/java/**/entity/**/*.java"]),
    ("jpa", &["src/main/java/**/repository/**/*.java", "src/main/java/**/entity/**/*.java"]),
    ("rest", &["src/main/java/**/controller/**/*.java", "src/main/java/**/api/**/*.java"]),
    ("service", &["src/main/java/**/service/**/*.java"]),
    ("controller", &["src/main/java/**/controller/**/*.java"]),
    ("entity", &["src/main/java/**/entity/**/*.java", "src/main/java/**/model/**/*.java"]),
    ("config", &["src/main/java/**/config/**/*.java"]),
    ("cache", &["src/main/java/**/service/**/*.java", "src/main/java/**/config/**/*.java"]),
];

/// Suggest target globs from intent keywords. Falls back to all main
/// sources when nothing matches.
pub fn suggest_file_patterns(intent: &str) -> Vec<String> {
    let intent_lower = intent.to_lowercase();
    let mut suggested: Vec<String> = Vec::new();
    for (keyword, patterns) in PATTERN_MAP {
        if intent_lower.contains(keyword) {
            for pattern in *patterns {
                if !suggested.iter().any(|s| s == pattern) {
                    suggested.push(pattern.to_string());
                }
            }
        }
    }
    if suggested.is_empty() {
        suggested.push("src/main/java/**/*.java".to_string());
    }
    suggested
}

/// Exclusion patterns appropriate for Java build trees.
pub fn suggest_exclusions() -> Vec<String> {
    [
        "**/target/**",
        "**/build/**",
        "**/out/**",
        "**/generated/**",
        "**/generated-sources/**",
        "**/.idea/**",
        "**/.gradle/**",
        "**/node_modules/**",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Parse the raw user prompt into a structured job specification.
pub async fn run_intake(
    router: &ModelRouter,
    user_prompt: &str,
    code_context: Option<&str>,
) -> Result<(JobSpec, AgentRun)> {
    let mut run = AgentRun::start("intake");
    let job_id = generate_job_id();
    run.note(format!("assigned job id {job_id}"));

    let patterns = suggest_file_patterns(user_prompt);
    let exclusions = suggest_exclusions();
    run.note(format!("suggested {} file patterns", patterns.len()));

    let mut prompt = format!(
        "**User request:**\n{user_prompt}\n\n**Job id:** {job_id}\n\n\
         **Suggested file patterns:**\n{}\n\n**Suggested exclusions:**\n{}\n",
        patterns.join("\n"),
        exclusions.join("\n"),
    );
    if let Some(context) = code_context {
        prompt.push_str(&format!("\n**Repository context:**\n{context}\n"));
    }
    prompt.push_str(&format!("\n{INTAKE_INSTRUCTIONS}"));

    let mut spec: JobSpec = router
        .complete_json(
            ModelRole::Intake,
            Some(INTAKE_SYSTEM_PROMPT),
            &prompt,
            CallOpts::default(),
        )
        .await?;

    // The runner's id is authoritative, whatever the model echoed back.
    spec.job_id = job_id;
    for package in &spec.scope.target_packages {
        if let Err(reason) = validate_java_package(package) {
            run.note(format!("dropping invalid package '{package}': {reason}"));
        }
    }
    spec.scope
        .target_packages
        .retain(|p| validate_java_package(p).is_ok());
    if spec.scope.exclude_patterns.is_empty() {
        spec.scope.exclude_patterns = exclusions;
    }

    info!(
        job_id = %spec.job_id,
        intent = %spec.intent,
        requirements = spec.requirements.len(),
        "Intake complete"
    );

    let model_id = router.model_id(ModelRole::Intake);
    Ok((spec, run.finish(model_id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_validation_rules() {
        assert!(validate_java_package("com.example.auth").is_ok());
        assert!(validate_java_package("com.example.my_pkg2").is_ok());
        assert!(validate_java_package("").is_err());
        assert!(validate_java_package("com..auth").is_err());
        assert!(validate_java_package("com.1bad").is_err());
        assert!(validate_java_package("com.Example").is_err());
        assert!(validate_java_package("com.ex-ample").is_err());
    }

    #[test]
    fn patterns_match_intent_keywords() {
        let patterns = suggest_file_patterns("add JWT authentication");
        assert!(patterns.iter().any(|p| p.contains("auth")));
        assert!(patterns.iter().any(|p| p.contains("security")));

        let fallback = suggest_file_patterns("something unusual");
        assert_eq!(fallback, vec!["src/main/java/**/*.java"]);
    }

    #[test]
    fn patterns_are_deduplicated() {
        // "auth" and "jwt" map to the same globs.
        let patterns = suggest_file_patterns("jwt auth");
        let unique: std::collections::HashSet<_> = patterns.iter().collect();
        assert_eq!(unique.len(), patterns.len());
    }
}
