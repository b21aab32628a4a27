use std::path::Path;

use anyhow::Result;
use refactory_provider::{CallOpts, ModelRole, ModelRouter};
use tracing::{debug, info, warn};

use super::prompts::{PLANNER_INSTRUCTIONS, PLANNER_SYSTEM_PROMPT};
use super::AgentRun;
use crate::javasrc::{parse_java_source, JavaTypeInfo};
use crate::model::{generate_plan_id, JobSpec, RefactorPlan, RefactorStep};

/// How many analyzed classes are embedded into the planning prompt.
const MAX_CLASSES_IN_PROMPT: usize = 30;

/// Base minutes per action verb.
pub fn estimate_step_duration(action: &str) -> u32 {
    match action {
        "create_class" => 15,
        "create_interface" => 10,
        "create_enum" => 8,
        "add_method" => 10,
        "extract_method" => 12,
        "add_annotation" => 5,
        "implement_interface" => 20,
        "add_dependency" => 5,
        "refactor_package_structure" => 30,
        "add_spring_configuration" => 20,
        "add_rest_controller" => 25,
        "modify_existing_class" => 15,
        "add_test_class" => 20,
        _ => 15,
    }
}

/// Risk on a 0-10 scale from the action plus aggravating factors.
pub fn calculate_risk_level(
    action: &str,
    affects_core_logic: bool,
    modifies_interfaces: bool,
    changes_dependencies: bool,
) -> u8 {
    let base: u8 = match action {
        "create_class" => 2,
        "create_interface" => 3,
        "create_enum" => 1,
        "add_method" => 3,
        "extract_method" => 4,
        "modify_existing_class" => 5,
        "refactor_package_structure" => 7,
        "add_dependency" => 4,
        "implement_interface" => 5,
        "add_spring_configuration" => 4,
        _ => 5,
    };
    let mut risk = base;
    if affects_core_logic {
        risk += 2;
    }
    if modifies_interfaces {
        risk += 2;
    }
    if changes_dependencies {
        risk += 1;
    }
    risk.min(10)
}

/// Infer missing step dependencies from action semantics: implementations
/// follow interface creation, method work follows class creation, spring
/// configuration follows type creation.
pub fn suggest_step_dependencies(steps: &[RefactorStep]) -> Vec<(u32, Vec<u32>)> {
    let mut suggestions = Vec::new();
    for step in steps {
        let mut depends_on: Vec<u32> = Vec::new();
        match step.action.as_str() {
            "implement_interface" => {
                for prev in steps.iter().filter(|p| p.step_number < step.step_number) {
                    if prev.action == "create_interface" {
                        depends_on.push(prev.step_number);
                    }
                }
            }
            "add_method" | "modify_existing_class" => {
                for prev in steps.iter().filter(|p| p.step_number < step.step_number) {
                    if prev.action == "create_class"
                        && prev
                            .target_classes
                            .iter()
                            .any(|c| step.target_classes.contains(c))
                    {
                        depends_on.push(prev.step_number);
                    }
                }
            }
            "add_spring_configuration" => {
                for prev in steps.iter().filter(|p| p.step_number < step.step_number) {
                    if matches!(prev.action.as_str(), "create_class" | "create_interface") {
                        depends_on.push(prev.step_number);
                    }
                }
            }
            _ => {}
        }
        if !depends_on.is_empty() {
            suggestions.push((step.step_number, depends_on));
        }
    }
    suggestions
}

/// Mitigations keyed to the aggregate risk flags.
pub fn suggest_mitigation_strategies(
    overall_risk: u8,
    breaking_changes: bool,
    compilation_risk: bool,
) -> Vec<String> {
    let mut strategies: Vec<String> = Vec::new();
    if overall_risk >= 7 {
        strategies.push("Gate the change behind a feature flag for gradual rollout".into());
        strategies.push("Prepare a rollback plan before merging".into());
    }
    if breaking_changes {
        strategies.push("Deprecate old signatures instead of removing them immediately".into());
        strategies.push("Provide a migration guide for API consumers".into());
    }
    if compilation_risk {
        strategies.push("Run a full build after each major step".into());
    }
    strategies.push("Cover every new method with unit tests".into());
    strategies
}

/// Enumerate and structurally analyze the repository's Java sources,
/// honoring the job's exclude patterns.
pub fn list_java_classes(root: &Path, exclude_patterns: &[String]) -> Vec<(String, JavaTypeInfo)> {
    let pattern = format!("{}/**/*.java", root.display());
    let exclude: Vec<glob::Pattern> = exclude_patterns
        .iter()
        .filter_map(|p| glob::Pattern::new(p).ok())
        .collect();

    let mut classes = Vec::new();
    let Ok(paths) = glob::glob(&pattern) else {
        return classes;
    };
    for path in paths.flatten() {
        let relative = path
            .strip_prefix(root)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        if exclude.iter().any(|p| p.matches(&relative)) {
            continue;
        }
        let Ok(code) = std::fs::read_to_string(&path) else {
            continue;
        };
        if let Some(info) = parse_java_source(&code) {
            classes.push((relative, info));
        }
    }
    classes.sort_by(|a, b| a.0.cmp(&b.0));
    classes
}

fn class_digest(classes: &[(String, JavaTypeInfo)]) -> String {
    let mut digest = String::new();
    for (path, info) in classes.iter().take(MAX_CLASSES_IN_PROMPT) {
        let kind = if info.is_interface { "interface" } else { "class" };
        let methods: Vec<String> = info.methods.iter().map(|m| m.signature()).collect();
        digest.push_str(&format!(
            "- {path}: {kind} {} | methods: [{}] | implements: [{}]\n",
            info.name,
            methods.join(", "),
            info.implements.join(", "),
        ));
    }
    if classes.len() > MAX_CLASSES_IN_PROMPT {
        digest.push_str(&format!(
            "... and {} more files\n",
            classes.len() - MAX_CLASSES_IN_PROMPT
        ));
    }
    digest
}

/// Produce an ordered refactor plan for the job.
pub async fn run_planner(
    router: &ModelRouter,
    job_spec: &JobSpec,
    repo_root: Option<&Path>,
) -> Result<(RefactorPlan, AgentRun)> {
    let mut run = AgentRun::start("planner");
    let plan_id = generate_plan_id();

    let classes = repo_root
        .map(|root| list_java_classes(root, &job_spec.scope.exclude_patterns))
        .unwrap_or_default();
    run.note(format!("analyzed {} repository classes", classes.len()));

    let prompt = format!(
        "**Job specification:**\n{}\n\n**Plan id:** {plan_id}\n\n\
         **Repository classes:**\n{}\n\n{PLANNER_INSTRUCTIONS}",
        serde_json::to_string_pretty(job_spec)?,
        class_digest(&classes),
    );

    let mut plan: RefactorPlan = router
        .complete_json(
            ModelRole::Planner,
            Some(PLANNER_SYSTEM_PROMPT),
            &prompt,
            CallOpts::default(),
        )
        .await?;

    plan.plan_id = plan_id;
    plan.job_id = job_spec.job_id.clone();
    normalize_plan(&mut plan, &mut run);
    plan.validate().map_err(|e| anyhow::anyhow!("model produced an invalid plan: {e}"))?;

    info!(
        plan_id = %plan.plan_id,
        steps = plan.total_steps(),
        risk = plan.risk_assessment.overall_risk_level,
        "Planning complete"
    );

    let model_id = router.model_id(ModelRole::Planner);
    Ok((plan, run.finish(model_id)))
}

/// Fill gaps the model left: renumber loosely-numbered steps, drop invalid
/// dependency references, estimate durations and risks that were omitted,
/// infer dependencies and mitigations when absent.
fn normalize_plan(plan: &mut RefactorPlan, run: &mut super::AgentRunTimer) {
    // Dense renumbering keeps the invariant even for sloppy model output;
    // dependency references are remapped alongside.
    let mut renumber: Vec<(u32, u32)> = Vec::new();
    for (index, step) in plan.steps.iter_mut().enumerate() {
        let expected = (index + 1) as u32;
        if step.step_number != expected {
            renumber.push((step.step_number, expected));
            step.step_number = expected;
        }
    }
    if !renumber.is_empty() {
        warn!(?renumber, "Renumbered plan steps");
        run.note(format!("renumbered {} steps", renumber.len()));
        for step in plan.steps.iter_mut() {
            for dep in step.dependencies.iter_mut() {
                if let Some((_, new)) = renumber.iter().find(|(old, _)| old == dep) {
                    *dep = *new;
                }
            }
        }
    }
    for step in plan.steps.iter_mut() {
        let own = step.step_number;
        step.dependencies.retain(|d| *d > 0 && *d < own);
        step.dependencies.sort_unstable();
        step.dependencies.dedup();
        if step.estimated_minutes == 0 {
            step.estimated_minutes = estimate_step_duration(&step.action);
        }
        if step.risk_level == 0 {
            step.risk_level = calculate_risk_level(&step.action, false, false, false);
        }
    }

    let no_deps = plan.steps.iter().all(|s| s.dependencies.is_empty());
    if no_deps {
        let suggested = suggest_step_dependencies(&plan.steps);
        if !suggested.is_empty() {
            debug!(count = suggested.len(), "Applying inferred step dependencies");
            run.note("inferred step dependencies from action semantics");
            for (step_number, deps) in suggested {
                if let Some(step) = plan
                    .steps
                    .iter_mut()
                    .find(|s| s.step_number == step_number)
                {
                    step.dependencies = deps;
                }
            }
        }
    }

    if plan.risk_assessment.overall_risk_level == 0 {
        plan.risk_assessment.overall_risk_level = plan
            .steps
            .iter()
            .map(|s| s.risk_level)
            .max()
            .unwrap_or(0);
    }
    if plan.risk_assessment.mitigation_strategies.is_empty() {
        plan.risk_assessment.mitigation_strategies = suggest_mitigation_strategies(
            plan.risk_assessment.overall_risk_level,
            plan.risk_assessment.breaking_changes,
            plan.risk_assessment.compilation_risk,
        );
    }
    if plan.estimated_duration.is_empty() {
        let minutes: u32 = plan.steps.iter().map(|s| s.estimated_minutes).sum();
        plan.estimated_duration = format!("{minutes} minutes");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(n: u32, action: &str, classes: &[&str]) -> RefactorStep {
        RefactorStep {
            step_number: n,
            action: action.into(),
            target_files: vec![],
            target_classes: classes.iter().map(|s| s.to_string()).collect(),
            description: format!("{action} step"),
            dependencies: vec![],
            risk_level: 0,
            estimated_minutes: 0,
        }
    }

    #[test]
    fn implement_interface_depends_on_creation() {
        let steps = vec![
            step(1, "create_interface", &["IAuth"]),
            step(2, "implement_interface", &["AuthImpl"]),
        ];
        let deps = suggest_step_dependencies(&steps);
        assert_eq!(deps, vec![(2, vec![1])]);
    }

    #[test]
    fn method_work_depends_on_matching_class_creation() {
        let steps = vec![
            step(1, "create_class", &["UserService"]),
            step(2, "create_class", &["Unrelated"]),
            step(3, "add_method", &["UserService"]),
        ];
        let deps = suggest_step_dependencies(&steps);
        assert_eq!(deps, vec![(3, vec![1])]);
    }

    #[test]
    fn risk_caps_at_ten() {
        assert_eq!(calculate_risk_level("refactor_package_structure", true, true, true), 10);
        assert_eq!(calculate_risk_level("create_enum", false, false, false), 1);
    }

    #[test]
    fn durations_have_a_default() {
        assert_eq!(estimate_step_duration("create_class"), 15);
        assert_eq!(estimate_step_duration("never_heard_of_it"), 15);
    }

    #[test]
    fn mitigation_strategies_track_flags() {
        let strategies = suggest_mitigation_strategies(8, true, false);
        assert!(strategies.iter().any(|s| s.contains("feature flag")));
        assert!(strategies.iter().any(|s| s.contains("Deprecate")));
        let minimal = suggest_mitigation_strategies(2, false, false);
        assert_eq!(minimal.len(), 1);
    }

    #[test]
    fn java_class_listing_respects_excludes() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src/main/java");
        let target = dir.path().join("target/classes");
        std::fs::create_dir_all(&src).unwrap();
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(src.join("A.java"), "public class A {}").unwrap();
        std::fs::write(target.join("B.java"), "public class B {}").unwrap();

        let classes = list_java_classes(dir.path(), &["**/target/**".to_string()]);
        assert_eq!(classes.len(), 1);
        assert_eq!(classes[0].1.name, "A");
    }
}
