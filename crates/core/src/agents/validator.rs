use std::path::Path;
use std::sync::OnceLock;

use anyhow::Result;
use regex::Regex;
use refactory_provider::{CallOpts, ModelRole, ModelRouter};
use tracing::{info, warn};

use super::prompts::{VALIDATOR_INSTRUCTIONS, VALIDATOR_SYSTEM_PROMPT};
use super::AgentRun;
use crate::build::{
    self, BuildToolInfo, CompileOptions, CompileSummary, OutputSink, TestOptions, TestSummary,
};
use crate::model::{
    CodeChanges, JUnitTestResults, ValidationCheck, ValidationResult,
};

/// What the validation stage is allowed to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    Full,
    CompileOnly,
    Skip,
}

impl ValidationMode {
    pub fn parse(text: &str) -> Self {
        match text.trim() {
            "skip" => ValidationMode::Skip,
            "compile_only" => ValidationMode::CompileOnly,
            _ => ValidationMode::Full,
        }
    }
}

impl std::fmt::Display for ValidationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationMode::Full => write!(f, "full"),
            ValidationMode::CompileOnly => write!(f, "compile_only"),
            ValidationMode::Skip => write!(f, "skip"),
        }
    }
}

/// Static quality scan: long methods, magic numbers, naming conventions.
/// Returns a 0-10 score plus the issues found.
pub fn check_code_quality(code: &str) -> (f64, Vec<String>) {
    let mut issues = Vec::new();
    let mut score: f64 = 10.0;

    let lines: Vec<&str> = code.lines().collect();

    let mut method_start = 0usize;
    let mut method_lines = 0usize;
    let mut in_method = false;
    for (i, line) in lines.iter().enumerate() {
        let is_method_open = (line.contains("public ")
            || line.contains("private ")
            || line.contains("protected "))
            && line.contains('(')
            && line.contains('{');
        if is_method_open {
            in_method = true;
            method_start = i + 1;
            method_lines = 0;
        }
        if in_method {
            method_lines += 1;
            if line.trim() == "}" {
                if method_lines > 50 {
                    issues.push(format!(
                        "Method starting at line {method_start} is too long ({method_lines} lines)"
                    ));
                    score -= 0.5;
                }
                in_method = false;
            }
        }
    }

    static NUMBER_RE: OnceLock<Regex> = OnceLock::new();
    let number_re = NUMBER_RE.get_or_init(|| Regex::new(r"\b(\d+)\b").unwrap());
    for (i, line) in lines.iter().enumerate() {
        if line.trim_start().starts_with("//") {
            continue;
        }
        for caps in number_re.captures_iter(line) {
            let number = &caps[1];
            if !matches!(number, "0" | "1" | "2" | "10" | "100" | "1000") {
                issues.push(format!(
                    "Line {}: magic number {number} should be a named constant",
                    i + 1
                ));
                score -= 0.2;
                break;
            }
        }
    }

    static CLASS_RE: OnceLock<Regex> = OnceLock::new();
    let class_re = CLASS_RE.get_or_init(|| Regex::new(r"class\s+([A-Za-z_]\w*)").unwrap());
    static METHOD_RE: OnceLock<Regex> = OnceLock::new();
    let method_re = METHOD_RE.get_or_init(|| {
        Regex::new(r"(public|private|protected)\s+\w[\w<>\[\]]*\s+([A-Za-z_]\w*)\s*\(").unwrap()
    });
    for (i, line) in lines.iter().enumerate() {
        if let Some(caps) = class_re.captures(line) {
            if caps[1].chars().next().is_some_and(|c| c.is_lowercase()) {
                issues.push(format!(
                    "Line {}: class name '{}' should be PascalCase",
                    i + 1,
                    &caps[1]
                ));
                score -= 0.5;
            }
        }
        if let Some(caps) = method_re.captures(line) {
            if caps[2].chars().next().is_some_and(|c| c.is_uppercase()) {
                issues.push(format!(
                    "Line {}: method name '{}' should be camelCase",
                    i + 1,
                    &caps[2]
                ));
                score -= 0.3;
            }
        }
    }

    (score.max(0.0), issues)
}

/// Spring convention checks: field injection, service interfaces, REST
/// mapping annotations, transaction placement.
pub fn check_spring_conventions(code: &str) -> Vec<String> {
    let mut violations = Vec::new();
    let lines: Vec<&str> = code.lines().collect();

    for (i, line) in lines.iter().enumerate() {
        if line.contains("@Autowired") {
            if let Some(next) = lines.get(i + 1) {
                if next.trim_start().starts_with("private ") && !next.contains('(') {
                    violations.push(format!(
                        "Line {}: prefer constructor injection over @Autowired fields",
                        i + 1
                    ));
                }
            }
        }
    }

    if code.contains("@RestController")
        && !code.contains("@RequestMapping")
        && !code.contains("@GetMapping")
        && !code.contains("@PostMapping")
    {
        violations.push("@RestController has no request mapping annotations".into());
    }
    if code.contains("@Transactional")
        && !code.contains("@Service")
        && !code.contains("@Repository")
    {
        violations
            .push("@Transactional belongs on service or repository classes".into());
    }

    violations
}

/// Security scan: SQL built by concatenation, hard-coded credentials, weak
/// hashes, unvalidated request parameters.
pub fn check_security_issues(code: &str) -> Vec<String> {
    let mut vulnerabilities = Vec::new();

    for (i, line) in code.lines().enumerate() {
        let n = i + 1;
        let trimmed = line.trim();

        if line.contains("Statement") && line.to_lowercase().contains("execute") && !line.contains('?') {
            vulnerabilities.push(format!(
                "Line {n}: possible SQL injection - use a PreparedStatement with parameters"
            ));
        }
        let lower = trimmed.to_lowercase();
        if ["password", "secret", "apikey", "token"]
            .iter()
            .any(|k| lower.contains(k))
            && trimmed.contains('=')
            && (trimmed.contains('"') || trimmed.contains('\''))
        {
            vulnerabilities.push(format!("Line {n}: possible hard-coded credential"));
        }
        if line.contains("MD5") || line.contains("SHA1") {
            vulnerabilities.push(format!("Line {n}: weak cryptographic algorithm (MD5/SHA1)"));
        }
        if (line.contains("@RequestParam") || line.contains("@PathVariable"))
            && !line.contains("@Valid")
            && !line.contains("@NotNull")
            && !line.contains("@Size")
        {
            vulnerabilities.push(format!("Line {n}: request parameter lacks validation"));
        }
    }

    vulnerabilities
}

/// Heuristic coverage estimate: `min(1, test methods / public methods)`.
pub fn estimate_test_coverage(production_code: &str, test_code: &str) -> f64 {
    let public_methods = production_code
        .lines()
        .filter(|l| l.contains("public ") && l.contains('(') && !l.contains("class "))
        .count();
    let test_methods = test_code
        .lines()
        .filter(|l| l.contains("@Test") || (l.to_lowercase().contains("test") && l.contains("void ")))
        .count();
    if public_methods == 0 {
        0.0
    } else {
        (test_methods as f64 / public_methods as f64).min(1.0)
    }
}

fn build_prompt(
    code_changes: &CodeChanges,
    compile: Option<&CompileSummary>,
    tests: Option<&TestSummary>,
) -> String {
    let mut prompt = format!(
        "Validate the following code changes.\n\nPlan ID: {}\nTotal changes: {}\n\
         Files created: {}\nFiles modified: {}\nLines: +{}/-{}\n\nChanges:\n",
        code_changes.plan_id,
        code_changes.total_changes(),
        code_changes.files_created,
        code_changes.files_modified,
        code_changes.lines_added,
        code_changes.lines_removed,
    );

    for change in code_changes.changes.iter().take(5) {
        prompt.push_str(&format!(
            "- {} ({}): +{}/-{}\n",
            change.file_path, change.change_type, change.lines_added, change.lines_removed
        ));
        let (score, issues) = check_code_quality(&change.modified_content);
        if !issues.is_empty() {
            prompt.push_str(&format!(
                "  quality {:.1}/10; issues: {}\n",
                score,
                issues.join("; ")
            ));
        }
        let spring = check_spring_conventions(&change.modified_content);
        if !spring.is_empty() {
            prompt.push_str(&format!("  spring: {}\n", spring.join("; ")));
        }
        let security = check_security_issues(&change.modified_content);
        if !security.is_empty() {
            prompt.push_str(&format!("  security: {}\n", security.join("; ")));
        }
    }

    if let Some(compile) = compile {
        let errors: Vec<String> = compile.errors.iter().map(|e| e.to_string()).collect();
        prompt.push_str(&format!(
            "\nCompilation summary (factual):\nSuccess: {}\nErrors ({}):\n{}\nOutput tail:\n{}\n",
            compile.success,
            compile.errors.len(),
            errors.join("\n"),
            compile.output.chars().rev().take(4000).collect::<String>()
                .chars().rev().collect::<String>(),
        ));
    }
    if let Some(tests) = tests {
        prompt.push_str(&format!(
            "\nTest summary (factual):\nSuccess: {}\nRun: {} Passed: {} Failed: {} Skipped: {}\n",
            tests.success,
            tests.tests_run,
            tests.tests_passed,
            tests.tests_failed,
            tests.tests_skipped,
        ));
        for failure in &tests.failures {
            prompt.push_str(&format!(
                "- {}.{}: {} ({})\n",
                failure.test_class, failure.test_method, failure.message, failure.error_type
            ));
        }
    }

    prompt.push_str(&format!("\n{VALIDATOR_INSTRUCTIONS}"));
    prompt
}

/// Overwrite the model's judgment with the factual build results so that
/// downstream consumers see deterministic facts.
pub fn annotate_with_build_results(
    result: &mut ValidationResult,
    compile: Option<&CompileSummary>,
    tests: Option<&TestSummary>,
) {
    if let Some(compile) = compile {
        result.compilation_passed = compile.success;
        let check = ValidationCheck {
            check_name: "maven_compile".into(),
            passed: compile.success,
            issues: compile.errors.iter().map(|e| e.to_string()).collect(),
            compilation_errors: compile.errors.iter().map(|e| e.to_string()).collect(),
            code_quality_score: None,
        };
        result.set_check(check);
    }
    if let Some(tests) = tests {
        result.junit_test_results = Some(JUnitTestResults {
            tests_run: tests.tests_run,
            tests_passed: tests.tests_passed,
            tests_failed: tests.tests_failed,
            tests_skipped: tests.tests_skipped,
        });
        let check = ValidationCheck {
            check_name: "junit_tests".into(),
            passed: tests.success,
            issues: tests
                .failures
                .iter()
                .map(|f| format!("{}.{}: {}", f.test_class, f.test_method, f.message))
                .collect(),
            compilation_errors: Vec::new(),
            code_quality_score: None,
        };
        result.set_check(check);
        if !tests.success {
            result.passed = false;
        }
    }
    result.enforce_compilation_invariant();
}

/// Outcome of the validation stage, bundling the model's judgment with the
/// factual build outputs it was annotated from.
pub struct ValidationOutcome {
    pub result: ValidationResult,
    pub compile: Option<CompileSummary>,
    pub tests: Option<TestSummary>,
}

/// Compile (and optionally test) the repository, then ask the validator
/// model for a judgment over the factual summaries, then force the factual
/// fields back onto the result.
pub async fn run_validator(
    router: &ModelRouter,
    code_changes: &CodeChanges,
    repo_root: Option<&Path>,
    mode: ValidationMode,
    sink: Option<OutputSink>,
) -> Result<(ValidationOutcome, AgentRun)> {
    let mut run = AgentRun::start("validator");

    let mut compile_summary: Option<CompileSummary> = None;
    let mut test_summary: Option<TestSummary> = None;

    if let Some(root) = repo_root {
        let info: BuildToolInfo = build::detect(root).await;
        run.note(format!("detected build tool: {}", info.tool));

        let compiled = build::compile(
            root,
            &info,
            CompileOptions {
                clean: false,
                skip_tests: true,
                sink: sink.clone(),
            },
        )
        .await;
        run.note(format!(
            "compile: success={} errors={}",
            compiled.success,
            compiled.errors.len()
        ));
        let compile_ok = compiled.success;
        compile_summary = Some(compiled);

        if compile_ok && mode == ValidationMode::Full && build::has_test_files(root) {
            let tested = build::run_tests(
                root,
                &info,
                TestOptions {
                    pattern: None,
                    sink,
                },
            )
            .await;
            run.note(format!(
                "tests: run={} failed={}",
                tested.tests_run, tested.tests_failed
            ));
            test_summary = Some(tested);
        }
    } else {
        warn!("No repository root; validating without build execution");
    }

    let prompt = build_prompt(code_changes, compile_summary.as_ref(), test_summary.as_ref());

    let mut result: ValidationResult = match router
        .complete_json(
            ModelRole::Coder,
            Some(VALIDATOR_SYSTEM_PROMPT),
            &prompt,
            CallOpts {
                max_tokens: Some(4096),
                ..CallOpts::default()
            },
        )
        .await
    {
        Ok(result) => result,
        Err(e) => {
            // The factual build results still make a usable result when
            // the model is unavailable.
            warn!(error = %e, "Validator model failed; using build facts only");
            run.note(format!("model failed: {e}"));
            let mut fallback = ValidationResult::new(&code_changes.plan_id);
            fallback.passed = compile_summary.as_ref().map(|c| c.success).unwrap_or(false)
                && test_summary.as_ref().map(|t| t.success).unwrap_or(true);
            fallback
                .recommendations
                .push("Validator model unavailable; judgment based on build output only".into());
            fallback
        }
    };

    result.plan_id = code_changes.plan_id.clone();
    annotate_with_build_results(&mut result, compile_summary.as_ref(), test_summary.as_ref());

    if result.test_coverage == 0.0 {
        let production: String = code_changes
            .changes
            .iter()
            .filter(|c| !c.file_path.contains("/test/"))
            .map(|c| c.modified_content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        let tests: String = code_changes
            .changes
            .iter()
            .filter(|c| c.file_path.contains("/test/"))
            .map(|c| c.modified_content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        result.test_coverage = estimate_test_coverage(&production, &tests);
    }

    info!(
        passed = result.passed,
        compilation = result.compilation_passed,
        checks = result.checks.len(),
        "Validation complete"
    );

    let model_id = router.model_id(ModelRole::Coder);
    Ok((
        ValidationOutcome {
            result,
            compile: compile_summary,
            tests: test_summary,
        },
        run.finish(model_id),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::CompilerDiagnostic;

    #[test]
    fn validation_mode_parses() {
        assert_eq!(ValidationMode::parse("skip"), ValidationMode::Skip);
        assert_eq!(ValidationMode::parse("compile_only"), ValidationMode::CompileOnly);
        assert_eq!(ValidationMode::parse("full"), ValidationMode::Full);
        assert_eq!(ValidationMode::parse("anything"), ValidationMode::Full);
    }

    #[test]
    fn quality_scan_flags_magic_numbers_and_naming() {
        let code = "public class badName {\n    public int Compute() { return 42; }\n}";
        let (score, issues) = check_code_quality(code);
        assert!(score < 10.0);
        assert!(issues.iter().any(|i| i.contains("magic number 42")));
        assert!(issues.iter().any(|i| i.contains("badName")));
        assert!(issues.iter().any(|i| i.contains("Compute")));
    }

    #[test]
    fn spring_checks_flag_field_injection() {
        let code = "@Autowired\nprivate UserRepository repo;";
        let violations = check_spring_conventions(code);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].contains("constructor injection"));
    }

    #[test]
    fn security_scan_catches_the_usual_suspects() {
        let code = "String password = \"hunter2\";\nMessageDigest.getInstance(\"MD5\");";
        let vulnerabilities = check_security_issues(code);
        assert!(vulnerabilities.iter().any(|v| v.contains("credential")));
        assert!(vulnerabilities.iter().any(|v| v.contains("MD5")));
    }

    #[test]
    fn coverage_estimate_is_clamped() {
        let production = "public void a() {}\npublic void b() {}";
        let tests = "@Test\nvoid t1() {}\n@Test\nvoid t2() {}\n@Test\nvoid t3() {}";
        assert_eq!(estimate_test_coverage(production, tests), 1.0);
        assert_eq!(estimate_test_coverage("", tests), 0.0);
    }

    #[test]
    fn annotation_overrides_model_optimism() {
        let mut result = ValidationResult::new("plan_1");
        result.passed = true;
        let compile = CompileSummary {
            success: false,
            build_tool: "maven".into(),
            errors: vec![CompilerDiagnostic {
                file_path: "A.java".into(),
                line: Some(3),
                column: None,
                message: "cannot find symbol".into(),
            }],
            warnings: vec![],
            duration_ms: 10.0,
            output: String::new(),
        };
        annotate_with_build_results(&mut result, Some(&compile), None);
        assert!(!result.passed);
        assert!(!result.compilation_passed);
        assert!(result.checks.contains_key("maven_compile"));
    }

    #[test]
    fn annotation_attaches_junit_totals() {
        let mut result = ValidationResult::new("plan_1");
        result.passed = true;
        result.compilation_passed = true;
        let tests = TestSummary {
            success: true,
            tests_run: 7,
            tests_passed: 7,
            tests_failed: 0,
            tests_skipped: 0,
            failures: vec![],
            duration_ms: 5.0,
            output: String::new(),
        };
        annotate_with_build_results(&mut result, None, Some(&tests));
        assert!(result.passed);
        assert_eq!(result.junit_test_results.unwrap().tests_run, 7);
        assert!(result.checks.contains_key("junit_tests"));
    }
}
