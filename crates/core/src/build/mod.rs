mod deps;
mod detect;
mod parse;
mod run;

pub use deps::{add_maven_dependency, common_dependencies, MavenCoordinate};
pub use detect::{detect, has_test_files, BuildTool, BuildToolInfo};
pub use parse::{parse_compile_output, parse_test_output};
pub use run::OutputSink;

use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Raw output kept on a summary is capped at this many bytes.
const MAX_CAPTURED_OUTPUT: usize = 64 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilerDiagnostic {
    pub file_path: String,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub message: String,
}

impl std::fmt::Display for CompilerDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.file_path, line, self.message),
            None => write!(f, "{}: {}", self.file_path, self.message),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompileSummary {
    pub success: bool,
    pub build_tool: String,
    pub errors: Vec<CompilerDiagnostic>,
    pub warnings: Vec<CompilerDiagnostic>,
    pub duration_ms: f64,
    /// Captured stdout+stderr, truncated to a cap.
    pub output: String,
}

impl CompileSummary {
    pub fn error_count(&self) -> usize {
        self.errors.len()
    }

    /// Result reported when no build tool (or binary) is available.
    pub fn unavailable(build_tool: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            build_tool: build_tool.to_string(),
            errors: vec![CompilerDiagnostic {
                file_path: String::new(),
                line: None,
                column: None,
                message: message.into(),
            }],
            warnings: Vec::new(),
            duration_ms: 0.0,
            output: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_class: String,
    pub test_method: String,
    pub message: String,
    pub error_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSummary {
    pub success: bool,
    pub tests_run: u32,
    pub tests_passed: u32,
    pub tests_failed: u32,
    pub tests_skipped: u32,
    pub failures: Vec<TestFailure>,
    pub duration_ms: f64,
    pub output: String,
}

impl TestSummary {
    pub fn pass_rate(&self) -> f64 {
        if self.tests_run == 0 {
            0.0
        } else {
            self.tests_passed as f64 / self.tests_run as f64
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    pub clean: bool,
    pub skip_tests: bool,
    pub sink: Option<OutputSink>,
}

#[derive(Debug, Clone, Default)]
pub struct TestOptions {
    /// Restrict the run to tests matching this pattern.
    pub pattern: Option<String>,
    pub sink: Option<OutputSink>,
}

fn cap_output(mut output: String) -> String {
    if output.len() > MAX_CAPTURED_OUTPUT {
        let keep = output.len() - MAX_CAPTURED_OUTPUT;
        output.drain(..keep);
        output.insert_str(0, "... (output truncated)\n");
    }
    output
}

fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Compile the project, streaming every output line into `opts.sink` as it
/// arrives and parsing diagnostics once the process exits.
pub async fn compile(
    root: &Path,
    info: &BuildToolInfo,
    opts: CompileOptions,
) -> CompileSummary {
    let tool_name = info.tool.to_string();
    if info.tool == BuildTool::Unknown {
        return CompileSummary::unavailable(
            &tool_name,
            "No build tool detected (pom.xml or build.gradle not found)",
        );
    }

    let mut args: Vec<&str> = Vec::new();
    match info.tool {
        BuildTool::Maven => {
            if opts.clean {
                args.push("clean");
            }
            args.push("compile");
            args.push("-B");
            if opts.skip_tests {
                args.push("-DskipTests=true");
            }
        }
        BuildTool::Gradle => {
            if opts.clean {
                args.push("clean");
            }
            args.push("compileJava");
        }
        BuildTool::Unknown => unreachable!(),
    }

    let started = Instant::now();
    let result = run::run_streaming(info.command(root), &args, root, opts.sink.clone()).await;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    let (output, exit_code) = match result {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = %tool_name, error = %e, "Compile process failed to run");
            return CompileSummary::unavailable(&tool_name, format!("Build failed to start: {e}"));
        }
    };

    let (mut errors, warnings) = parse_compile_output(info.tool, &output);
    let success = exit_code == 0;
    if !success && errors.is_empty() {
        errors.push(CompilerDiagnostic {
            file_path: String::new(),
            line: None,
            column: None,
            message: format!("Build exited with status {exit_code}: {}", tail(&output, 20)),
        });
    }

    info!(
        tool = %tool_name,
        success,
        errors = errors.len(),
        warnings = warnings.len(),
        duration_ms,
        "Compile finished"
    );

    CompileSummary {
        success,
        build_tool: tool_name,
        errors,
        warnings,
        duration_ms,
        output: cap_output(output),
    }
}

/// Run the test suite, streaming output lines and extracting totals plus
/// per-failure details afterwards.
pub async fn run_tests(root: &Path, info: &BuildToolInfo, opts: TestOptions) -> TestSummary {
    let tool_name = info.tool.to_string();
    if info.tool == BuildTool::Unknown {
        return TestSummary {
            success: false,
            tests_run: 0,
            tests_passed: 0,
            tests_failed: 0,
            tests_skipped: 0,
            failures: vec![TestFailure {
                test_class: "BuildSystem".into(),
                test_method: "detection".into(),
                message: "No build tool detected (pom.xml or build.gradle not found)".into(),
                error_type: "BuildToolNotFound".into(),
            }],
            duration_ms: 0.0,
            output: String::new(),
        };
    }

    let pattern_arg;
    let mut args: Vec<&str> = Vec::new();
    match info.tool {
        BuildTool::Maven => {
            args.push("test");
            args.push("-B");
            if let Some(pattern) = &opts.pattern {
                pattern_arg = format!("-Dtest={pattern}");
                args.push(&pattern_arg);
            }
        }
        BuildTool::Gradle => {
            args.push("test");
            if let Some(pattern) = &opts.pattern {
                args.push("--tests");
                pattern_arg = pattern.clone();
                args.push(&pattern_arg);
            }
        }
        BuildTool::Unknown => unreachable!(),
    }

    let started = Instant::now();
    let result = run::run_streaming(info.command(root), &args, root, opts.sink.clone()).await;
    let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

    let (output, exit_code) = match result {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = %tool_name, error = %e, "Test process failed to run");
            return TestSummary {
                success: false,
                tests_run: 0,
                tests_passed: 0,
                tests_failed: 0,
                tests_skipped: 0,
                failures: vec![TestFailure {
                    test_class: "BuildSystem".into(),
                    test_method: "spawn".into(),
                    message: e.to_string(),
                    error_type: "ProcessError".into(),
                }],
                duration_ms,
                output: String::new(),
            };
        }
    };

    let mut summary = parse_test_output(info.tool, &output);
    summary.duration_ms = duration_ms;
    summary.success = exit_code == 0 && summary.tests_failed == 0;
    if exit_code != 0 && summary.tests_run == 0 && summary.failures.is_empty() {
        summary.failures.push(TestFailure {
            test_class: "BuildSystem".into(),
            test_method: "test_run".into(),
            message: tail(&output, 20),
            error_type: "BuildFailure".into(),
        });
    }
    summary.output = cap_output(output);

    info!(
        tool = %tool_name,
        success = summary.success,
        run = summary.tests_run,
        failed = summary.tests_failed,
        duration_ms,
        "Test run finished"
    );

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cap_output_keeps_the_tail() {
        let long = "x".repeat(MAX_CAPTURED_OUTPUT + 100);
        let capped = cap_output(long);
        assert!(capped.starts_with("... (output truncated)"));
        assert!(capped.len() <= MAX_CAPTURED_OUTPUT + 32);
    }

    #[test]
    fn tail_returns_last_lines() {
        let text = "a\nb\nc\nd";
        assert_eq!(tail(text, 2), "c\nd");
        assert_eq!(tail(text, 10), text);
    }

    #[tokio::test]
    async fn unknown_tool_yields_synthetic_failure() {
        let dir = tempfile::tempdir().unwrap();
        let info = BuildToolInfo::unknown();
        let summary = compile(dir.path(), &info, CompileOptions::default()).await;
        assert!(!summary.success);
        assert_eq!(summary.error_count(), 1);
        assert!(summary.errors[0].message.contains("No build tool detected"));

        let tests = run_tests(dir.path(), &info, TestOptions::default()).await;
        assert!(!tests.success);
        assert_eq!(tests.failures[0].error_type, "BuildToolNotFound");
    }
}
