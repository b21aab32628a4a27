use std::sync::OnceLock;

use regex::Regex;

use super::{BuildTool, CompilerDiagnostic, TestFailure, TestSummary};

fn maven_diag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // [ERROR] /path/Foo.java:[12,8] cannot find symbol
    RE.get_or_init(|| {
        Regex::new(r"^\[(ERROR|WARNING)\]\s+(\S+\.java):\[(\d+)(?:,(\d+))?\]\s+(.*)$").unwrap()
    })
}

fn gradle_diag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // /path/Foo.java:12: error: cannot find symbol
    RE.get_or_init(|| Regex::new(r"^(\S+\.java):(\d+):\s+(error|warning):\s+(.*)$").unwrap())
}

fn surefire_totals_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // Tests run: 12, Failures: 1, Errors: 0, Skipped: 2
    RE.get_or_init(|| {
        Regex::new(r"Tests run:\s*(\d+),\s*Failures:\s*(\d+),\s*Errors:\s*(\d+),\s*Skipped:\s*(\d+)")
            .unwrap()
    })
}

fn gradle_totals_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // 12 tests completed, 1 failed, 2 skipped
    RE.get_or_init(|| {
        Regex::new(r"(\d+) tests? completed(?:,\s*(\d+) failed)?(?:,\s*(\d+) skipped)?").unwrap()
    })
}

fn surefire_failure_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // [ERROR] testAdd(com.example.CalcTest)  Time elapsed: 0.01 s  <<< FAILURE!
    RE.get_or_init(|| {
        Regex::new(r"\[ERROR\]\s+(\w+)\(([\w.$]+)\).*<<<\s+(FAILURE|ERROR)!").unwrap()
    })
}

fn surefire_failure_listing_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // [ERROR]   CalcTest.testAdd:42 expected:<3> but was:<4>
    RE.get_or_init(|| {
        Regex::new(r"(?m)\[ERROR\]\s{2,}([\w.$]+)\.(\w+):?\d*\s+(.+)$").unwrap()
    })
}

/// Extract structured errors and warnings from compiler output.
pub fn parse_compile_output(
    tool: BuildTool,
    output: &str,
) -> (Vec<CompilerDiagnostic>, Vec<CompilerDiagnostic>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    for line in output.lines() {
        match tool {
            BuildTool::Maven => {
                if let Some(caps) = maven_diag_re().captures(line) {
                    let diag = CompilerDiagnostic {
                        file_path: caps[2].to_string(),
                        line: caps[3].parse().ok(),
                        column: caps.get(4).and_then(|m| m.as_str().parse().ok()),
                        message: caps[5].to_string(),
                    };
                    if &caps[1] == "ERROR" {
                        errors.push(diag);
                    } else {
                        warnings.push(diag);
                    }
                }
            }
            BuildTool::Gradle => {
                if let Some(caps) = gradle_diag_re().captures(line) {
                    let diag = CompilerDiagnostic {
                        file_path: caps[1].to_string(),
                        line: caps[2].parse().ok(),
                        column: None,
                        message: caps[4].to_string(),
                    };
                    if &caps[3] == "error" {
                        errors.push(diag);
                    } else {
                        warnings.push(diag);
                    }
                }
            }
            BuildTool::Unknown => {}
        }
    }

    (errors, warnings)
}

/// Extract test totals and per-failure details. Totals come from the last
/// summary line in the output (Maven prints per-class summaries first).
pub fn parse_test_output(tool: BuildTool, output: &str) -> TestSummary {
    let mut summary = TestSummary {
        success: false,
        tests_run: 0,
        tests_passed: 0,
        tests_failed: 0,
        tests_skipped: 0,
        failures: Vec::new(),
        duration_ms: 0.0,
        output: String::new(),
    };

    match tool {
        BuildTool::Maven => {
            if let Some(caps) = surefire_totals_re().captures_iter(output).last() {
                let run: u32 = caps[1].parse().unwrap_or(0);
                let failures: u32 = caps[2].parse().unwrap_or(0);
                let errors: u32 = caps[3].parse().unwrap_or(0);
                let skipped: u32 = caps[4].parse().unwrap_or(0);
                summary.tests_run = run;
                summary.tests_failed = failures + errors;
                summary.tests_skipped = skipped;
                summary.tests_passed = run.saturating_sub(failures + errors + skipped);
            }
            for caps in surefire_failure_re().captures_iter(output) {
                summary.failures.push(TestFailure {
                    test_method: caps[1].to_string(),
                    test_class: caps[2].to_string(),
                    message: String::new(),
                    error_type: if &caps[3] == "ERROR" {
                        "Error".into()
                    } else {
                        "AssertionFailure".into()
                    },
                });
            }
            // The end-of-run listing carries the assertion messages.
            for caps in surefire_failure_listing_re().captures_iter(output) {
                let class = caps[1].to_string();
                let method = caps[2].to_string();
                let message = caps[3].trim().to_string();
                if let Some(existing) = summary.failures.iter_mut().find(|f| {
                    f.test_method == method && f.test_class.ends_with(&class)
                }) {
                    if existing.message.is_empty() {
                        existing.message = message;
                    }
                } else {
                    summary.failures.push(TestFailure {
                        test_class: class,
                        test_method: method,
                        message,
                        error_type: "AssertionFailure".into(),
                    });
                }
            }
        }
        BuildTool::Gradle => {
            if let Some(caps) = gradle_totals_re().captures_iter(output).last() {
                let run: u32 = caps[1].parse().unwrap_or(0);
                let failed: u32 = caps
                    .get(2)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0);
                let skipped: u32 = caps
                    .get(3)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(0);
                summary.tests_run = run;
                summary.tests_failed = failed;
                summary.tests_skipped = skipped;
                summary.tests_passed = run.saturating_sub(failed + skipped);
            }
        }
        BuildTool::Unknown => {}
    }

    summary.success = summary.tests_failed == 0 && summary.tests_run > 0;
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAVEN_COMPILE_FAIL: &str = "\
[INFO] Compiling 4 source files\n\
[ERROR] /work/src/main/java/com/example/UserService.java:[14,8] cannot find symbol\n\
[ERROR]   symbol:   class Service\n\
[WARNING] /work/src/main/java/com/example/Util.java:[3,1] deprecated API\n\
[INFO] BUILD FAILURE";

    #[test]
    fn maven_errors_and_warnings_are_split() {
        let (errors, warnings) = parse_compile_output(BuildTool::Maven, MAVEN_COMPILE_FAIL);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, Some(14));
        assert_eq!(errors[0].column, Some(8));
        assert!(errors[0].message.contains("cannot find symbol"));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn gradle_diagnostics_parse() {
        let out = "/work/src/A.java:7: error: ';' expected\n/work/src/B.java:2: warning: unchecked";
        let (errors, warnings) = parse_compile_output(BuildTool::Gradle, out);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].line, Some(7));
        assert_eq!(warnings.len(), 1);
    }

    const MAVEN_TEST_FAIL: &str = "\
[INFO] Running com.example.CalcTest\n\
[ERROR] testAdd(com.example.CalcTest)  Time elapsed: 0.013 s  <<< FAILURE!\n\
Tests run: 3, Failures: 1, Errors: 0, Skipped: 0\n\
[ERROR] Failures:\n\
[ERROR]   CalcTest.testAdd:42 expected:<3> but was:<4>\n\
[INFO] Results:\n\
Tests run: 5, Failures: 1, Errors: 0, Skipped: 1\n";

    #[test]
    fn maven_totals_take_the_last_summary_line() {
        let summary = parse_test_output(BuildTool::Maven, MAVEN_TEST_FAIL);
        assert_eq!(summary.tests_run, 5);
        assert_eq!(summary.tests_failed, 1);
        assert_eq!(summary.tests_skipped, 1);
        assert_eq!(summary.tests_passed, 3);
        assert!(!summary.success);
    }

    #[test]
    fn maven_failures_carry_class_method_and_message() {
        let summary = parse_test_output(BuildTool::Maven, MAVEN_TEST_FAIL);
        assert_eq!(summary.failures.len(), 1);
        let failure = &summary.failures[0];
        assert_eq!(failure.test_class, "com.example.CalcTest");
        assert_eq!(failure.test_method, "testAdd");
        assert!(failure.message.contains("expected:<3>"));
        assert_eq!(failure.error_type, "AssertionFailure");
    }

    #[test]
    fn gradle_totals_parse_with_optional_groups() {
        let summary =
            parse_test_output(BuildTool::Gradle, "12 tests completed, 2 failed, 1 skipped");
        assert_eq!(summary.tests_run, 12);
        assert_eq!(summary.tests_failed, 2);
        assert_eq!(summary.tests_skipped, 1);
        assert_eq!(summary.tests_passed, 9);

        let summary = parse_test_output(BuildTool::Gradle, "8 tests completed");
        assert_eq!(summary.tests_failed, 0);
        assert!(summary.success);
    }

    #[test]
    fn green_maven_run_is_successful() {
        let summary = parse_test_output(
            BuildTool::Maven,
            "Tests run: 4, Failures: 0, Errors: 0, Skipped: 0\n[INFO] BUILD SUCCESS",
        );
        assert!(summary.success);
        assert_eq!(summary.tests_passed, 4);
    }
}
