use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Result of one quality gate (compilation, tests, a static scanner...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationCheck {
    #[serde(default)]
    pub check_name: String,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub compilation_errors: Vec<String>,
    #[serde(default)]
    pub code_quality_score: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JUnitTestResults {
    #[serde(default)]
    pub tests_run: u32,
    #[serde(default)]
    pub tests_passed: u32,
    #[serde(default)]
    pub tests_failed: u32,
    #[serde(default)]
    pub tests_skipped: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceMetrics {
    #[serde(default)]
    pub overall_confidence: f64,
    #[serde(default)]
    pub reasoning_quality: f64,
    #[serde(default)]
    pub code_safety: f64,
    #[serde(default)]
    pub test_coverage: f64,
}

impl Default for ConfidenceMetrics {
    fn default() -> Self {
        Self {
            overall_confidence: 0.5,
            reasoning_quality: 0.5,
            code_safety: 0.5,
            test_coverage: 0.0,
        }
    }
}

/// Complete validator output. Every field has a default so a partially
/// filled model response still deserializes; the pipeline then overwrites
/// the factual fields with real build results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub plan_id: String,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub compilation_passed: bool,
    /// Checks keyed by name; ordered for stable serialization.
    #[serde(default)]
    pub checks: BTreeMap<String, ValidationCheck>,
    #[serde(default)]
    pub test_coverage: f64,
    #[serde(default)]
    pub junit_test_results: Option<JUnitTestResults>,
    #[serde(default)]
    pub security_vulnerabilities: Vec<String>,
    #[serde(default)]
    pub confidence: ConfidenceMetrics,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

impl ValidationResult {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            passed: false,
            compilation_passed: false,
            checks: BTreeMap::new(),
            test_coverage: 0.0,
            junit_test_results: None,
            security_vulnerabilities: Vec::new(),
            confidence: ConfidenceMetrics::default(),
            recommendations: Vec::new(),
        }
    }

    /// A trivially passing result used when the user skips validation.
    pub fn skipped(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            passed: true,
            compilation_passed: true,
            checks: BTreeMap::new(),
            test_coverage: 0.0,
            junit_test_results: None,
            security_vulnerabilities: Vec::new(),
            confidence: ConfidenceMetrics {
                overall_confidence: 1.0,
                reasoning_quality: 1.0,
                // Nothing was actually checked.
                code_safety: 0.5,
                test_coverage: 0.0,
            },
            recommendations: vec!["Validation was skipped by user request".to_string()],
        }
    }

    pub fn set_check(&mut self, check: ValidationCheck) {
        self.checks.insert(check.check_name.clone(), check);
    }

    pub fn failed_checks(&self) -> Vec<&str> {
        self.checks
            .values()
            .filter(|c| !c.passed)
            .map(|c| c.check_name.as_str())
            .collect()
    }

    pub fn all_issues(&self) -> Vec<&str> {
        self.checks
            .values()
            .flat_map(|c| {
                c.issues
                    .iter()
                    .chain(c.compilation_errors.iter())
                    .map(|s| s.as_str())
            })
            .collect()
    }

    /// Failed compilation forces `passed = false`, whatever the model said.
    pub fn enforce_compilation_invariant(&mut self) {
        if !self.compilation_passed {
            self.passed = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compilation_failure_forces_overall_failure() {
        let mut result = ValidationResult::new("plan_1");
        result.passed = true;
        result.compilation_passed = false;
        result.enforce_compilation_invariant();
        assert!(!result.passed);
    }

    #[test]
    fn empty_json_deserializes_with_defaults() {
        let result: ValidationResult =
            serde_json::from_str(r#"{"plan_id": "plan_1"}"#).unwrap();
        assert!(!result.passed);
        assert!(result.checks.is_empty());
        assert_eq!(result.confidence.test_coverage, 0.0);
    }

    #[test]
    fn failed_checks_and_issues_project() {
        let mut result = ValidationResult::new("plan_1");
        result.set_check(ValidationCheck {
            check_name: "maven_compile".into(),
            passed: false,
            issues: vec!["bad".into()],
            compilation_errors: vec!["cannot find symbol".into()],
            code_quality_score: None,
        });
        result.set_check(ValidationCheck {
            check_name: "junit_tests".into(),
            passed: true,
            ..ValidationCheck::default()
        });
        assert_eq!(result.failed_checks(), vec!["maven_compile"]);
        assert_eq!(result.all_issues().len(), 2);
    }
}
