use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildTool {
    Maven,
    Gradle,
    Unknown,
}

impl std::fmt::Display for BuildTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BuildTool::Maven => write!(f, "maven"),
            BuildTool::Gradle => write!(f, "gradle"),
            BuildTool::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildToolInfo {
    pub tool: BuildTool,
    pub version: Option<String>,
    /// Wrapper script present at the root (mvnw / gradlew).
    pub has_wrapper: bool,
}

impl BuildToolInfo {
    pub fn unknown() -> Self {
        Self {
            tool: BuildTool::Unknown,
            version: None,
            has_wrapper: false,
        }
    }

    /// The command to invoke: the project wrapper when present, otherwise
    /// the tool from PATH.
    pub fn command(&self, root: &Path) -> PathBuf {
        match (self.tool, self.has_wrapper) {
            (BuildTool::Maven, true) => root.join("./mvnw"),
            (BuildTool::Maven, false) => PathBuf::from("mvn"),
            (BuildTool::Gradle, true) => root.join("./gradlew"),
            (BuildTool::Gradle, false) => PathBuf::from("gradle"),
            (BuildTool::Unknown, _) => PathBuf::from("false"),
        }
    }
}

/// Probe the repository root for known build manifests.
pub async fn detect(root: &Path) -> BuildToolInfo {
    let info = if root.join("pom.xml").exists() {
        BuildToolInfo {
            tool: BuildTool::Maven,
            version: read_version("mvn").await,
            has_wrapper: root.join("mvnw").exists(),
        }
    } else if root.join("build.gradle").exists() || root.join("build.gradle.kts").exists() {
        BuildToolInfo {
            tool: BuildTool::Gradle,
            version: read_version("gradle").await,
            has_wrapper: root.join("gradlew").exists(),
        }
    } else {
        BuildToolInfo::unknown()
    };
    debug!(tool = %info.tool, wrapper = info.has_wrapper, "Detected build tool");
    info
}

async fn read_version(command: &str) -> Option<String> {
    let output = tokio::process::Command::new(command)
        .arg("--version")
        .output()
        .await
        .ok()?;
    let text = String::from_utf8_lossy(&output.stdout);
    // First line carries the version banner for both tools.
    text.lines().next().map(|l| l.trim().to_string())
}

/// Whether the project has any Java test sources.
pub fn has_test_files(root: &Path) -> bool {
    let test_root = root.join("src/test/java");
    if !test_root.exists() {
        return false;
    }
    let mut stack = vec![test_root];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().and_then(|e| e.to_str()) == Some("java") {
                return true;
            }
        }
    }
    false
}
