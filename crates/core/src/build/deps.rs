use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

/// A Maven dependency coordinate, optionally scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MavenCoordinate {
    pub group_id: String,
    pub artifact_id: String,
    pub version: String,
    pub scope: Option<String>,
}

impl MavenCoordinate {
    pub fn new(group_id: &str, artifact_id: &str, version: &str) -> Self {
        Self {
            group_id: group_id.into(),
            artifact_id: artifact_id.into(),
            version: version.into(),
            scope: None,
        }
    }

    fn scoped(group_id: &str, artifact_id: &str, version: &str, scope: &str) -> Self {
        Self {
            scope: Some(scope.into()),
            ..Self::new(group_id, artifact_id, version)
        }
    }

    /// Parse `groupId:artifactId:version`.
    pub fn parse(coordinate: &str) -> Result<Self> {
        let parts: Vec<&str> = coordinate.split(':').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            bail!("Invalid coordinate '{coordinate}'. Expected groupId:artifactId:version");
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }

    fn to_xml(&self) -> String {
        let mut xml = format!(
            "        <dependency>\n            <groupId>{}</groupId>\n            <artifactId>{}</artifactId>\n            <version>{}</version>\n",
            self.group_id, self.artifact_id, self.version
        );
        if let Some(scope) = &self.scope {
            xml.push_str(&format!("            <scope>{scope}</scope>\n"));
        }
        xml.push_str("        </dependency>\n");
        xml
    }
}

impl std::fmt::Display for MavenCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.group_id, self.artifact_id, self.version)
    }
}

/// Catalog of short names the transformer may reference instead of full
/// coordinates.
pub fn common_dependencies() -> Vec<(&'static str, MavenCoordinate)> {
    vec![
        (
            "spring-context",
            MavenCoordinate::new("org.springframework", "spring-context", "6.1.14"),
        ),
        (
            "spring-boot-starter-web",
            MavenCoordinate::new("org.springframework.boot", "spring-boot-starter-web", "3.3.5"),
        ),
        (
            "spring-boot-starter-data-jpa",
            MavenCoordinate::new(
                "org.springframework.boot",
                "spring-boot-starter-data-jpa",
                "3.3.5",
            ),
        ),
        (
            "spring-boot-starter-security",
            MavenCoordinate::new(
                "org.springframework.boot",
                "spring-boot-starter-security",
                "3.3.5",
            ),
        ),
        (
            "spring-boot-starter-test",
            MavenCoordinate::scoped(
                "org.springframework.boot",
                "spring-boot-starter-test",
                "3.3.5",
                "test",
            ),
        ),
        (
            "junit-jupiter",
            MavenCoordinate::scoped("org.junit.jupiter", "junit-jupiter", "5.10.3", "test"),
        ),
        (
            "mockito-core",
            MavenCoordinate::scoped("org.mockito", "mockito-core", "5.11.0", "test"),
        ),
        (
            "lombok",
            MavenCoordinate::new("org.projectlombok", "lombok", "1.18.34"),
        ),
        (
            "slf4j-api",
            MavenCoordinate::new("org.slf4j", "slf4j-api", "2.0.13"),
        ),
        (
            "logback-classic",
            MavenCoordinate::new("ch.qos.logback", "logback-classic", "1.5.6"),
        ),
    ]
}

/// Resolve a short catalog name or a raw coordinate and insert it into the
/// project's pom.xml. Returns the resolved coordinate; inserting an
/// already-declared artifact is a no-op.
pub fn add_maven_dependency(root: &Path, dependency_key: &str) -> Result<MavenCoordinate> {
    let coordinate = common_dependencies()
        .into_iter()
        .find(|(name, _)| *name == dependency_key)
        .map(|(_, c)| c)
        .map(Ok)
        .unwrap_or_else(|| MavenCoordinate::parse(dependency_key))?;

    let pom_path = root.join("pom.xml");
    let pom = std::fs::read_to_string(&pom_path)
        .with_context(|| format!("pom.xml not found at {}", pom_path.display()))?;

    if pom.contains(&format!("<artifactId>{}</artifactId>", coordinate.artifact_id)) {
        debug!(%coordinate, "Dependency already declared");
        return Ok(coordinate);
    }

    let updated = if let Some(idx) = pom.find("</dependencies>") {
        let mut out = pom.clone();
        out.insert_str(idx, &coordinate.to_xml());
        out
    } else if let Some(idx) = pom.find("</project>") {
        let mut out = pom.clone();
        out.insert_str(
            idx,
            &format!("    <dependencies>\n{}    </dependencies>\n", coordinate.to_xml()),
        );
        out
    } else {
        bail!("pom.xml has no </dependencies> or </project> element");
    };

    std::fs::write(&pom_path, updated)?;
    info!(%coordinate, "Added Maven dependency");
    Ok(coordinate)
}

#[cfg(test)]
mod tests {
    use super::*;

    const POM: &str = "<project>\n    <dependencies>\n    </dependencies>\n</project>\n";

    #[test]
    fn catalog_name_inserts_coordinate() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pom.xml"), POM).unwrap();
        let coordinate = add_maven_dependency(dir.path(), "spring-context").unwrap();
        assert_eq!(coordinate.group_id, "org.springframework");
        let pom = std::fs::read_to_string(dir.path().join("pom.xml")).unwrap();
        assert!(pom.contains("<artifactId>spring-context</artifactId>"));
        assert!(pom.contains("<version>6.1.14</version>"));
    }

    #[test]
    fn custom_coordinate_inserts_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pom.xml"), POM).unwrap();
        add_maven_dependency(dir.path(), "com.google.guava:guava:33.0.0-jre").unwrap();
        add_maven_dependency(dir.path(), "com.google.guava:guava:33.0.0-jre").unwrap();
        let pom = std::fs::read_to_string(dir.path().join("pom.xml")).unwrap();
        assert_eq!(pom.matches("<artifactId>guava</artifactId>").count(), 1);
    }

    #[test]
    fn missing_dependencies_block_is_created() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pom.xml"), "<project>\n</project>\n").unwrap();
        add_maven_dependency(dir.path(), "slf4j-api").unwrap();
        let pom = std::fs::read_to_string(dir.path().join("pom.xml")).unwrap();
        assert!(pom.contains("<dependencies>"));
        assert!(pom.contains("slf4j-api"));
    }

    #[test]
    fn bad_coordinate_is_rejected() {
        assert!(MavenCoordinate::parse("only:two").is_err());
        assert!(MavenCoordinate::parse("a:b:c:d").is_err());
        assert!(MavenCoordinate::parse("::").is_err());
        let c = MavenCoordinate::parse("g:a:1.0").unwrap();
        assert_eq!(c.to_string(), "g:a:1.0");
    }

    #[test]
    fn test_scope_is_rendered() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("pom.xml"), POM).unwrap();
        add_maven_dependency(dir.path(), "junit-jupiter").unwrap();
        let pom = std::fs::read_to_string(dir.path().join("pom.xml")).unwrap();
        assert!(pom.contains("<scope>test</scope>"));
    }
}
