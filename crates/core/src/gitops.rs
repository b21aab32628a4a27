use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{info, warn};

const CLONE_TIMEOUT: Duration = Duration::from_secs(300);
const PUSH_TIMEOUT: Duration = Duration::from_secs(300);
const GIT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("git {operation} failed: {detail}")]
    CommandFailed { operation: String, detail: String },

    #[error("git {0} timed out")]
    Timeout(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Credentials and coordinates for the remote repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitHubCredentials {
    pub repository_url: String,
    pub access_token: String,
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// Inject the access token into an https remote URL.
fn authenticated_url(repo_url: &str, token: &str) -> String {
    if token.is_empty() {
        repo_url.to_string()
    } else {
        repo_url.replacen("https://", &format!("https://{token}@"), 1)
    }
}

/// Browser URL for a pushed branch: `<repo>/tree/<branch>`.
pub fn branch_url(repo_url: &str, branch: &str) -> String {
    let base = repo_url.trim_end_matches('/');
    let base = base.strip_suffix(".git").unwrap_or(base);
    format!("{base}/tree/{branch}")
}

/// Repository name portion of a clone URL.
pub fn repo_name(repo_url: &str) -> String {
    repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git")
        .to_string()
}

async fn run_git(
    operation: &str,
    args: &[&str],
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<String, GitError> {
    let mut cmd = Command::new("git");
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }

    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| GitError::Timeout(operation.to_string()))??;

    if !output.status.success() {
        // git splits diagnostics across both pipes ("nothing to commit"
        // lands on stdout), so keep them together.
        let mut detail = String::from_utf8_lossy(&output.stderr).into_owned();
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            if !detail.is_empty() {
                detail.push('\n');
            }
            detail.push_str(stdout.trim());
        }
        return Err(GitError::CommandFailed {
            operation: operation.to_string(),
            detail: detail.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Shallow-clone the repository into `clone_dir/<name>_<epoch-seconds>/`.
pub async fn clone_repository(
    repo_url: &str,
    access_token: &str,
    branch: &str,
    clone_dir: &Path,
) -> Result<PathBuf, GitError> {
    std::fs::create_dir_all(clone_dir)?;
    let target = clone_dir.join(format!(
        "{}_{}",
        repo_name(repo_url),
        chrono::Utc::now().timestamp()
    ));

    info!(url = %repo_url, branch, target = %target.display(), "Cloning repository");

    let auth_url = authenticated_url(repo_url, access_token);
    let target_str = target.to_string_lossy().into_owned();
    run_git(
        "clone",
        &[
            "clone",
            "--branch",
            branch,
            "--depth",
            "1",
            &auth_url,
            &target_str,
        ],
        None,
        CLONE_TIMEOUT,
    )
    .await?;

    info!(target = %target.display(), "Repository cloned");
    Ok(target)
}

/// Create and check out a new branch.
pub async fn create_branch(repo: &Path, branch: &str) -> Result<(), GitError> {
    info!(branch, "Creating branch");
    run_git("checkout", &["checkout", "-b", branch], Some(repo), GIT_TIMEOUT).await?;
    Ok(())
}

/// Stage everything and commit with the given author identity. Returns the
/// commit hash, or an empty string when there was nothing to commit.
pub async fn commit_all(
    repo: &Path,
    message: &str,
    author_name: &str,
    author_email: &str,
) -> Result<String, GitError> {
    run_git("add", &["add", "-A"], Some(repo), GIT_TIMEOUT).await?;
    run_git(
        "config",
        &["config", "user.name", author_name],
        Some(repo),
        GIT_TIMEOUT,
    )
    .await?;
    run_git(
        "config",
        &["config", "user.email", author_email],
        Some(repo),
        GIT_TIMEOUT,
    )
    .await?;

    match run_git("commit", &["commit", "-m", message], Some(repo), GIT_TIMEOUT).await {
        Ok(_) => {}
        Err(GitError::CommandFailed { detail, .. })
            if detail.contains("nothing to commit") =>
        {
            warn!("No changes to commit");
            return Ok(String::new());
        }
        Err(e) => return Err(e),
    }

    let hash = run_git("rev-parse", &["rev-parse", "HEAD"], Some(repo), GIT_TIMEOUT).await?;
    let hash = hash.trim().to_string();
    info!(commit = %hash, "Changes committed");
    Ok(hash)
}

/// Push the branch to origin with the token injected into the remote URL.
pub async fn push_branch(
    repo: &Path,
    branch: &str,
    access_token: &str,
    repo_url: &str,
) -> Result<(), GitError> {
    let auth_url = authenticated_url(repo_url, access_token);
    run_git(
        "remote",
        &["remote", "set-url", "origin", &auth_url],
        Some(repo),
        GIT_TIMEOUT,
    )
    .await?;

    info!(branch, "Pushing branch to origin");
    run_git(
        "push",
        &["push", "-u", "origin", branch],
        Some(repo),
        PUSH_TIMEOUT,
    )
    .await?;
    info!(branch, "Branch pushed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_injected_once() {
        assert_eq!(
            authenticated_url("https://github.com/u/r", "tok"),
            "https://tok@github.com/u/r"
        );
        assert_eq!(authenticated_url("https://github.com/u/r", ""), "https://github.com/u/r");
    }

    #[test]
    fn branch_url_strips_git_suffix() {
        assert_eq!(
            branch_url("https://github.com/u/r.git", "feature/caching"),
            "https://github.com/u/r/tree/feature/caching"
        );
        assert_eq!(
            branch_url("https://github.com/u/r/", "main"),
            "https://github.com/u/r/tree/main"
        );
    }

    #[test]
    fn repo_name_extracts_last_segment() {
        assert_eq!(repo_name("https://github.com/u/my-repo.git"), "my-repo");
        assert_eq!(repo_name("https://github.com/u/my-repo/"), "my-repo");
    }

    #[tokio::test]
    async fn local_commit_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path();
        run_git("init", &["init", "-b", "main"], Some(repo), GIT_TIMEOUT)
            .await
            .unwrap();
        std::fs::write(repo.join("a.txt"), "hello").unwrap();

        let hash = commit_all(repo, "initial", "Tester", "t@example.com")
            .await
            .unwrap();
        assert_eq!(hash.len(), 40);

        // Nothing staged: commit reports empty hash rather than failing.
        let hash = commit_all(repo, "again", "Tester", "t@example.com")
            .await
            .unwrap();
        assert!(hash.is_empty());

        create_branch(repo, "refactory/session_test").await.unwrap();
    }
}
