//! Git driver that shells out to the `git` binary.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::domain::error::{EngineError, EngineResult};
use crate::domain::models::transaction::RepositorySnapshot;
use crate::services::transaction_manager::GitDriver;

/// Runs git commands against one repository working directory.
pub struct ShellGitDriver {
    repo_path: PathBuf,
}

impl ShellGitDriver {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
        }
    }

    #[instrument(skip(self), fields(repo = %self.repo_path.display()))]
    async fn git(&self, args: &[&str]) -> EngineResult<String> {
        debug!(?args, "running git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.repo_path)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Repository(format!("failed to spawn git: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if output.status.success() {
            Ok(stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let message = if stderr.is_empty() { stdout } else { stderr };
            Err(classify_git_error(&message))
        }
    }
}

/// Map git stderr onto the engine taxonomy.
fn classify_git_error(message: &str) -> EngineError {
    let lower = message.to_lowercase();
    if lower.contains("conflict") {
        EngineError::Conflict(message.to_string())
    } else if lower.contains("authentication") || lower.contains("permission denied") {
        EngineError::Auth(message.to_string())
    } else if lower.contains("could not resolve host") || lower.contains("connection") {
        EngineError::Network(message.to_string())
    } else {
        EngineError::Repository(message.to_string())
    }
}

#[async_trait]
impl GitDriver for ShellGitDriver {
    async fn capture_state(&self) -> EngineResult<RepositorySnapshot> {
        let head = self.git(&["rev-parse", "HEAD"]).await?;
        let branch = self.git(&["rev-parse", "--abbrev-ref", "HEAD"]).await?;
        let branches = self
            .git(&["branch", "--format=%(refname:short)"])
            .await?
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        let stash_count = self
            .git(&["stash", "list"])
            .await?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .count();
        let clean = self.git(&["status", "--porcelain"]).await?.is_empty();

        Ok(RepositorySnapshot {
            head,
            branch,
            branches,
            stash_count,
            clean,
            captured_at: Utc::now(),
        })
    }

    async fn run(&self, operation: &str, args: &[String]) -> EngineResult<String> {
        let mut full: Vec<&str> = operation.split_whitespace().collect();
        full.extend(args.iter().map(String::as_str));
        self.git(&full).await
    }

    async fn reset_hard(&self, reference: &str) -> EngineResult<()> {
        self.git(&["reset", "--hard", reference]).await.map(|_| ())
    }

    async fn delete_branch(&self, branch: &str) -> EngineResult<()> {
        self.git(&["branch", "-D", branch]).await.map(|_| ())
    }

    async fn abort_merge(&self) -> EngineResult<()> {
        self.git(&["merge", "--abort"]).await.map(|_| ())
    }

    async fn stash_pop(&self) -> EngineResult<()> {
        self.git(&["stash", "pop"]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_git_error_classification() {
        assert!(matches!(
            classify_git_error("CONFLICT (content): merge conflict in a.rs"),
            EngineError::Conflict(_)
        ));
        assert!(matches!(
            classify_git_error("fatal: Authentication failed"),
            EngineError::Auth(_)
        ));
        assert!(matches!(
            classify_git_error("fatal: unable to access: Could not resolve host"),
            EngineError::Network(_)
        ));
        assert!(matches!(
            classify_git_error("fatal: not a git repository"),
            EngineError::Repository(_)
        ));
    }
}
