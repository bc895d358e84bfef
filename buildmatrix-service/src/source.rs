// Source Fetch
// Clones the repository under test and resolves the commit identity

use serde::{Deserialize, Serialize};

use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::process::Command;

/// Errors that can occur while fetching the source
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("git is not available: {0}")]
    GitNotAvailable(String),

    #[error("git {step} failed: {stderr}")]
    GitFailed { step: &'static str, stderr: String },

    #[error("unexpected `git show` output: {0}")]
    UnexpectedOutput(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Identity of the repository and commit a job set was built from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryIdentity {
    /// Repository URL as given by the user
    pub url: String,
    /// Abbreviated commit hash
    pub commit: String,
    /// Full commit hash
    pub sha: String,
    pub author: String,
    pub author_email: String,
    pub committer: String,
    pub committer_email: String,
    /// First line of the commit message
    pub subject: String,
}

impl RepositoryIdentity {
    /// Parse the output of `git show -s` with [`GitSource::SHOW_FORMAT`]
    pub fn from_show_output(url: impl Into<String>, output: &str) -> Result<Self, SourceError> {
        let lines: Vec<&str> = output.lines().collect();
        if lines.len() < 6 {
            return Err(SourceError::UnexpectedOutput(output.to_string()));
        }

        Ok(Self {
            url: url.into(),
            commit: lines[0].trim().to_string(),
            sha: lines[1].trim().to_string(),
            author: lines[2].to_string(),
            author_email: lines[3].to_string(),
            committer: lines[4].to_string(),
            committer_email: lines[5].to_string(),
            subject: lines.get(6).map(|s| s.to_string()).unwrap_or_default(),
        })
    }
}

/// An already-fetched checkout handed to the sandbox
#[derive(Debug, Clone)]
pub struct SourceRef {
    /// Directory holding the checked-out working tree
    pub checkout: PathBuf,
    pub repository: RepositoryIdentity,
}

/// Thin wrapper around the `git` CLI
#[derive(Debug, Clone)]
pub struct GitSource {
    git: PathBuf,
}

impl GitSource {
    /// `%h %H %an %ae %cn %ce %s`, one per line
    pub const SHOW_FORMAT: &'static str = "format:%h%n%H%n%an%n%ae%n%cn%n%ce%n%s";

    /// Locate `git` on the PATH
    pub fn new() -> Result<Self, SourceError> {
        let git = which::which("git").map_err(|e| SourceError::GitNotAvailable(e.to_string()))?;
        Ok(Self { git })
    }

    /// Clone `url` into `dest`, check out `commit` if given, and describe HEAD
    pub async fn fetch(
        &self,
        url: &str,
        commit: Option<&str>,
        dest: &Path,
    ) -> Result<SourceRef, SourceError> {
        match commit {
            Some(commit) => tracing::info!(url, commit, "cloning repository"),
            None => tracing::info!(url, "cloning repository"),
        }

        let mut clone = Command::new(&self.git);
        clone.arg("clone").arg("-q");
        if commit.is_none() {
            clone.args(["--single-branch", "--depth", "1"]);
        }
        clone.arg(url).arg(dest);
        self.run("clone", &mut clone).await?;

        if let Some(commit) = commit {
            let mut checkout = Command::new(&self.git);
            checkout.args(["checkout", "-q", commit]).current_dir(dest);
            self.run("checkout", &mut checkout).await?;
        }

        let mut show = Command::new(&self.git);
        show.args(["show", "-s"])
            .arg(format!("--pretty={}", Self::SHOW_FORMAT))
            .current_dir(dest);
        let output = self.run("show", &mut show).await?;
        let repository = RepositoryIdentity::from_show_output(url, &output)?;

        tracing::info!(commit = %repository.commit, subject = %repository.subject, "resolved commit");

        Ok(SourceRef {
            checkout: dest.to_path_buf(),
            repository,
        })
    }

    async fn run(&self, step: &'static str, command: &mut Command) -> Result<String, SourceError> {
        tracing::debug!(step, "running git");
        let output = command.output().await?;
        if !output.status.success() {
            return Err(SourceError::GitFailed {
                step,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_show_output() {
        let output = "abc1234\nabc1234def5678\nAlice\nalice@example.com\nBob\nbob@example.com\nFix the build";
        let identity = RepositoryIdentity::from_show_output("https://example.com/repo.git", output)
            .unwrap();

        assert_eq!(identity.url, "https://example.com/repo.git");
        assert_eq!(identity.commit, "abc1234");
        assert_eq!(identity.sha, "abc1234def5678");
        assert_eq!(identity.author, "Alice");
        assert_eq!(identity.committer_email, "bob@example.com");
        assert_eq!(identity.subject, "Fix the build");
    }

    #[test]
    fn test_parse_show_output_empty_subject() {
        let output = "abc\nabcdef\nA\na@x\nB\nb@x\n";
        let identity = RepositoryIdentity::from_show_output("repo", output).unwrap();
        assert_eq!(identity.subject, "");
    }

    #[test]
    fn test_parse_show_output_truncated() {
        let err = RepositoryIdentity::from_show_output("repo", "abc\nabcdef").unwrap_err();
        assert!(matches!(err, SourceError::UnexpectedOutput(_)));
    }

    #[tokio::test]
    async fn test_fetch_local_repository() {
        let Ok(source) = GitSource::new() else {
            return;
        };
        let origin = tempfile::TempDir::new().unwrap();
        let git = |args: &[&str]| {
            let status = std::process::Command::new("git")
                .args(["-c", "user.name=Alice", "-c", "user.email=alice@example.com"])
                .args(args)
                .current_dir(origin.path())
                .status()
                .unwrap();
            assert!(status.success());
        };
        git(&["init", "-q"]);
        std::fs::write(origin.path().join(".travis.yml"), "env: [A, B]\n").unwrap();
        git(&["add", "."]);
        git(&["commit", "-q", "-m", "Add matrix"]);

        let work = tempfile::TempDir::new().unwrap();
        let dest = work.path().join("checkout");
        let url = origin.path().to_string_lossy().to_string();
        let fetched = source.fetch(&url, None, &dest).await.unwrap();

        assert!(fetched.checkout.join(".travis.yml").is_file());
        assert_eq!(fetched.repository.subject, "Add matrix");
        assert_eq!(fetched.repository.author, "Alice");
        assert!(fetched.repository.sha.starts_with(&fetched.repository.commit));
    }

    #[tokio::test]
    async fn test_fetch_reports_failed_step() {
        let Ok(source) = GitSource::new() else {
            return;
        };
        let work = tempfile::TempDir::new().unwrap();
        let err = source
            .fetch(
                &work.path().join("missing").to_string_lossy(),
                None,
                &work.path().join("checkout"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::GitFailed { step: "clone", .. }));
    }
}
