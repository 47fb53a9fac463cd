use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::cancel::StopSignal;
use crate::error::{Error, Result};

/// Materializes a repository at `dest` and reports the checked-out commit.
#[async_trait]
pub trait RepoFetcher: Send + Sync {
    async fn fetch(&self, locator: &str, branch: &str, dest: &Path, signal: &StopSignal) -> Result<String>;
}

/// Shallow single-branch clone with the `git` binary.
#[derive(Debug, Clone)]
pub struct GitFetcher {
    timeout: Duration,
}

impl GitFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn git(&self, args: &[&str], cwd: Option<&Path>, signal: &StopSignal) -> Result<String> {
        signal.check()?;
        let mut command = Command::new("git");
        command
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = cwd {
            command.current_dir(cwd);
        }

        let output = tokio::select! {
            output = tokio::time::timeout(self.timeout, command.output()) => output,
            _ = signal.stopped() => return Err(Error::Cancelled),
        };
        let output = output
            .map_err(|_| Error::Timeout {
                what: format!("git {}", args.first().copied().unwrap_or_default()),
                elapsed: self.timeout,
            })?
            .context("failed to run git")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "git {} failed ({}): {}",
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim()
            )
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl RepoFetcher for GitFetcher {
    #[instrument(skip(self, signal), fields(dest = %dest.display()))]
    async fn fetch(&self, locator: &str, branch: &str, dest: &Path, signal: &StopSignal) -> Result<String> {
        if dest.exists() {
            tokio::fs::remove_dir_all(dest)
                .await
                .with_context(|| format!("failed to clear {}", dest.display()))?;
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let dest_str = dest.to_string_lossy();
        self.git(
            &[
                "clone",
                "--depth",
                "1",
                "--single-branch",
                "--branch",
                branch,
                "--",
                locator,
                &dest_str,
            ],
            None,
            signal,
        )
        .await?;

        let commit = self.git(&["rev-parse", "HEAD"], Some(dest), signal).await?;
        if commit.is_empty() {
            return Err(anyhow!("git rev-parse returned no commit").into());
        }
        debug!(commit = %commit, "repository cloned");
        Ok(commit)
    }
}

/// Accepts `http(s)://`, `ssh://`, `git://`, `file://` URLs and scp-like
/// `user@host:path` locators.
pub fn validate_locator(locator: &str) -> anyhow::Result<()> {
    let locator = locator.trim();
    if locator.is_empty() {
        bail!("repository locator is empty");
    }
    if locator.starts_with('-') || locator.chars().any(char::is_whitespace) {
        bail!("repository locator is malformed");
    }
    if let Ok(url) = reqwest::Url::parse(locator) {
        return match url.scheme() {
            "http" | "https" | "ssh" | "git" if url.host_str().is_some_and(|h| !h.is_empty()) => {
                if url.path().trim_matches('/').is_empty() {
                    bail!("repository locator has no path")
                }
                Ok(())
            }
            "file" => Ok(()),
            other => bail!("unsupported repository scheme: {other}"),
        };
    }
    match locator.split_once(':') {
        Some((host, path)) if host.contains('@') && !path.is_empty() && !host.ends_with('@') => Ok(()),
        _ => bail!("repository locator is not a URL: {locator}"),
    }
}

/// Turns an existing local directory into a `file://` locator.
pub fn local_locator(path: &Path) -> anyhow::Result<String> {
    let absolute = std::fs::canonicalize(path)
        .with_context(|| format!("failed to resolve {}", path.display()))?;
    reqwest::Url::from_directory_path(&absolute)
        .map(|url| url.to_string())
        .map_err(|()| anyhow!("not an absolute directory: {}", absolute.display()))
}

pub fn validate_branch(branch: &str) -> anyhow::Result<()> {
    if branch.is_empty() {
        bail!("branch is empty");
    }
    if branch.starts_with('-') || branch.contains("..") || branch.chars().any(|c| c.is_whitespace() || c.is_control()) {
        bail!("branch name is malformed: {branch}");
    }
    Ok(())
}

/// Display name derived from the locator's last path segment.
pub fn default_name(locator: &str) -> String {
    let trimmed = locator.trim().trim_end_matches('/');
    let last = trimmed
        .rsplit(['/', ':'])
        .next()
        .unwrap_or(trimmed);
    let name = last.strip_suffix(".git").unwrap_or(last);
    if name.is_empty() {
        "repository".to_string()
    } else {
        name.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_directories_become_file_locators() {
        let dir = tempfile::tempdir().unwrap();
        let locator = local_locator(dir.path()).unwrap();
        assert!(locator.starts_with("file:///"), "{locator}");
        validate_locator(&locator).unwrap();
        assert!(local_locator(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn accepts_common_locators() {
        for ok in [
            "https://github.com/acme/widgets.git",
            "http://git.internal/acme/widgets",
            "ssh://git@github.com/acme/widgets.git",
            "git@github.com:acme/widgets.git",
            "file:///srv/git/widgets",
        ] {
            validate_locator(ok).unwrap_or_else(|e| panic!("{ok}: {e}"));
        }
    }

    #[test]
    fn rejects_bad_locators() {
        for bad in ["", "   ", "not a url", "ftp://example.com/x", "https://example.com/", "--upload-pack=x", "host:path"] {
            assert!(validate_locator(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn branch_rules() {
        validate_branch("main").unwrap();
        validate_branch("release/2.x").unwrap();
        assert!(validate_branch("").is_err());
        assert!(validate_branch("-x").is_err());
        assert!(validate_branch("a..b").is_err());
        assert!(validate_branch("has space").is_err());
    }

    #[test]
    fn names_from_locators() {
        assert_eq!(default_name("https://github.com/acme/widgets.git"), "widgets");
        assert_eq!(default_name("git@github.com:acme/tools/"), "tools");
        assert_eq!(default_name("git@host:repo.git"), "repo");
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success())
    }

    fn run(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "t")
            .env("GIT_AUTHOR_EMAIL", "t@example.com")
            .env("GIT_COMMITTER_NAME", "t")
            .env("GIT_COMMITTER_EMAIL", "t@example.com")
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?}");
    }

    #[tokio::test]
    async fn clones_a_local_repository() {
        if !git_available() {
            return;
        }
        let origin = tempfile::tempdir().unwrap();
        run(origin.path(), &["init", "-q", "-b", "main"]);
        std::fs::write(origin.path().join("app.py"), "print('hi')\n").unwrap();
        run(origin.path(), &["add", "."]);
        run(origin.path(), &["commit", "-q", "-m", "init"]);

        let workspace = tempfile::tempdir().unwrap();
        let dest = workspace.path().join("repo_1");
        let locator = format!("file://{}", origin.path().display());
        let commit = GitFetcher::new(Duration::from_secs(60))
            .fetch(&locator, "main", &dest, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(commit.len(), 40);
        assert!(dest.join("app.py").exists());
    }

    #[tokio::test]
    async fn missing_branch_fails_with_git_message() {
        if !git_available() {
            return;
        }
        let origin = tempfile::tempdir().unwrap();
        run(origin.path(), &["init", "-q", "-b", "main"]);
        std::fs::write(origin.path().join("a.txt"), "a").unwrap();
        run(origin.path(), &["add", "."]);
        run(origin.path(), &["commit", "-q", "-m", "init"]);

        let workspace = tempfile::tempdir().unwrap();
        let err = GitFetcher::new(Duration::from_secs(60))
            .fetch(
                &format!("file://{}", origin.path().display()),
                "does-not-exist",
                &workspace.path().join("r"),
                &StopSignal::new(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("git clone failed"), "{err}");
    }

    #[tokio::test]
    async fn stopped_fetch_is_cancelled() {
        let signal = StopSignal::new();
        signal.request_stop();
        let workspace = tempfile::tempdir().unwrap();
        let err = GitFetcher::new(Duration::from_secs(60))
            .fetch("https://example.invalid/x.git", "main", &workspace.path().join("r"), &signal)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
