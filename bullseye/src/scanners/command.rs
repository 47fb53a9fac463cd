use std::process::Stdio;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{RawFinding, RawResult, ScanTarget, ScannerAdapter};
use crate::config::ScannerConfig;

/// Runs an external tool inside the component directory and reads its
/// findings as JSON from stdout.
///
/// `{path}` in an argument is replaced by the component directory. Exit codes
/// 0 and 1 both count as success, since most linters exit 1 when they find
/// something.
#[derive(Debug, Clone)]
pub struct CommandScanner {
    name: String,
    command: String,
    args: Vec<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Output {
    List(Vec<RawFinding>),
    Wrapped {
        #[serde(alias = "results")]
        findings: Vec<RawFinding>,
    },
}

impl CommandScanner {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
        }
    }

    pub fn from_config(config: &ScannerConfig) -> Self {
        Self::new(&config.name, &config.command, config.args.clone())
    }
}

fn parse_output(stdout: &str) -> Result<Vec<RawFinding>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let output: Output = serde_json::from_str(trimmed).context("scanner output is not a JSON finding list")?;
    Ok(match output {
        Output::List(findings) => findings,
        Output::Wrapped { findings } => findings,
    })
}

#[async_trait]
impl ScannerAdapter for CommandScanner {
    #[instrument(skip(self, target), fields(scanner = %self.name, component = %target.component))]
    async fn run(&self, target: &ScanTarget) -> Result<RawResult> {
        let dir = target.root.to_string_lossy();
        let args: Vec<String> = self.args.iter().map(|a| a.replace("{path}", &dir)).collect();

        let output = Command::new(&self.command)
            .args(&args)
            .current_dir(&target.root)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("failed to start {}", self.command))?;

        let code = output.status.code();
        if !matches!(code, Some(0) | Some(1)) {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                self.command,
                code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                stderr.trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let findings = parse_output(&stdout)?;
        debug!(count = findings.len(), "scanner output parsed");
        Ok(RawResult {
            raw_output: Some(stdout),
            findings,
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(dir: &std::path::Path) -> ScanTarget {
        ScanTarget {
            component: "api".into(),
            repo_root: dir.to_path_buf(),
            root: dir.to_path_buf(),
            language: Some("python".into()),
            files: vec![],
        }
    }

    fn sh(name: &str, script: &str) -> CommandScanner {
        CommandScanner::new(name, "sh", vec!["-c".into(), script.into()])
    }

    #[test]
    fn parses_bare_and_wrapped_lists() {
        let bare = parse_output(r#"[{"rule_id": "R1", "severity": "high", "title": "t"}]"#).unwrap();
        assert_eq!(bare.len(), 1);
        let wrapped = parse_output(r#"{"results": [{"title": "a"}, {"title": "b"}]}"#).unwrap();
        assert_eq!(wrapped.len(), 2);
        assert!(parse_output("  \n").unwrap().is_empty());
        assert!(parse_output("not json").is_err());
    }

    #[test]
    fn reads_bandit_reports() {
        let report = r#"{
            "errors": [],
            "metrics": {},
            "results": [{
                "code": "3 TOKEN = \"s3cr3t\"\n",
                "filename": "./app.py",
                "issue_confidence": "MEDIUM",
                "issue_severity": "LOW",
                "issue_text": "Possible hardcoded password: 's3cr3t'",
                "line_number": 3,
                "test_id": "B105",
                "test_name": "hardcoded_password_string"
            }]
        }"#;
        let findings = parse_output(report).unwrap();
        assert_eq!(findings.len(), 1);
        let finding = &findings[0];
        assert_eq!(finding.rule_id.as_deref(), Some("B105"));
        assert_eq!(finding.severity, "LOW");
        assert!(finding.title.starts_with("Possible hardcoded password"));
        assert_eq!(finding.file_path.as_deref(), Some("./app.py"));
        assert_eq!(finding.line_start, Some(3));
    }

    #[tokio::test]
    async fn exit_code_one_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = sh(
            "lint",
            r#"echo '[{"rule_id":"E1","severity":"low","title":"x","file_path":"a.py","line_start":2}]'; exit 1"#,
        );
        let result = scanner.run(&target(dir.path())).await.unwrap();
        assert_eq!(result.findings.len(), 1);
        assert_eq!(result.findings[0].line_start, Some(2));
        assert!(result.raw_output.unwrap().contains("E1"));
    }

    #[tokio::test]
    async fn other_exit_codes_fail_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = sh("broken", "echo 'config missing' >&2; exit 3");
        let err = scanner.run(&target(dir.path())).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("exited with 3"), "{message}");
        assert!(message.contains("config missing"));
    }

    #[tokio::test]
    async fn runs_in_the_component_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let scanner = sh(
            "pwd",
            r#"test -f marker.txt && echo '[{"title":"found marker"}]'"#,
        );
        let result = scanner.run(&target(dir.path())).await.unwrap();
        assert_eq!(result.findings[0].title, "found marker");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = CommandScanner::new("ghost", "definitely-not-a-real-scanner-binary", vec![]);
        assert!(scanner.run(&target(dir.path())).await.is_err());
    }
}
