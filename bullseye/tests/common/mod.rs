#![allow(dead_code)]

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::mpsc;

use bullseye::cancel::StopSignal;
use bullseye::llm::{Credential, LlmAdapter, LlmError, LlmProvider, Prompt};
use bullseye::model::Page;
use bullseye::repo::RepoFetcher;
use bullseye::scanners::{RawFinding, RawResult, ScanTarget, ScannerAdapter, ScannerRegistry};
use bullseye::store::{SqliteStore, Store};
use bullseye::{Orchestrator, Settings};

pub const COMMIT: &str = "0123456789abcdef0123456789abcdef01234567";
pub const SHARED_RULE: &str = "shared-rule";

/// Two components under `src/`, one code file each.
pub const FIXTURE: &[(&str, &str)] = &[
    (
        "src/api/handlers.py",
        "import os\n\nTOKEN = \"s3cr3t\"\n\ndef handle(request):\n    return {\"user\": request.args.get(\"user\")}\n",
    ),
    (
        "src/core/engine.py",
        "import math\n\ndef score(values):\n    total = sum(values)\n    return math.sqrt(total) if total > 0 else 0\n",
    ),
];

/// Writes the fixture tree instead of cloning.
pub struct FixtureFetcher;

#[async_trait]
impl RepoFetcher for FixtureFetcher {
    async fn fetch(&self, _locator: &str, _branch: &str, dest: &Path, signal: &StopSignal) -> bullseye::Result<String> {
        signal.check()?;
        for (rel, content) in FIXTURE {
            let path = dest.join(rel);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
            }
            std::fs::write(&path, content).with_context(|| format!("failed to write {}", path.display()))?;
        }
        Ok(COMMIT.to_string())
    }
}

/// Reports one `shared-rule` hit on the first file of every component.
pub struct SharedRuleScanner(pub &'static str);

#[async_trait]
impl ScannerAdapter for SharedRuleScanner {
    async fn run(&self, target: &ScanTarget) -> anyhow::Result<RawResult> {
        let findings = target
            .files
            .first()
            .map(|file| RawFinding {
                rule_id: Some(SHARED_RULE.to_string()),
                severity: "HIGH".to_string(),
                title: "Shared rule hit".to_string(),
                file_path: Some(file.clone()),
                line_start: Some(1),
                code_snippet: Some("import os".to_string()),
                ..Default::default()
            })
            .into_iter()
            .collect();
        Ok(RawResult {
            raw_output: Some(format!("{} ran on {}", self.0, target.component)),
            findings,
        })
    }

    fn name(&self) -> &str {
        self.0
    }
}

pub struct BrokenScanner;

#[async_trait]
impl ScannerAdapter for BrokenScanner {
    async fn run(&self, _target: &ScanTarget) -> anyhow::Result<RawResult> {
        anyhow::bail!("scanner binary exploded")
    }

    fn name(&self) -> &str {
        "broken"
    }
}

/// Never finishes on its own.
pub struct HangingScanner;

#[async_trait]
impl ScannerAdapter for HangingScanner {
    async fn run(&self, _target: &ScanTarget) -> anyhow::Result<RawResult> {
        std::future::pending::<()>().await;
        Ok(RawResult::default())
    }

    fn name(&self) -> &str {
        "hanging"
    }
}

pub fn registry(adapters: Vec<Arc<dyn ScannerAdapter>>) -> ScannerRegistry {
    let mut registry = ScannerRegistry::new();
    for adapter in adapters {
        registry.register_universal(adapter);
    }
    registry
}

pub const FILE_REPLY: &str = r#"```json
{
  "summary": "Handles one concern.",
  "security_issues": [
    {"severity": "high", "title": "Hardcoded credential", "description": "A secret lives in source.", "line_hint": "line 3", "recommendation": "Read it from the environment."}
  ],
  "quality_issues": []
}
```"#;

const COMPONENT_REPLY: &str = r#"{"summary": "A small component.", "security_posture": "Acceptable.", "recommendations": []}"#;

pub const EXECUTIVE_REPLY: &str = "The codebase is small and mostly healthy.";

/// Start and end of every completed provider call, in completion order.
pub type Calls = Arc<Mutex<Vec<(Instant, Instant)>>>;

/// Answers by prompt kind after `delay`. With `hang_files` set, file prompts
/// announce themselves and never return.
#[derive(Clone)]
pub struct RecordingProvider {
    pub calls: Calls,
    delay: Duration,
    hang_files: Option<mpsc::UnboundedSender<String>>,
}

impl RecordingProvider {
    pub fn new(delay: Duration) -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            delay,
            hang_files: None,
        }
    }

    pub fn hanging_on_files() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let provider = Self {
            hang_files: Some(tx),
            ..Self::new(Duration::ZERO)
        };
        (provider, rx)
    }
}

struct RecordingAdapter(RecordingProvider);

#[async_trait]
impl LlmAdapter for RecordingAdapter {
    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError> {
        let started = Instant::now();
        let is_file = prompt.user.contains(" file: `");
        if is_file && let Some(tx) = &self.0.hang_files {
            let _ = tx.send(prompt.user.clone());
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.0.delay).await;
        self.0.calls.lock().unwrap().push((started, Instant::now()));

        let reply = if is_file {
            FILE_REPLY
        } else if prompt.user.contains(" component: `") {
            COMPONENT_REPLY
        } else {
            EXECUTIVE_REPLY
        };
        Ok(reply.to_string())
    }
}

impl LlmProvider for RecordingProvider {
    fn connect(&self, _credential: &Credential) -> Arc<dyn LlmAdapter> {
        Arc::new(RecordingAdapter(self.clone()))
    }

    fn name(&self) -> &str {
        "recording"
    }
}

pub struct Harness {
    pub orchestrator: Orchestrator,
    pub store: Arc<dyn Store>,
    pub workspace: tempfile::TempDir,
}

pub async fn harness(scanners: ScannerRegistry, provider: RecordingProvider) -> Harness {
    harness_with(scanners, provider, |_| {}).await
}

pub async fn harness_with(
    scanners: ScannerRegistry,
    provider: RecordingProvider,
    tweak: impl FnOnce(&mut Settings),
) -> Harness {
    let workspace = tempfile::tempdir().unwrap();
    let mut settings = Settings {
        workspace_dir: workspace.path().join("repos"),
        llm_request_delay_ms: 0,
        ..Settings::default()
    };
    tweak(&mut settings);

    let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
    let orchestrator = Orchestrator::builder(settings)
        .store(store.clone())
        .fetcher(Arc::new(FixtureFetcher))
        .scanners(scanners)
        .llm_provider(Arc::new(provider))
        .build()
        .await
        .unwrap();
    Harness {
        orchestrator,
        store,
        workspace,
    }
}

pub fn everything() -> Page {
    Page {
        limit: 10_000,
        offset: 0,
    }
}
