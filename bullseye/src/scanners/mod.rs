use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::config::ScannerConfig;

pub mod command;

pub use command::CommandScanner;

/// What a scanner is pointed at: one component of a checked-out repository.
#[derive(Debug, Clone)]
pub struct ScanTarget {
    pub component: String,
    /// Checkout root; finding paths are reported relative to it.
    pub repo_root: PathBuf,
    /// Component directory, absolute.
    pub root: PathBuf,
    pub language: Option<String>,
    /// Files of the component, relative to `repo_root`.
    pub files: Vec<String>,
}

/// One issue as a tool reports it, before severity normalization and fingerprinting.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RawFinding {
    #[serde(alias = "rule", alias = "check_id", alias = "test_id")]
    pub rule_id: Option<String>,
    #[serde(alias = "level", alias = "issue_severity")]
    pub severity: String,
    pub category: Option<String>,
    #[serde(alias = "message", alias = "issue_text")]
    pub title: String,
    pub description: Option<String>,
    #[serde(alias = "path", alias = "file", alias = "filename")]
    pub file_path: Option<String>,
    #[serde(alias = "line", alias = "line_number")]
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    #[serde(alias = "code")]
    pub code_snippet: Option<String>,
    #[serde(alias = "fix", alias = "recommendation")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RawResult {
    pub raw_output: Option<String>,
    pub findings: Vec<RawFinding>,
}

#[async_trait]
pub trait ScannerAdapter: Send + Sync {
    async fn run(&self, target: &ScanTarget) -> anyhow::Result<RawResult>;
    fn name(&self) -> &str;
}

/// Scanners that apply to every component, plus scanners keyed by component language.
#[derive(Default, Clone)]
pub struct ScannerRegistry {
    universal: Vec<Arc<dyn ScannerAdapter>>,
    by_language: HashMap<String, Vec<Arc<dyn ScannerAdapter>>>,
}

impl ScannerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(scanners: &[ScannerConfig]) -> Self {
        let mut registry = Self::new();
        for config in scanners {
            let adapter: Arc<dyn ScannerAdapter> = Arc::new(CommandScanner::from_config(config));
            if config.languages.is_empty() {
                registry.register_universal(adapter);
            } else {
                for language in &config.languages {
                    registry.register_for(language, adapter.clone());
                }
            }
        }
        registry
    }

    pub fn register_universal(&mut self, adapter: Arc<dyn ScannerAdapter>) -> &mut Self {
        self.universal.push(adapter);
        self
    }

    pub fn register_for(&mut self, language: &str, adapter: Arc<dyn ScannerAdapter>) -> &mut Self {
        self.by_language
            .entry(language.to_ascii_lowercase())
            .or_default()
            .push(adapter);
        self
    }

    /// Universal scanners first, then the language's own, without repeats by name.
    pub fn applicable(&self, language: Option<&str>) -> Vec<Arc<dyn ScannerAdapter>> {
        let specific = language
            .and_then(|l| self.by_language.get(&l.to_ascii_lowercase()))
            .into_iter()
            .flatten();

        let mut selected: Vec<Arc<dyn ScannerAdapter>> = Vec::new();
        for adapter in self.universal.iter().chain(specific) {
            if !selected.iter().any(|s| s.name() == adapter.name()) {
                selected.push(adapter.clone());
            }
        }
        selected
    }

    pub fn is_empty(&self) -> bool {
        self.universal.is_empty() && self.by_language.is_empty()
    }
}
