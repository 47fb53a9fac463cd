use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MODEL: &str = "deepseek-v3.2:cloud";

/// Cloud models offered when the configuration does not list its own.
pub const CLOUD_MODELS: &[(&str, &str)] = &[
    ("deepseek-v3.2:cloud", "DeepSeek V3.2 (cloud)"),
    ("deepseek-r1:70b", "DeepSeek R1 70B"),
    ("deepseek-r1:32b", "DeepSeek R1 32B"),
    ("deepseek-r1:14b", "DeepSeek R1 14B"),
    ("deepseek-r1:8b", "DeepSeek R1 8B"),
    ("deepseek-v3:671b", "DeepSeek V3 671B"),
    ("deepseek-v3.1:671b", "DeepSeek V3.1 671B"),
    ("gpt-oss:120b-cloud", "GPT-OSS 120B (cloud)"),
    ("kimi-k2-thinking:cloud", "Kimi K2 Thinking (cloud)"),
    ("qwq:32b", "QwQ 32B"),
    ("llama3.3:70b", "Llama 3.3 70B"),
    ("llama3.1:405b", "Llama 3.1 405B"),
    ("llama3.1:70b", "Llama 3.1 70B"),
    ("gemma3:27b", "Gemma 3 27B"),
    ("qwen2.5:72b", "Qwen 2.5 72B"),
    ("qwen2.5-coder:32b", "Qwen 2.5 Coder 32B"),
    ("mistral:7b", "Mistral 7B"),
    ("mixtral:8x22b", "Mixtral 8x22B"),
    ("command-r-plus:104b", "Command R+ 104B"),
    ("phi4:14b", "Phi-4 14B"),
];

/// An external tool run through [`crate::scanners::CommandScanner`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScannerConfig {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Component languages this scanner applies to. Empty means every component.
    #[serde(default)]
    pub languages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    pub bind: String,
    pub api_key: Option<String>,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8000".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_path: PathBuf,
    pub workspace_dir: PathBuf,
    pub default_branch: String,
    pub default_model: String,
    pub models: Vec<String>,
    pub ollama_api_url: String,
    pub ollama_api_key: Option<String>,
    pub llm_timeout_secs: u64,
    pub llm_request_delay_ms: u64,
    pub scanner_timeout_secs: u64,
    pub scanner_concurrency: usize,
    pub job_timeout_secs: u64,
    pub max_file_size_kb: u64,
    pub max_files_per_component: usize,
    pub max_code_chars: usize,
    pub event_buffer: usize,
    pub scanners: Vec<ScannerConfig>,
    pub api: ApiSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("data/bullseye.db"),
            workspace_dir: PathBuf::from("data/repos"),
            default_branch: "main".to_string(),
            default_model: DEFAULT_MODEL.to_string(),
            models: CLOUD_MODELS.iter().map(|(id, _)| id.to_string()).collect(),
            ollama_api_url: "https://ollama.com/api/chat".to_string(),
            ollama_api_key: None,
            llm_timeout_secs: 300,
            llm_request_delay_ms: 1000,
            scanner_timeout_secs: 600,
            scanner_concurrency: 4,
            job_timeout_secs: 3600,
            max_file_size_kb: 500,
            max_files_per_component: 50,
            max_code_chars: 12_000,
            event_buffer: 256,
            scanners: Vec::new(),
            api: ApiSettings::default(),
        }
    }
}

impl Settings {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(raw).context("failed to parse settings")?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid settings in {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.scanner_concurrency == 0 {
            bail!("scanner_concurrency must be at least 1");
        }
        if self.llm_timeout_secs == 0 || self.scanner_timeout_secs == 0 || self.job_timeout_secs == 0 {
            bail!("timeouts must be non-zero");
        }
        if self.event_buffer == 0 {
            bail!("event_buffer must be at least 1");
        }
        if self.models.is_empty() {
            bail!("at least one model must be permitted");
        }
        if self.default_branch.trim().is_empty() {
            bail!("default_branch must not be empty");
        }
        for scanner in &self.scanners {
            if scanner.name.trim().is_empty() || scanner.command.trim().is_empty() {
                bail!("scanner entries need a name and a command");
            }
        }
        Ok(())
    }

    /// The permitted model set always includes the default model.
    pub fn permitted_models(&self) -> Vec<String> {
        let mut models = self.models.clone();
        if !models.iter().any(|m| m == &self.default_model) {
            models.insert(0, self.default_model.clone());
        }
        models
    }

    pub fn is_permitted_model(&self, model: &str) -> bool {
        model == self.default_model || self.models.iter().any(|m| m == model)
    }

    pub fn llm_timeout(&self) -> Duration {
        Duration::from_secs(self.llm_timeout_secs)
    }

    pub fn llm_request_delay(&self) -> Duration {
        Duration::from_millis(self.llm_request_delay_ms)
    }

    pub fn scanner_timeout(&self) -> Duration {
        Duration::from_secs(self.scanner_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }
}
