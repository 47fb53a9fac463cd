use std::path::{Path, PathBuf};

use anyhow::Context;
use bullseye::Settings;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_verbosity_flag::{InfoLevel, Verbosity};

/// Analyze git repositories with external scanners and LLM review
#[derive(Parser)]
#[command(name = "bullseye", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// TOML settings file; unset fields keep their defaults
    #[arg(short, long, global = true, env = "BULLSEYE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    #[command(flatten)]
    pub overrides: Overrides,

    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Settings that can be set per invocation without a config file.
#[derive(Args, Debug, Default)]
pub struct Overrides {
    /// SQLite database path
    #[arg(long, global = true, env = "BULLSEYE_DATABASE")]
    pub database: Option<PathBuf>,

    /// Directory that holds per-job checkouts
    #[arg(long, global = true, env = "BULLSEYE_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Ollama chat endpoint
    #[arg(long, global = true, env = "OLLAMA_API_URL")]
    pub ollama_url: Option<String>,

    /// Credential used when a job brings none of its own
    #[arg(long, global = true, env = "OLLAMA_API_KEY", hide_env_values = true)]
    pub ollama_api_key: Option<String>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the HTTP API until interrupted
    Serve {
        /// Address to listen on
        #[arg(long, env = "BULLSEYE_BIND")]
        bind: Option<String>,

        /// Require this key in `x-api-key` or a bearer header
        #[arg(long, env = "BULLSEYE_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },

    /// Analyze one repository in-process and print the results
    Analyze {
        /// Repository URL, or a path to a local git checkout
        repo: String,

        #[arg(short, long)]
        branch: Option<String>,

        #[arg(short, long)]
        model: Option<String>,

        /// Display name for the job
        #[arg(long)]
        name: Option<String>,

        /// LLM credential; repeat to open one lane per key
        #[arg(long = "api-key", value_name = "KEY")]
        api_keys: Vec<String>,

        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the permitted models
    Models {
        #[arg(long)]
        json: bool,
    },
}

impl Cli {
    /// Resolves the effective settings: file (or defaults), then flags and
    /// environment.
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let mut settings = match &self.config {
            Some(path) => Settings::from_file(path)?,
            None => Settings::default(),
        };
        self.overrides.apply(&mut settings);
        if let Command::Serve { bind, api_key } = &self.command {
            if let Some(bind) = bind {
                settings.api.bind = bind.clone();
            }
            if let Some(key) = api_key {
                settings.api.api_key = Some(key.clone());
            }
        }
        settings.validate().context("invalid settings")?;
        Ok(settings)
    }
}

/// Existing local directories are handed to the engine as `file://` URLs;
/// anything else is passed through for the engine to validate.
pub fn repo_locator(repo: &str) -> anyhow::Result<String> {
    let path = Path::new(repo);
    if path.is_dir() {
        return bullseye::repo::local_locator(path);
    }
    Ok(repo.to_string())
}

impl Overrides {
    fn apply(&self, settings: &mut Settings) {
        if let Some(path) = &self.database {
            settings.database_path = path.clone();
        }
        if let Some(dir) = &self.workspace {
            settings.workspace_dir = dir.clone();
        }
        if let Some(url) = &self.ollama_url {
            settings.ollama_api_url = url.clone();
        }
        if let Some(key) = self.ollama_api_key.as_deref().filter(|k| !k.trim().is_empty()) {
            settings.ollama_api_key = Some(key.to_string());
        }
    }
}
