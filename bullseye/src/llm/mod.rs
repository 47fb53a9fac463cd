use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub mod ollama;
pub mod parse;
pub mod prompts;
pub mod queue;

pub use ollama::{OllamaClient, OllamaProvider};
pub use queue::{AnalysisError, LaneSet, LlmQueue, NoopObserver, QueueObserver, QueuePhase};

/// Failure of a single provider call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider call timed out")]
    Timeout,

    #[error("credential rejected by provider")]
    InvalidCredential,

    #[error("provider error: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub model: String,
    pub system: String,
    pub user: String,
}

/// Opaque capability token for one lane. `Debug` and `Display` never show the
/// token itself.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(Option<String>);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Credential(Some(token.into()))
    }

    /// The lane used when no key is available at all.
    pub fn anonymous() -> Self {
        Credential(None)
    }

    pub fn token(&self) -> Option<&str> {
        self.0.as_deref()
    }

    /// Trims, drops blanks and repeats while keeping order, and falls back to
    /// `default` and then to the anonymous credential.
    pub fn normalize(tokens: &[String], default: Option<&str>) -> Vec<Credential> {
        let mut out: Vec<Credential> = Vec::new();
        for token in tokens.iter().map(|t| t.trim()).filter(|t| !t.is_empty()) {
            let credential = Credential::new(token);
            if !out.contains(&credential) {
                out.push(credential);
            }
        }
        if out.is_empty() {
            match default.map(str::trim).filter(|t| !t.is_empty()) {
                Some(token) => out.push(Credential::new(token)),
                None => out.push(Credential::anonymous()),
            }
        }
        out
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Credential(<redacted>)"),
            None => f.write_str("Credential(anonymous)"),
        }
    }
}

#[async_trait]
pub trait LlmAdapter: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<String, LlmError>;
}

/// Builds one adapter per credential; the queue calls it once per lane.
pub trait LlmProvider: Send + Sync {
    fn connect(&self, credential: &Credential) -> Arc<dyn LlmAdapter>;
    fn name(&self) -> &str;
}

/// Queue-level knobs taken from settings.
#[derive(Debug, Clone, Copy)]
pub struct QueueLimits {
    pub call_timeout: Duration,
    pub request_delay: Duration,
}
