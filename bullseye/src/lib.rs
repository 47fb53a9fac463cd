//! Repository analysis engine: clones a repository, splits it into
//! components, runs external scanners and LLM review over them, and keeps a
//! durable, replayable progress log for every job.

pub mod api;
pub mod cancel;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod detect;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod llm;
pub mod model;
pub mod orchestrator;
pub mod pipeline;
pub mod repo;
pub mod scanners;
pub mod stages;
pub mod store;

pub use config::Settings;
pub use error::{Error, Result};
pub use events::{EventStream, JobEvent};
pub use model::{Finding, FindingsSummary, Job, JobStatus, Severity};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, SubmitRequest};
