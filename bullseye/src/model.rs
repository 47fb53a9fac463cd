//! Entities owned by an analysis job and the value types that travel between
//! the executor, the store and observers.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a [`Job`].
///
/// The forward path is `pending → cloning → detecting_components → scanning →
/// analyzing → generating_report → completed`. `failed` and `cancelled` are
/// reachable from every non-terminal state. Terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Cloning,
    DetectingComponents,
    Scanning,
    Analyzing,
    GeneratingReport,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 9] = [
        JobStatus::Pending,
        JobStatus::Cloning,
        JobStatus::DetectingComponents,
        JobStatus::Scanning,
        JobStatus::Analyzing,
        JobStatus::GeneratingReport,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Cloning => "cloning",
            JobStatus::DetectingComponents => "detecting_components",
            JobStatus::Scanning => "scanning",
            JobStatus::Analyzing => "analyzing",
            JobStatus::GeneratingReport => "generating_report",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Position on the forward path; terminal jumps have no rank.
    fn rank(&self) -> Option<u8> {
        match self {
            JobStatus::Pending => Some(0),
            JobStatus::Cloning => Some(1),
            JobStatus::DetectingComponents => Some(2),
            JobStatus::Scanning => Some(3),
            JobStatus::Analyzing => Some(4),
            JobStatus::GeneratingReport => Some(5),
            JobStatus::Completed => Some(6),
            JobStatus::Failed | JobStatus::Cancelled => None,
        }
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Staying in the same non-terminal state is allowed so a stage can report
    /// intermediate progress.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(next, JobStatus::Failed | JobStatus::Cancelled) {
            return true;
        }
        match (self.rank(), next.rank()) {
            (Some(from), Some(to)) => to == from || to == from + 1,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match JobStatus::ALL.iter().find(|status| status.as_str() == s) {
            Some(status) => Ok(*status),
            None => bail!("unknown job status: {s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }

    /// Maps tool- and model-specific spellings onto the five levels.
    /// Anything unrecognised is `Info`.
    pub fn normalize(raw: &str) -> Severity {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" | "blocker" => Severity::Critical,
            "high" | "error" | "major" => Severity::High,
            "medium" | "moderate" | "warning" | "warn" => Severity::Medium,
            "low" | "minor" | "note" => Severity::Low,
            _ => Severity::Info,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match Severity::ALL.iter().find(|sev| sev.as_str() == s) {
            Some(sev) => Ok(*sev),
            None => bail!("unknown severity: {s} (valid: critical, high, medium, low, info)"),
        }
    }
}

macro_rules! text_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => bail!("unknown {}: {other}", stringify!($name)),
                }
            }
        }
    };
}

text_enum!(
    /// Per-component sub-state, independent of the job's stage.
    ComponentStatus {
        Pending => "pending",
        Scanning => "scanning",
        Scanned => "scanned",
        Analyzing => "analyzing",
        Completed => "completed",
        Failed => "failed",
    }
);

text_enum!(
    FileStatus {
        Pending => "pending",
        Analyzed => "analyzed",
        Skipped => "skipped",
        Failed => "failed",
    }
);

text_enum!(
    ScannerStatus {
        Running => "running",
        Completed => "completed",
        Failed => "failed",
    }
);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub commit_hash: Option<String>,
    pub status: JobStatus,
    pub status_message: Option<String>,
    pub progress: u32,
    pub progress_total: u32,
    pub progress_detail: Option<String>,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub config: serde_json::Value,
}

/// A validated submission, ready to be inserted as a `pending` job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub model: String,
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Component {
    pub id: Uuid,
    pub job_id: Uuid,
    pub name: String,
    pub path: String,
    pub component_type: String,
    pub language: Option<String>,
    pub file_count: u32,
    pub line_count: u64,
    pub status: ComponentStatus,
    pub findings_count: u32,
    pub health_score: Option<u32>,
    pub analysis_summary: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceFile {
    pub id: Uuid,
    pub component_id: Uuid,
    pub job_id: Uuid,
    pub path: String,
    pub language: Option<String>,
    pub size_bytes: u64,
    pub line_count: u64,
    pub status: FileStatus,
    pub analysis_summary: Option<String>,
}

/// Output of the detect stage for one component, before it has identities.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedComponent {
    pub name: String,
    pub path: String,
    pub component_type: String,
    pub language: String,
    pub line_count: u64,
    pub files: Vec<DetectedFile>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFile {
    pub path: String,
    pub language: String,
    pub size_bytes: u64,
    pub line_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub job_id: Uuid,
    pub component_id: Option<Uuid>,
    pub file_id: Option<Uuid>,
    pub scanner: String,
    pub rule_id: Option<String>,
    pub severity: Severity,
    pub category: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub file_path: Option<String>,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub code_snippet: Option<String>,
    pub suggestion: Option<String>,
    pub llm_explanation: Option<String>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// A normalized finding waiting to be inserted. The fingerprint is already
/// computed; the store only enforces its uniqueness per job.
#[derive(Debug, Clone)]
pub struct NewFinding {
    pub component_id: Option<Uuid>,
    pub file_id: Option<Uuid>,
    pub scanner: String,
    pub rule_id: Option<String>,
    pub severity: Severity,
    pub category: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub file_path: Option<String>,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub code_snippet: Option<String>,
    pub suggestion: Option<String>,
    pub llm_explanation: Option<String>,
    pub fingerprint: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FindingFilter {
    pub severity: Option<Severity>,
    pub scanner: Option<String>,
    pub component_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindingsSummary {
    pub critical: u32,
    pub high: u32,
    pub medium: u32,
    pub low: u32,
    pub info: u32,
    pub total: u32,
}

impl FindingsSummary {
    pub fn add(&mut self, severity: Severity, count: u32) {
        match severity {
            Severity::Critical => self.critical += count,
            Severity::High => self.high += count,
            Severity::Medium => self.medium += count,
            Severity::Low => self.low += count,
            Severity::Info => self.info += count,
        }
        self.total += count;
    }

    /// `100 - (25·critical + 10·high + 3·medium + 1·low)`, floored at zero.
    pub fn health_score(&self) -> u32 {
        let penalty = self
            .critical
            .saturating_mul(25)
            .saturating_add(self.high.saturating_mul(10))
            .saturating_add(self.medium.saturating_mul(3))
            .saturating_add(self.low);
        100u32.saturating_sub(penalty)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerResult {
    pub id: Uuid,
    pub job_id: Uuid,
    pub component_id: Option<Uuid>,
    pub scanner: String,
    pub status: ScannerStatus,
    pub findings_count: u32,
    pub raw_output: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of the append-only transition log. `seq` orders rows by emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub seq: i64,
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
    pub progress: u32,
    pub detail: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// A state-machine step as the executor hands it to the store.
#[derive(Debug, Clone)]
pub struct Transition {
    pub status: JobStatus,
    pub message: String,
    pub progress: u32,
    pub detail: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub job_id: Uuid,
    pub report_type: String,
    pub format: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Page {
    pub limit: u32,
    pub offset: u32,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    pub running: u32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Stats {
    pub jobs: JobCounts,
    pub findings: FindingsSummary,
}
