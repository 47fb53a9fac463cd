//! Transactional persistence for jobs and everything they own.
//!
//! The executor only ever writes through [`Store`]; no transaction is held
//! across an await on anything other than the store itself.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::model::{
    Component, ComponentStatus, DetectedComponent, FileStatus, Finding, FindingFilter,
    FindingsSummary, Job, JobStatus, NewFinding, NewJob, Page, Report, ScannerResult,
    ScannerStatus, SourceFile, Stats, StatusUpdate, Transition,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts a `pending` job together with its first status-log row.
    async fn create_job(&self, job: NewJob) -> Result<(Job, StatusUpdate)>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn list_jobs(&self, status: Option<JobStatus>, page: Page) -> Result<Vec<Job>>;

    /// Applies one state-machine step: the job row update and the status-log
    /// insert commit together. Fails with `Conflict` when the job's current
    /// status does not permit `transition.status` (terminal jobs included).
    async fn record_transition(&self, job_id: Uuid, transition: &Transition) -> Result<StatusUpdate>;
    async fn set_commit(&self, job_id: Uuid, commit_hash: &str) -> Result<()>;
    /// Removes the job and every row it owns. Returns whether it existed.
    async fn delete_job(&self, job_id: Uuid) -> Result<bool>;
    /// Jobs whose status is not terminal.
    async fn unfinished_jobs(&self) -> Result<Vec<Job>>;
    /// Closes whatever a job left open when it stopped early: running scanner
    /// results become `failed` with `reason`, pending files `skipped`, and
    /// components mid-scan or mid-analysis `failed`. Returns the rows touched.
    async fn abandon_open_work(&self, job_id: Uuid, reason: &str) -> Result<u64>;

    async fn insert_components(
        &self,
        job_id: Uuid,
        components: &[DetectedComponent],
    ) -> Result<Vec<(Component, Vec<SourceFile>)>>;
    async fn list_components(&self, job_id: Uuid) -> Result<Vec<Component>>;
    async fn list_files(&self, component_id: Uuid) -> Result<Vec<SourceFile>>;
    async fn set_component_status(&self, component_id: Uuid, status: ComponentStatus) -> Result<()>;
    async fn set_component_health(
        &self,
        component_id: Uuid,
        findings_count: u32,
        health_score: u32,
    ) -> Result<()>;
    async fn set_component_summary(&self, component_id: Uuid, summary: &str) -> Result<()>;
    async fn set_file_status(
        &self,
        file_id: Uuid,
        status: FileStatus,
        summary: Option<&str>,
    ) -> Result<()>;

    /// Upsert-or-ignore on `(job_id, fingerprint)`. Returns `true` when the
    /// row is new, `false` when an earlier writer already holds the fingerprint.
    async fn insert_finding(&self, job_id: Uuid, finding: &NewFinding) -> Result<bool>;
    async fn list_findings(&self, job_id: Uuid, filter: &FindingFilter) -> Result<Vec<Finding>>;
    async fn findings_summary(&self, job_id: Uuid) -> Result<FindingsSummary>;
    async fn component_findings_summary(&self, component_id: Uuid) -> Result<FindingsSummary>;

    async fn start_scanner_result(
        &self,
        job_id: Uuid,
        component_id: Option<Uuid>,
        scanner: &str,
    ) -> Result<Uuid>;
    async fn finish_scanner_result(
        &self,
        result_id: Uuid,
        status: ScannerStatus,
        findings_count: u32,
        raw_output: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()>;
    async fn list_scanner_results(&self, job_id: Uuid) -> Result<Vec<ScannerResult>>;

    /// Status-log rows in emission order.
    async fn status_updates(&self, job_id: Uuid, page: Page) -> Result<Vec<StatusUpdate>>;

    async fn save_report(
        &self,
        job_id: Uuid,
        report_type: &str,
        format: &str,
        content: &str,
    ) -> Result<Report>;
    async fn get_report(&self, job_id: Uuid, report_type: &str) -> Result<Option<Report>>;

    async fn stats(&self) -> Result<Stats>;
}
