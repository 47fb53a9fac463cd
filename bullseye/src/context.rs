use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::cancel::StopSignal;
use crate::error::Result;
use crate::events::{EventHub, JobEvent};
use crate::llm::{Credential, QueueObserver, QueuePhase};
use crate::model::{Component, Job, JobStatus, SourceFile, StatusUpdate, Transition};
use crate::store::Store;

/// Linear position inside a stage's share of the 0..=100 range.
pub fn band_point(band: (u32, u32), done: usize, total: usize) -> u32 {
    let (start, end) = band;
    if total == 0 {
        return end;
    }
    let done = done.min(total) as u64;
    start + ((end - start) as u64 * done / total as u64) as u32
}

#[derive(Debug)]
struct Reported {
    status: JobStatus,
    progress: u32,
    message: String,
}

/// Single funnel for a job's state changes: persist, then publish.
///
/// Progress handed in is clamped so the stored value never goes down.
pub struct JobReporter {
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    job_id: Uuid,
    last: Mutex<Reported>,
}

impl JobReporter {
    pub fn new(store: Arc<dyn Store>, hub: Arc<EventHub>, job: &Job) -> Self {
        Self {
            store,
            hub,
            job_id: job.id,
            last: Mutex::new(Reported {
                status: job.status,
                progress: job.progress,
                message: job.status_message.clone().unwrap_or_default(),
            }),
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    pub async fn status(&self) -> JobStatus {
        self.last.lock().await.status
    }

    pub async fn progress(&self) -> u32 {
        self.last.lock().await.progress
    }

    async fn apply(
        &self,
        status: Option<JobStatus>,
        progress: Option<u32>,
        message: Option<String>,
        detail: Option<String>,
        error: Option<String>,
    ) -> Result<StatusUpdate> {
        let mut last = self.last.lock().await;
        let transition = Transition {
            status: status.unwrap_or(last.status),
            message: message.unwrap_or_else(|| last.message.clone()),
            progress: progress.map_or(last.progress, |p| p.clamp(last.progress, 100)),
            detail,
            error,
        };
        let update = self.store.record_transition(self.job_id, &transition).await?;
        last.status = update.status;
        last.progress = update.progress;
        last.message = update.message.clone();
        self.hub.publish(JobEvent::from(&update));
        Ok(update)
    }

    /// Moves the job into `status` (a new stage or a terminal state).
    #[instrument(skip(self, message, detail, error), fields(job_id = %self.job_id))]
    pub async fn enter(
        &self,
        status: JobStatus,
        progress: u32,
        message: impl Into<String>,
        detail: Option<String>,
        error: Option<String>,
    ) -> Result<StatusUpdate> {
        let message = message.into();
        info!(status = %status, progress, message = %message, "job transition");
        self.apply(Some(status), Some(progress), Some(message), detail, error)
            .await
    }

    /// Progress inside the current stage.
    pub async fn advance(&self, progress: u32, message: impl Into<String>, detail: Option<String>) -> Result<StatusUpdate> {
        self.apply(None, Some(progress), Some(message.into()), detail, None)
            .await
    }

    /// Only the detail line changes.
    pub async fn detail(&self, detail: impl Into<String>) -> Result<StatusUpdate> {
        self.apply(None, None, None, Some(detail.into()), None).await
    }
}

/// Routes queue phases of one unit of work into the job's progress detail.
pub struct DetailObserver {
    pub reporter: Arc<JobReporter>,
    pub label: String,
}

#[async_trait]
impl QueueObserver for DetailObserver {
    async fn on_phase(&self, lane: usize, phase: QueuePhase) {
        let detail = match phase {
            QueuePhase::Queued { ahead: 0 } => format!("{} (lane {lane})", self.label),
            QueuePhase::Queued { ahead } => format!("{} (lane {lane}, {ahead} ahead)", self.label),
            QueuePhase::Dispatched => format!("{} (lane {lane}, waiting for model)", self.label),
            QueuePhase::Completed => format!("{} (lane {lane}, done)", self.label),
            QueuePhase::Dropped => format!("{} (lane {lane}, dropped)", self.label),
        };
        if let Err(e) = self.reporter.detail(detail).await {
            tracing::debug!(error = %e, "progress detail not recorded");
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AnalysisTally {
    pub dispatched: u32,
    pub failed: u32,
    pub skipped: u32,
    pub findings: u32,
}

/// Everything a stage reads or produces for one job.
pub struct JobContext {
    pub job: Job,
    pub credentials: Vec<Credential>,
    pub signal: StopSignal,
    pub reporter: Arc<JobReporter>,
    pub store: Arc<dyn Store>,
    /// Where the repository is checked out; removed when the job ends.
    pub checkout: PathBuf,
    pub components: Vec<(Component, Vec<SourceFile>)>,
    pub analysis: AnalysisTally,
    pub last_completed_stage: Option<&'static str>,
}

impl JobContext {
    pub fn new(
        job: Job,
        credentials: Vec<Credential>,
        signal: StopSignal,
        reporter: Arc<JobReporter>,
        store: Arc<dyn Store>,
        checkout: PathBuf,
    ) -> Self {
        Self {
            job,
            credentials,
            signal,
            reporter,
            store,
            checkout,
            components: Vec::new(),
            analysis: AnalysisTally::default(),
            last_completed_stage: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NewJob, Page};
    use crate::store::SqliteStore;
    use futures::StreamExt;

    #[test]
    fn band_points_cover_the_band() {
        assert_eq!(band_point((15, 45), 0, 4), 15);
        assert_eq!(band_point((15, 45), 2, 4), 30);
        assert_eq!(band_point((15, 45), 4, 4), 45);
        assert_eq!(band_point((15, 45), 9, 4), 45);
        assert_eq!(band_point((45, 90), 0, 0), 90);
    }

    async fn reporter() -> (Arc<dyn Store>, Arc<EventHub>, JobReporter, Uuid) {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::in_memory().await.unwrap());
        let hub = Arc::new(EventHub::new(32));
        let (job, _) = store
            .create_job(NewJob {
                name: "r".into(),
                repo_url: "https://example.com/r.git".into(),
                branch: "main".into(),
                model: "m".into(),
                config: serde_json::json!({}),
            })
            .await
            .unwrap();
        let reporter = JobReporter::new(store.clone(), hub.clone(), &job);
        (store, hub, reporter, job.id)
    }

    #[tokio::test]
    async fn progress_never_goes_down() {
        let (store, _hub, reporter, job_id) = reporter().await;
        reporter.enter(JobStatus::Cloning, 3, "cloning", None, None).await.unwrap();
        reporter.advance(1, "still cloning", None).await.unwrap();
        assert_eq!(reporter.progress().await, 3);

        let log = store.status_updates(job_id, Page::default()).await.unwrap();
        let progress: Vec<u32> = log.iter().map(|u| u.progress).collect();
        assert_eq!(progress, vec![0, 3, 3]);
    }

    #[tokio::test]
    async fn transitions_are_published_after_commit() {
        let (store, hub, reporter, job_id) = reporter().await;
        let events = hub.subscribe(job_id);
        reporter.enter(JobStatus::Cloning, 1, "cloning", None, None).await.unwrap();
        reporter.detail("lane 0").await.unwrap();
        reporter
            .enter(JobStatus::Failed, 50, "failed", None, Some("boom".into()))
            .await
            .unwrap();

        let received: Vec<JobEvent> = events.collect().await;
        assert_eq!(received.len(), 3);
        assert_eq!(received[1].detail.as_deref(), Some("lane 0"));
        assert_eq!(received[1].message.as_deref(), Some("cloning"));
        assert_eq!(received[2].status, JobStatus::Failed);

        let job = store.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.error_message.as_deref(), Some("boom"));
    }
}
