//! Public face of the job engine: submission, control and reads.
//!
//! Every submitted job gets its own task running the shared [`Pipeline`]. The
//! task is the only writer of that job's state until it reaches a terminal
//! status.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use futures::future::join_all;
use futures::stream;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, instrument, warn};
use uuid::Uuid;

use crate::cancel::{CancellationController, StopSignal};
use crate::config::Settings;
use crate::context::{JobContext, JobReporter};
use crate::coordinator::ScanCoordinator;
use crate::detect::ComponentDetector;
use crate::error::{Error, Result};
use crate::events::{EventHub, EventStream, JobEvent};
use crate::llm::{Credential, LlmProvider, LlmQueue, OllamaProvider, QueueLimits};
use crate::model::{
    Component, Finding, FindingFilter, FindingsSummary, Job, JobStatus, NewJob, Page, Report,
    ScannerResult, Stats, StatusUpdate, Transition,
};
use crate::pipeline::{Pipeline, PipelineBuilder};
use crate::repo::{GitFetcher, RepoFetcher, default_name, validate_branch, validate_locator};
use crate::scanners::ScannerRegistry;
use crate::stages::report::FULL_REPORT;
use crate::stages::{AnalyzeStage, CloneStage, DetectStage, ReportStage, ScanStage};
use crate::store::{SqliteStore, Store};

pub const MAX_PAGE: u32 = 100;
const RESTART_ERROR: &str = "interrupted by restart";

/// A request to analyze one repository.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SubmitRequest {
    pub repo_url: String,
    pub branch: Option<String>,
    pub name: Option<String>,
    pub model: Option<String>,
    /// Capability tokens, one LLM lane each. Never stored.
    pub api_keys: Vec<String>,
}

impl SubmitRequest {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    settings: Arc<Settings>,
    store: Arc<dyn Store>,
    hub: Arc<EventHub>,
    cancels: Arc<CancellationController>,
    pipeline: Pipeline,
    queue: Arc<LlmQueue>,
    running: Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>,
}

impl Orchestrator {
    pub fn builder(settings: Settings) -> OrchestratorBuilder {
        OrchestratorBuilder::new(settings)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Process-wide LLM lanes opened so far.
    pub fn lane_count(&self) -> usize {
        self.queue.lane_count()
    }

    /// Validates the request, records a `pending` job and starts driving it.
    #[instrument(skip(self, request), fields(repo = %request.repo_url))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<Job> {
        let repo_url = request.repo_url.trim().to_string();
        validate_locator(&repo_url).map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let branch = non_blank(request.branch).unwrap_or_else(|| self.settings.default_branch.clone());
        validate_branch(&branch).map_err(|e| Error::InvalidRequest(e.to_string()))?;

        let model = non_blank(request.model).unwrap_or_else(|| self.settings.default_model.clone());
        if !self.settings.is_permitted_model(&model) {
            return Err(Error::InvalidRequest(format!("model is not permitted: {model}")));
        }
        let name = non_blank(request.name).unwrap_or_else(|| default_name(&repo_url));

        let credentials = Credential::normalize(&request.api_keys, self.settings.ollama_api_key.as_deref());
        let config = json!({
            "llm_lanes": credentials.len(),
            "scanner_concurrency": self.settings.scanner_concurrency,
            "max_files_per_component": self.settings.max_files_per_component,
        });

        let (job, first) = self
            .store
            .create_job(NewJob {
                name,
                repo_url,
                branch,
                model,
                config,
            })
            .await?;
        self.hub.publish(JobEvent::from(&first));

        let signal = self.cancels.register(job.id);
        self.spawn_drive(job.clone(), credentials, signal);
        info!(job_id = %job.id, "job submitted");
        Ok(job)
    }

    fn spawn_drive(&self, job: Job, credentials: Vec<Credential>, signal: StopSignal) {
        let job_id = job.id;
        let reporter = Arc::new(JobReporter::new(self.store.clone(), self.hub.clone(), &job));
        let checkout = self.settings.workspace_dir.join(format!("repo_{job_id}"));
        let mut ctx = JobContext::new(job, credentials, signal, reporter, self.store.clone(), checkout);

        let pipeline = self.pipeline.clone();
        let cancels = self.cancels.clone();
        let hub = self.hub.clone();
        let running = self.running.clone();

        // Held across the spawn so the task cannot remove its entry before it exists.
        let mut tasks = self.running.lock().unwrap_or_else(|e| e.into_inner());
        let handle = tokio::spawn(
            async move {
                pipeline.run_one(&mut ctx).await;
                cancels.release(job_id);
                hub.close(job_id);
                running
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&job_id);
            }
            .instrument(info_span!("job", job_id = %job_id)),
        );
        tasks.insert(job_id, handle);
    }

    /// Requests a cooperative stop. Idempotent; a terminal job is returned
    /// unchanged.
    #[instrument(skip(self))]
    pub async fn stop(&self, job_id: Uuid) -> Result<Job> {
        let job = self.job(job_id).await?;
        if job.status.is_terminal() {
            return Ok(job);
        }
        if self.cancels.request_stop(job_id) {
            info!("stop requested");
            return Ok(job);
        }

        // Nothing in this process drives the job; close it out directly.
        let transition = Transition {
            status: JobStatus::Cancelled,
            message: "Analysis cancelled".to_string(),
            progress: job.progress,
            detail: Some("stopped while not running".to_string()),
            error: None,
        };
        self.store.abandon_open_work(job_id, "cancelled").await?;
        match self.store.record_transition(job_id, &transition).await {
            Ok(update) => self.hub.publish(JobEvent::from(&update)),
            Err(Error::Conflict(_)) => {}
            Err(e) => return Err(e),
        }
        self.job(job_id).await
    }

    /// Removes a finished job and everything it owns.
    #[instrument(skip(self))]
    pub async fn delete(&self, job_id: Uuid) -> Result<()> {
        let job = self.job(job_id).await?;
        if !job.status.is_terminal() {
            return Err(Error::Conflict(format!(
                "job {job_id} is {}; stop it before deleting",
                job.status
            )));
        }
        if !self.store.delete_job(job_id).await? {
            return Err(Error::NotFound(format!("job {job_id}")));
        }
        self.hub.close(job_id);
        info!("job deleted");
        Ok(())
    }

    pub async fn job(&self, job_id: Uuid) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("job {job_id}")))
    }

    pub async fn list_jobs(&self, status: Option<JobStatus>, page: Page) -> Result<Vec<Job>> {
        self.store.list_jobs(status, clamp(page)).await
    }

    pub async fn status_updates(&self, job_id: Uuid, page: Page) -> Result<Vec<StatusUpdate>> {
        self.job(job_id).await?;
        self.store.status_updates(job_id, clamp(page)).await
    }

    pub async fn components(&self, job_id: Uuid) -> Result<Vec<Component>> {
        self.job(job_id).await?;
        self.store.list_components(job_id).await
    }

    pub async fn findings(&self, job_id: Uuid, filter: &FindingFilter) -> Result<Vec<Finding>> {
        self.job(job_id).await?;
        self.store.list_findings(job_id, filter).await
    }

    pub async fn findings_summary(&self, job_id: Uuid) -> Result<FindingsSummary> {
        self.job(job_id).await?;
        self.store.findings_summary(job_id).await
    }

    pub async fn scanner_results(&self, job_id: Uuid) -> Result<Vec<ScannerResult>> {
        self.job(job_id).await?;
        self.store.list_scanner_results(job_id).await
    }

    pub async fn report(&self, job_id: Uuid) -> Result<Report> {
        self.job(job_id).await?;
        self.store
            .get_report(job_id, FULL_REPORT)
            .await?
            .ok_or_else(|| Error::NotFound(format!("report for job {job_id}")))
    }

    pub async fn stats(&self) -> Result<Stats> {
        self.store.stats().await
    }

    pub fn models(&self) -> Vec<String> {
        self.settings.permitted_models()
    }

    /// Live events for a job, starting with a snapshot of its current row.
    /// A job that is already terminal yields only the snapshot.
    pub async fn watch(&self, job_id: Uuid) -> Result<EventStream> {
        // Subscribe before reading so nothing between the two is lost.
        let live = self.hub.subscribe(job_id);
        let job = match self.job(job_id).await {
            Ok(job) => job,
            Err(e) => {
                self.hub.close(job_id);
                return Err(e);
            }
        };
        let snapshot = JobEvent::snapshot(&job);
        if job.status.is_terminal() {
            if !self.running.lock().unwrap_or_else(|e| e.into_inner()).contains_key(&job_id) {
                self.hub.close(job_id);
            }
            return Ok(stream::once(async move { snapshot }).boxed());
        }
        Ok(stream::once(async move { snapshot }).chain(live).boxed())
    }

    /// Resolves once the job is terminal.
    pub async fn wait(&self, job_id: Uuid) -> Result<Job> {
        let mut events = self.watch(job_id).await?;
        while events.next().await.is_some() {}
        self.job(job_id).await
    }

    pub fn is_running(&self, job_id: Uuid) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(&job_id)
    }

    /// Stops every job this process drives and waits for their tasks.
    pub async fn shutdown(&self) {
        let handles: Vec<(Uuid, JoinHandle<()>)> = self
            .running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .collect();
        for (job_id, _) in &handles {
            self.cancels.request_stop(*job_id);
        }
        info!(jobs = handles.len(), "waiting for running jobs to stop");
        for result in join_all(handles.into_iter().map(|(_, handle)| handle)).await {
            if let Err(e) = result {
                warn!(error = %e, "job task ended abnormally");
            }
        }
    }

    /// Fails jobs a previous process left unfinished.
    async fn recover(&self) -> Result<usize> {
        let stale = self.store.unfinished_jobs().await?;
        for job in &stale {
            let transition = Transition {
                status: JobStatus::Failed,
                message: format!("Analysis failed: {RESTART_ERROR}"),
                progress: job.progress,
                detail: None,
                error: Some(RESTART_ERROR.to_string()),
            };
            self.store.abandon_open_work(job.id, RESTART_ERROR).await?;
            match self.store.record_transition(job.id, &transition).await {
                Ok(_) | Err(Error::Conflict(_)) => {}
                Err(e) => return Err(e),
            }
            warn!(job_id = %job.id, status = %job.status, "unfinished job marked failed");
        }
        Ok(stale.len())
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn clamp(page: Page) -> Page {
    Page {
        limit: page.limit.clamp(1, MAX_PAGE),
        offset: page.offset,
    }
}

/// Wires the stages from settings; every collaborator can be replaced.
pub struct OrchestratorBuilder {
    settings: Settings,
    store: Option<Arc<dyn Store>>,
    fetcher: Option<Arc<dyn RepoFetcher>>,
    scanners: Option<ScannerRegistry>,
    provider: Option<Arc<dyn LlmProvider>>,
}

impl OrchestratorBuilder {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            store: None,
            fetcher: None,
            scanners: None,
            provider: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn fetcher(mut self, fetcher: Arc<dyn RepoFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    pub fn scanners(mut self, scanners: ScannerRegistry) -> Self {
        self.scanners = Some(scanners);
        self
    }

    pub fn llm_provider(mut self, provider: Arc<dyn LlmProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub async fn build(self) -> Result<Orchestrator> {
        let settings = self.settings;
        settings.validate()?;

        let store: Arc<dyn Store> = match self.store {
            Some(store) => store,
            None => Arc::new(SqliteStore::open(&settings.database_path).await?),
        };
        let fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(GitFetcher::new(settings.job_timeout())));
        let scanners = self
            .scanners
            .unwrap_or_else(|| ScannerRegistry::from_config(&settings.scanners));
        let provider: Arc<dyn LlmProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(OllamaProvider::new(
                settings.ollama_api_url.clone(),
                settings.llm_timeout(),
            )?),
        };

        let queue = Arc::new(LlmQueue::new(
            provider,
            QueueLimits {
                call_timeout: settings.llm_timeout(),
                request_delay: settings.llm_request_delay(),
            },
        ));
        let coordinator = Arc::new(ScanCoordinator::new(
            scanners,
            store.clone(),
            settings.scanner_timeout(),
            settings.scanner_concurrency,
        ));
        let pipeline = PipelineBuilder::new()
            .stage(CloneStage::new(fetcher))
            .stage(DetectStage::new(ComponentDetector::new(
                settings.max_file_size_kb,
                settings.max_files_per_component,
            )))
            .stage(ScanStage::new(coordinator))
            .stage(AnalyzeStage::new(queue.clone(), settings.max_code_chars))
            .stage(ReportStage::new(queue.clone()))
            .job_timeout(settings.job_timeout())
            .build();

        let orchestrator = Orchestrator {
            hub: Arc::new(EventHub::new(settings.event_buffer)),
            settings: Arc::new(settings),
            store,
            cancels: Arc::new(CancellationController::new()),
            pipeline,
            queue,
            running: Arc::new(Mutex::new(HashMap::new())),
        };
        let recovered = orchestrator.recover().await?;
        if recovered > 0 {
            info!(recovered, "recovered unfinished jobs");
        }
        Ok(orchestrator)
    }
}
